// Prevents additional console window on Windows in release
#![cfg_attr(not(debug_assertions), windows_subsystem = "windows")]

mod autostart;
mod config;
mod engine;
mod error;
mod monitor;
mod player;
mod probe;
mod shell;
mod state;
mod telemetry;
mod types;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use tauri::Manager;

use crate::config::{ConfigStore, DEFAULT_CONFIG_FILE};
use crate::engine::{MpvEngine, MpvSettings};
use crate::monitor::{HealthMonitor, MonitorSettings};
use crate::player::StreamPlayer;
use crate::probe::PingProbe;
use crate::shell::ShellState;
use crate::types::DisplaySurface;

/// Kiosk viewer for an NVR's RTSP stream.
#[derive(Parser, Debug, Clone)]
#[command(name = "nvr-viewer", version, about)]
struct Args {
    /// Configuration file
    #[arg(long, env = "NVR_VIEWER_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// mpv binary used for playback
    #[arg(long, env = "NVR_VIEWER_MPV", default_value = "mpv")]
    mpv: PathBuf,

    /// Render into an existing window instead of a fullscreen one
    #[arg(long, value_name = "ID", conflicts_with = "windowed")]
    wid: Option<i64>,

    /// Bordered window instead of fullscreen (for debugging)
    #[arg(long)]
    windowed: bool,

    /// Start the viewer with the desktop session, then exit
    #[arg(long, conflicts_with = "remove_autostart")]
    install_autostart: bool,

    /// Remove the desktop session entry, then exit
    #[arg(long)]
    remove_autostart: bool,
}

impl Args {
    fn surface(&self) -> DisplaySurface {
        match (self.wid, self.windowed) {
            (Some(wid), _) => DisplaySurface::Embedded(wid),
            (None, true) => DisplaySurface::Windowed,
            (None, false) => DisplaySurface::Fullscreen,
        }
    }
}

fn main() {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .init();

    let args = Args::parse();

    if args.install_autostart || args.remove_autostart {
        std::process::exit(update_autostart(&args));
    }

    log::info!("Starting NVR viewer");
    shell::disable_screen_blanking();

    tauri::Builder::default()
        .invoke_handler(tauri::generate_handler![
            shell::admin_unlock,
            shell::admin_stats,
            shell::admin_status,
            shell::admin_save,
            shell::admin_refresh,
            shell::admin_close,
            shell::admin_exit,
        ])
        .setup(move |app| setup_app(app, &args))
        .build(tauri::generate_context!())
        .expect("error while building tauri application")
        .run(run_handler);
}

fn update_autostart(args: &Args) -> i32 {
    match autostart::set_enabled(&args.config, args.install_autostart) {
        Ok(()) => {
            log::info!(
                "Autostart is now {}",
                if autostart::is_enabled(&args.config) { "on" } else { "off" }
            );
            0
        }
        Err(e) => {
            log::error!("Failed to update autostart: {:#}", e);
            1
        }
    }
}

fn setup_app(app: &mut tauri::App, args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    log::info!("Setting up application");

    let store = ConfigStore::new(&args.config);
    let loaded = store.load();
    if let Some(notice) = &loaded.notice {
        log::warn!("{}", notice);
    }
    log::info!(
        "Using config {:?}{}",
        store.path(),
        if loaded.using_defaults() { " (defaults)" } else { "" }
    );

    // Video surface first, so the key bindings work even before a stream opens
    let surface = args.surface();
    let mut settings = MpvSettings::new(&args.mpv);
    settings.key_bindings = shell::key_bindings();
    let engine = MpvEngine::new(settings);
    let handle = app.handle().clone();
    engine.set_event_hook(Arc::new(move |event| {
        shell::handle_engine_event(&handle, event)
    }));

    let mut player = StreamPlayer::new(engine, surface);
    match player.engine_mut().launch(surface) {
        Ok(()) => log::info!("Player engine started"),
        Err(e) => {
            // The watchdog keeps retrying through open()
            log::error!("Failed to start player engine: {}", e);
        }
    }

    let viewer = state::create_context(
        loaded.config,
        store,
        player,
        HealthMonitor::new(MonitorSettings::default()),
    );
    viewer.lock().refresh_stream();

    let running = Arc::new(AtomicBool::new(true));
    tauri::async_runtime::spawn(state::run_watchdog(
        viewer.clone(),
        Arc::new(PingProbe::default()),
        running.clone(),
    ));

    // Setup signal handler for Ctrl+C (SIGINT) and SIGTERM
    let viewer_for_signal = viewer.clone();
    let running_for_signal = running.clone();
    ctrlc::set_handler(move || {
        log::info!("Received interrupt signal, stopping player...");
        running_for_signal.store(false, Ordering::SeqCst);
        viewer_for_signal.lock().shutdown();
        std::process::exit(0);
    })?;

    if let Some(window) = app.get_webview_window(shell::ADMIN_WINDOW) {
        shell::guard_admin_window(&window);
    } else {
        log::warn!("Admin window {:?} not configured", shell::ADMIN_WINDOW);
    }

    app.manage(ShellState::new(viewer, running));

    Ok(())
}

fn run_handler(app_handle: &tauri::AppHandle, event: tauri::RunEvent) {
    match event {
        tauri::RunEvent::ExitRequested { code, api, .. } => {
            // Only an explicit exit stops the kiosk, not the last window going away
            if code.is_none() {
                api.prevent_exit();
            }
        }
        tauri::RunEvent::Exit => {
            log::info!("App exit event received, stopping player...");

            if let Some(shell) = app_handle.try_state::<ShellState>() {
                shell.running.store(false, Ordering::SeqCst);
                shell.viewer.lock().shutdown();
            }
        }
        _ => {}
    }
}
