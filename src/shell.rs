use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tauri::{AppHandle, Manager, Runtime, State, WebviewWindow, WindowEvent};

use crate::config::ViewerConfig;
use crate::engine::{EngineEvent, KeyBinding, MpvEngine};
use crate::state::SharedContext;
use crate::telemetry::{StatsView, TelemetrySampler};
use crate::types::{AdminView, SaveReport, SettingsForm};

/// Label of the hidden admin window in tauri.conf.json.
pub const ADMIN_WINDOW: &str = "admin";

const ADMIN_MESSAGE: &str = "nvr-admin";
const EXIT_MESSAGE: &str = "nvr-exit";

pub type Viewer = SharedContext<MpvEngine>;

/// Keys the video window forwards to us instead of handling itself.
pub fn key_bindings() -> Vec<KeyBinding> {
    vec![
        KeyBinding::new("Ctrl+Alt+s", ADMIN_MESSAGE),
        KeyBinding::new("Ctrl+Alt+S", ADMIN_MESSAGE),
        KeyBinding::new("ESC", EXIT_MESSAGE),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gesture {
    OpenAdmin,
    EmergencyExit,
}

impl Gesture {
    pub fn from_event(event: &EngineEvent) -> Option<Self> {
        match event {
            EngineEvent::Message(name) if name == ADMIN_MESSAGE => Some(Gesture::OpenAdmin),
            EngineEvent::Message(name) if name == EXIT_MESSAGE => Some(Gesture::EmergencyExit),
            EngineEvent::Message(_) => None,
        }
    }
}

/// Password gate in front of every admin command.
#[derive(Debug, Default)]
pub struct AdminGate {
    unlocked: AtomicBool,
}

impl AdminGate {
    pub fn try_unlock(&self, config: &ViewerConfig, password: &str) -> bool {
        let granted = config.admin_password_matches(password);
        self.unlocked.store(granted, Ordering::SeqCst);
        granted
    }

    pub fn ensure_unlocked(&self) -> Result<(), String> {
        if self.unlocked.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err("Admin panel is locked".to_string())
        }
    }

    pub fn lock(&self) {
        self.unlocked.store(false, Ordering::SeqCst);
    }
}

/// Everything the admin commands reach, stored in Tauri's app state.
pub struct ShellState {
    pub viewer: Viewer,
    pub running: Arc<AtomicBool>,
    gate: AdminGate,
    telemetry: Mutex<TelemetrySampler>,
}

impl ShellState {
    pub fn new(viewer: Viewer, running: Arc<AtomicBool>) -> Self {
        Self {
            viewer,
            running,
            gate: AdminGate::default(),
            telemetry: Mutex::new(TelemetrySampler::new()),
        }
    }
}

/// Route a key gesture coming out of the video window.
pub fn handle_engine_event<R: Runtime>(app: &AppHandle<R>, event: EngineEvent) {
    match Gesture::from_event(&event) {
        Some(Gesture::OpenAdmin) => {
            log::info!("Admin gesture received");
            let app_clone = app.clone();
            let _ = app.run_on_main_thread(move || {
                if let Err(e) = show_admin_panel(&app_clone) {
                    log::error!("Failed to show admin panel: {}", e);
                }
            });
        }
        Some(Gesture::EmergencyExit) => {
            log::info!("Exit gesture received");
            request_exit(app);
        }
        None => log::debug!("Ignoring engine event {:?}", event),
    }
}

fn show_admin_panel<R: Runtime>(app: &AppHandle<R>) -> Result<()> {
    let window = app
        .get_webview_window(ADMIN_WINDOW)
        .context("Admin window missing")?;
    window.show().context("Failed to show admin window")?;
    window.set_always_on_top(true)?;
    window.set_focus()?;
    Ok(())
}

/// Lock the panel, reset its page and hide it.
fn hide_admin_panel<R: Runtime>(window: &WebviewWindow<R>) {
    if let Some(shell) = window.app_handle().try_state::<ShellState>() {
        shell.gate.lock();
    }
    let _ = window.eval("window.resetPanel && window.resetPanel()");
    if let Err(e) = window.hide() {
        log::error!("Failed to hide admin window: {}", e);
    }
}

/// Closing the admin window hides it; the viewer keeps running.
pub fn guard_admin_window<R: Runtime>(window: &WebviewWindow<R>) {
    let window_clone = window.clone();
    window.on_window_event(move |event| {
        if let WindowEvent::CloseRequested { api, .. } = event {
            api.prevent_close();
            hide_admin_panel(&window_clone);
        }
    });
}

pub fn request_exit<R: Runtime>(app: &AppHandle<R>) {
    if let Some(shell) = app.try_state::<ShellState>() {
        shell.running.store(false, Ordering::SeqCst);
    }
    app.exit(0);
}

const XSET_COMMANDS: [&[&str]; 3] = [&["s", "off"], &["-dpms"], &["s", "noblank"]];

/// Stop the screen from blanking under an unattended display. Best effort.
pub fn disable_screen_blanking() {
    if !cfg!(target_os = "linux") {
        return;
    }
    for args in XSET_COMMANDS {
        match std::process::Command::new("xset").args(args).status() {
            Ok(status) if status.success() => {}
            Ok(status) => log::debug!("xset {:?} exited with {}", args, status),
            Err(e) => {
                log::debug!("xset unavailable: {}", e);
                return;
            }
        }
    }
}

#[tauri::command]
pub async fn admin_unlock(
    state: State<'_, ShellState>,
    password: String,
) -> Result<AdminView, String> {
    let mut viewer = state.viewer.lock();
    if !state.gate.try_unlock(viewer.config(), &password) {
        log::warn!("Admin access denied");
        return Err("Incorrect password".to_string());
    }
    log::info!("Admin panel unlocked");
    Ok(viewer.admin_view())
}

#[tauri::command]
pub async fn admin_stats(state: State<'_, ShellState>) -> Result<StatsView, String> {
    state.gate.ensure_unlocked()?;
    Ok(state.telemetry.lock().sample().view())
}

#[tauri::command]
pub async fn admin_status(state: State<'_, ShellState>) -> Result<AdminView, String> {
    state.gate.ensure_unlocked()?;
    Ok(state.viewer.lock().admin_view())
}

#[tauri::command]
pub async fn admin_save(
    state: State<'_, ShellState>,
    settings: SettingsForm,
) -> Result<SaveReport, String> {
    state.gate.ensure_unlocked()?;
    log::info!("Saving settings from admin panel");
    state.viewer.lock().apply_settings(&settings)
}

#[tauri::command]
pub async fn admin_refresh(state: State<'_, ShellState>) -> Result<(), String> {
    state.gate.ensure_unlocked()?;
    log::info!("Manual stream refresh");
    state.viewer.lock().refresh_stream();
    Ok(())
}

#[tauri::command]
pub async fn admin_close(app: AppHandle) -> Result<(), String> {
    let window = app
        .get_webview_window(ADMIN_WINDOW)
        .ok_or_else(|| "Admin window missing".to_string())?;
    hide_admin_panel(&window);
    Ok(())
}

#[tauri::command]
pub async fn admin_exit(app: AppHandle, state: State<'_, ShellState>) -> Result<(), String> {
    state.gate.ensure_unlocked()?;
    request_exit(&app);
    Ok(())
}
