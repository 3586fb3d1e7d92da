use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::{ConfigStore, ViewerConfig};
use crate::engine::MediaEngine;
use crate::monitor::{Fault, HealthMonitor, TickAction, TickReport};
use crate::player::{redact_url, StreamPlayer, StreamTarget};
use crate::probe::{probe_timeout, ProbeTarget, Reachability};
use crate::telemetry::format_uptime;
use crate::types::{AdminView, SaveReport, SettingsForm};

pub const CONNECTING_MESSAGE: &str = "Connecting to NVR...";
const RECONNECTING_LINE: &str = "Reconnecting...";
const WAITING_LINE: &str = "Waiting to reconnect...";

/// The one configuration record and the one player session, shared by the
/// watchdog and the admin panel. Every access goes through the lock.
pub struct ViewerContext<E: MediaEngine> {
    config: ViewerConfig,
    store: ConfigStore,
    player: StreamPlayer<E>,
    monitor: HealthMonitor,
    overlay: Option<String>,
}

pub type SharedContext<E> = Arc<Mutex<ViewerContext<E>>>;

pub fn create_context<E: MediaEngine>(
    config: ViewerConfig,
    store: ConfigStore,
    player: StreamPlayer<E>,
    monitor: HealthMonitor,
) -> SharedContext<E> {
    Arc::new(Mutex::new(ViewerContext {
        config,
        store,
        player,
        monitor,
        overlay: None,
    }))
}

impl<E: MediaEngine> ViewerContext<E> {
    pub fn config(&self) -> &ViewerConfig {
        &self.config
    }

    pub fn monitor(&self) -> &HealthMonitor {
        &self.monitor
    }

    /// (Re)open the configured stream outside the watchdog. The monitor is
    /// told so it waits for this attempt instead of issuing its own.
    pub fn refresh_stream(&mut self) {
        let target = StreamTarget::from_config(&self.config);
        self.set_overlay(Some(CONNECTING_MESSAGE.to_string()));
        self.player.stop();
        if let Err(e) = self.player.play_target(&target) {
            log::error!("Failed to start stream: {}", e);
        }
        self.monitor.note_external_reconnect();
    }

    pub fn watchdog_tick(&mut self, reachable: bool) -> TickReport {
        let target = StreamTarget::from_config(&self.config);
        let report = self.monitor.tick(reachable, &mut self.player, &target);

        match &report.action {
            TickAction::Steady | TickAction::Recovered => self.set_overlay(None),
            TickAction::Settling => {}
            TickAction::Reconnected { fault, .. } => {
                let text = fault_message(fault, &self.config.host, RECONNECTING_LINE);
                self.set_overlay(Some(text));
            }
            TickAction::Held { fault } => {
                let text = fault_message(fault, &self.config.host, WAITING_LINE);
                self.set_overlay(Some(text));
            }
        }

        report
    }

    fn set_overlay(&mut self, text: Option<String>) {
        if self.overlay != text {
            self.player.show_status(text.as_deref());
            self.overlay = text;
        }
    }

    pub fn admin_view(&mut self) -> AdminView {
        AdminView {
            settings: self.config.to_form(),
            health: self.monitor.state(),
            player: self.player.state(),
            stream: redact_url(&StreamTarget::from_config(&self.config).url),
            fault: self.monitor.last_fault().map(|f| f.describe()),
            session_uptime: self
                .player
                .session()
                .map(|s| format_uptime(s.started_at.elapsed().as_secs())),
            session_caching_ms: self
                .player
                .session()
                .map(|s| s.caching.as_millis() as u64),
        }
    }

    /// Validate and apply panel settings, persist them, restart the stream.
    /// A failed write leaves the new settings live and reports a notice.
    pub fn apply_settings(&mut self, form: &SettingsForm) -> Result<SaveReport, String> {
        self.config.apply_form(form).map_err(|e| e.to_string())?;

        let report = match self.store.save(&self.config) {
            Ok(()) => SaveReport {
                saved: true,
                notice: None,
            },
            Err(e) => {
                log::error!("Failed to save config: {}", e);
                SaveReport {
                    saved: false,
                    notice: Some(format!("Settings applied but not saved: {}", e)),
                }
            }
        };

        self.refresh_stream();
        Ok(report)
    }

    pub fn shutdown(&mut self) {
        self.player.shutdown();
    }
}

fn fault_message(fault: &Fault, host: &str, next_step: &str) -> String {
    match fault {
        Fault::Unreachable => format!("NETWORK ERROR\nCannot reach NVR at {}\n{}", host, next_step),
        _ => format!("Stream Lost.\n{}", next_step),
    }
}

/// Watchdog loop: probe off-lock on a blocking task, tick under the lock,
/// sleep for the configured interval. Ticks are strictly sequential.
pub async fn run_watchdog<E: MediaEngine + 'static>(
    ctx: SharedContext<E>,
    probe: Arc<dyn Reachability>,
    running: Arc<AtomicBool>,
) {
    log::info!("Watchdog started");

    while running.load(Ordering::SeqCst) {
        let (target, interval) = {
            let ctx = ctx.lock();
            (ProbeTarget::from_config(ctx.config()), ctx.config().ping_interval())
        };
        let timeout = probe_timeout(interval);

        let probe_for_task = probe.clone();
        let reachable =
            match tokio::task::spawn_blocking(move || probe_for_task.probe(&target, timeout)).await {
                Ok(reachable) => reachable,
                Err(e) => {
                    log::error!("Probe task failed: {}", e);
                    false
                }
            };

        // Engine IPC blocks, so the tick runs on the blocking pool too.
        let ctx_for_tick = ctx.clone();
        match tokio::task::spawn_blocking(move || ctx_for_tick.lock().watchdog_tick(reachable)).await {
            Ok(report) => log::trace!(
                "Watchdog tick: reachable={} player={:?} health {:?} -> {:?}",
                report.reachable,
                report.player,
                report.path,
                report.end_state()
            ),
            Err(e) => log::error!("Watchdog tick failed: {}", e),
        }

        if !running.load(Ordering::SeqCst) {
            break;
        }
        tokio::time::sleep(interval).await;
    }

    log::info!("Watchdog stopped");
}
