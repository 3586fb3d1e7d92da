use serde::{Deserialize, Serialize};

/// Playback state as reported by the decoding engine. Polled, never pushed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PlayerState {
    Idle,
    Opening,
    Playing,
    Buffering,
    Error,
    Ended,
}

impl PlayerState {
    /// The session is over and will not recover on its own.
    pub fn is_terminal(self) -> bool {
        matches!(self, PlayerState::Error | PlayerState::Ended | PlayerState::Idle)
    }

    /// Waiting on data: fine for a moment, suspicious if it lasts.
    pub fn is_stalled(self) -> bool {
        matches!(self, PlayerState::Opening | PlayerState::Buffering)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Reconnecting,
}

/// Where the decoded video ends up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DisplaySurface {
    /// Borderless full-screen window owned by the engine (kiosk mode).
    #[default]
    Fullscreen,
    /// Ordinary decorated window, for development.
    Windowed,
    /// Render into an existing native window (X11 window id / HWND).
    Embedded(i64),
}

/// RTSP transport requested from the engine. Only TCP is used: interleaved
/// TCP avoids the smeared partial frames UDP produces under packet loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
}

impl Transport {
    pub fn as_str(self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
        }
    }
}

/// Settings as shown in (and submitted from) the admin panel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SettingsForm {
    pub host: String,
    pub port: String,
    pub username: String,
    pub password: String,
    pub channel: String,
    pub subtype: String,
    pub ping_interval_seconds: u64,
    pub network_caching_ms: u64,
    /// Empty keeps the current admin password.
    #[serde(default)]
    pub new_admin_password: String,
}

/// What the panel receives after a successful unlock.
#[derive(Debug, Clone, Serialize)]
pub struct AdminView {
    pub settings: SettingsForm,
    pub health: HealthState,
    pub player: PlayerState,
    pub stream: String,
    /// Why the watchdog last degraded, until the stream recovers.
    pub fault: Option<String>,
    /// How long the current session has been open, `H:MM:SS`.
    pub session_uptime: Option<String>,
    /// Network cache the current session was opened with.
    pub session_caching_ms: Option<u64>,
}

/// Result of "Save & Reload".
#[derive(Debug, Clone, Serialize)]
pub struct SaveReport {
    pub saved: bool,
    pub notice: Option<String>,
}
