use std::collections::HashMap;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::process::{Child, ChildStderr, Command, Stdio};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::error::EngineError;
use crate::types::{DisplaySurface, PlayerState, Transport};

/// How long the OSD keeps a status message when nothing replaces it.
const STATUS_DURATION_MS: u64 = 24 * 60 * 60 * 1000;
const SOCKET_WAIT: Duration = Duration::from_secs(5);

/// Everything the engine needs to open one stream.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenRequest {
    pub url: String,
    pub transport: Transport,
    pub caching: Duration,
    pub surface: DisplaySurface,
}

/// Unsolicited notifications coming out of the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// A bound key fired; carries the message name from the binding.
    Message(String),
}

pub type EventHook = Arc<dyn Fn(EngineEvent) + Send + Sync>;

/// The external decoding engine, reduced to what the viewer needs.
///
/// `open` only starts a connection attempt. Whether playback actually
/// works is learned later from `state`.
pub trait MediaEngine: Send {
    fn open(&mut self, request: &OpenRequest) -> Result<(), EngineError>;

    fn stop(&mut self) -> Result<(), EngineError>;

    /// Polled playback state. Communication failures read as `Error`.
    fn state(&mut self) -> PlayerState;

    /// Show (or with `None`, clear) an overlay message on the video surface.
    fn show_status(&mut self, _text: Option<&str>) {}

    /// Release the engine entirely (process exit).
    fn shutdown(&mut self) -> Result<(), EngineError> {
        self.stop()
    }
}

/// A key routed to the viewer instead of being handled by mpv itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyBinding {
    pub key: String,
    pub message: String,
}

impl KeyBinding {
    pub fn new(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MpvSettings {
    pub binary: PathBuf,
    pub socket_path: PathBuf,
    pub input_conf_path: PathBuf,
    pub key_bindings: Vec<KeyBinding>,
    pub ipc_timeout: Duration,
    pub network_timeout: Duration,
}

impl MpvSettings {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        let run_dir = std::env::temp_dir();
        let pid = std::process::id();
        Self {
            binary: binary.into(),
            socket_path: run_dir.join(format!("nvr-viewer-mpv-{}.sock", pid)),
            input_conf_path: run_dir.join(format!("nvr-viewer-input-{}.conf", pid)),
            key_bindings: Vec::new(),
            ipc_timeout: Duration::from_secs(1),
            network_timeout: Duration::from_secs(10),
        }
    }

    /// Command line for a fresh mpv process.
    fn spawn_args(&self, surface: DisplaySurface, transport: Transport) -> Vec<String> {
        let mut args = vec![
            "--idle=yes".to_string(),
            "--force-window=yes".to_string(),
            "--keep-open=no".to_string(),
            format!("--input-ipc-server={}", self.socket_path.display()),
            format!("--input-conf={}", self.input_conf_path.display()),
            "--no-input-default-bindings".to_string(),
            "--no-osc".to_string(),
            "--cursor-autohide=always".to_string(),
            "--osd-align-x=center".to_string(),
            "--osd-align-y=center".to_string(),
            "--osd-font-size=40".to_string(),
            "--cache=yes".to_string(),
            "--hwdec=auto-safe".to_string(),
            format!("--rtsp-transport={}", transport.as_str()),
            format!("--network-timeout={}", self.network_timeout.as_secs().max(1)),
            "--title=NVR Viewer".to_string(),
        ];

        match surface {
            DisplaySurface::Fullscreen => {
                args.push("--fs".to_string());
                args.push("--no-border".to_string());
            }
            DisplaySurface::Windowed => {}
            DisplaySurface::Embedded(wid) => args.push(format!("--wid={}", wid)),
        }

        args
    }

    fn input_conf(&self) -> String {
        self.key_bindings
            .iter()
            .map(|b| format!("{} script-message {}\n", b.key, b.message))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EndReason {
    Eof,
    Stop,
    Error,
    Other,
}

/// What the event stream has told us about the current file.
#[derive(Debug, Clone, Default)]
struct Playback {
    load_pending: bool,
    loaded: bool,
    restarted: bool,
    last_end: Option<EndReason>,
}

impl Playback {
    /// Fold one engine event into the tracker. Returns events the viewer
    /// should hear about.
    fn apply(&mut self, event: &Value) -> Option<EngineEvent> {
        match event.get("event").and_then(Value::as_str)? {
            "start-file" => {
                *self = Playback::default();
            }
            "file-loaded" => {
                self.loaded = true;
            }
            "playback-restart" => {
                self.restarted = true;
            }
            "end-file" => {
                let reason = match event.get("reason").and_then(Value::as_str) {
                    Some("eof") => EndReason::Eof,
                    Some("stop") | Some("quit") => EndReason::Stop,
                    Some("error") => EndReason::Error,
                    _ => EndReason::Other,
                };
                if reason == EndReason::Error {
                    log::warn!(
                        "mpv end-file with error: {}",
                        event.get("file_error").and_then(Value::as_str).unwrap_or("unknown")
                    );
                }
                self.loaded = false;
                self.restarted = false;
                self.last_end = Some(reason);
            }
            "client-message" => {
                let name = event.get("args")?.as_array()?.first()?.as_str()?;
                return Some(EngineEvent::Message(name.to_string()));
            }
            _ => {}
        }
        None
    }

    /// Combine tracked events with freshly polled properties.
    fn classify(
        &self,
        idle: bool,
        waiting: impl FnOnce() -> Result<bool, EngineError>,
    ) -> PlayerState {
        if idle {
            if self.load_pending {
                return PlayerState::Opening;
            }
            return match self.last_end {
                Some(EndReason::Error) => PlayerState::Error,
                Some(EndReason::Eof) => PlayerState::Ended,
                _ => PlayerState::Idle,
            };
        }

        if self.load_pending || !self.loaded || !self.restarted {
            return PlayerState::Opening;
        }

        match waiting() {
            Ok(true) => PlayerState::Buffering,
            Ok(false) => PlayerState::Playing,
            Err(_) => PlayerState::Error,
        }
    }
}

type Pending = Arc<Mutex<HashMap<u64, mpsc::Sender<Value>>>>;

/// Request/reply channel over mpv's JSON IPC socket.
struct IpcClient {
    writer: UnixStream,
    pending: Pending,
    next_id: u64,
    timeout: Duration,
}

impl IpcClient {
    /// Take over a connected socket and start the reader thread.
    fn start(
        stream: UnixStream,
        timeout: Duration,
        playback: Arc<Mutex<Playback>>,
        hook: Arc<Mutex<Option<EventHook>>>,
    ) -> Result<Self, EngineError> {
        let reader = stream.try_clone()?;
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));

        let pending_for_reader = pending.clone();
        thread::spawn(move || {
            Self::read_loop(reader, pending_for_reader, playback, hook);
        });

        Ok(Self {
            writer: stream,
            pending,
            next_id: 0,
            timeout,
        })
    }

    fn read_loop(
        stream: UnixStream,
        pending: Pending,
        playback: Arc<Mutex<Playback>>,
        hook: Arc<Mutex<Option<EventHook>>>,
    ) {
        let reader = BufReader::new(stream);

        for line in reader.lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    log::error!("Error reading mpv IPC: {}", e);
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            let message: Value = match serde_json::from_str(&line) {
                Ok(message) => message,
                Err(e) => {
                    log::error!("Failed to parse mpv message: {} - {}", e, line);
                    continue;
                }
            };

            if message.get("event").is_some() {
                log::debug!("mpv event: {}", line);
                let event = playback.lock().apply(&message);
                if let Some(event) = event {
                    let hook = hook.lock().clone();
                    if let Some(hook) = hook {
                        hook(event);
                    }
                }
            } else if let Some(id) = message.get("request_id").and_then(Value::as_u64) {
                if let Some(tx) = pending.lock().remove(&id) {
                    let _ = tx.send(message);
                }
            }
        }

        // Dropping the senders wakes any caller still waiting on a reply.
        pending.lock().clear();
        log::warn!("mpv IPC reader stopped");
    }

    fn command(&mut self, args: Value) -> Result<Value, EngineError> {
        self.next_id += 1;
        let id = self.next_id;
        let (tx, rx) = mpsc::channel();
        self.pending.lock().insert(id, tx);

        let line = format!("{}\n", json!({ "command": args, "request_id": id }));
        if let Err(e) = self.writer.write_all(line.as_bytes()) {
            self.pending.lock().remove(&id);
            return Err(e.into());
        }

        let reply = match rx.recv_timeout(self.timeout) {
            Ok(reply) => reply,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                self.pending.lock().remove(&id);
                return Err(EngineError::Timeout(self.timeout));
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => return Err(EngineError::NotRunning),
        };

        match reply.get("error").and_then(Value::as_str) {
            Some("success") => Ok(reply.get("data").cloned().unwrap_or(Value::Null)),
            other => Err(EngineError::Rejected {
                command: args
                    .get(0)
                    .and_then(Value::as_str)
                    .unwrap_or("?")
                    .to_string(),
                reason: other.unwrap_or("no status").to_string(),
            }),
        }
    }

    fn get_bool(&mut self, property: &str) -> Result<bool, EngineError> {
        let data = self.command(json!(["get_property", property]))?;
        data.as_bool().ok_or_else(|| EngineError::Rejected {
            command: format!("get_property {}", property),
            reason: format!("unexpected value {}", data),
        })
    }
}

struct MpvProcess {
    child: Child,
    ipc: IpcClient,
    surface: DisplaySurface,
    transport: Transport,
}

/// Drives one long-lived mpv process over JSON IPC. The mpv window is the
/// display surface; it stays up (black) between sessions.
pub struct MpvEngine {
    settings: MpvSettings,
    process: Option<MpvProcess>,
    playback: Arc<Mutex<Playback>>,
    hook: Arc<Mutex<Option<EventHook>>>,
}

impl MpvEngine {
    pub fn new(settings: MpvSettings) -> Self {
        Self {
            settings,
            process: None,
            playback: Arc::new(Mutex::new(Playback::default())),
            hook: Arc::new(Mutex::new(None)),
        }
    }

    pub fn set_event_hook(&self, hook: EventHook) {
        *self.hook.lock() = Some(hook);
    }

    /// Start mpv up front so the surface (and key bindings) exist before the
    /// first stream opens.
    pub fn launch(&mut self, surface: DisplaySurface) -> Result<(), EngineError> {
        self.ensure_running(surface, Transport::Tcp)
    }

    fn is_running(&mut self) -> bool {
        let Some(process) = self.process.as_mut() else {
            return false;
        };
        match process.child.try_wait() {
            Ok(Some(status)) => {
                log::warn!("mpv process has exited: {}", status);
                false
            }
            Ok(None) => true,
            Err(e) => {
                log::error!("Error checking mpv status: {}", e);
                false
            }
        }
    }

    fn ensure_running(
        &mut self,
        surface: DisplaySurface,
        transport: Transport,
    ) -> Result<(), EngineError> {
        if self.is_running() {
            if let Some(process) = &self.process {
                if process.surface == surface && process.transport == transport {
                    return Ok(());
                }
            }
        }
        self.terminate();
        self.spawn(surface, transport)
    }

    fn spawn(&mut self, surface: DisplaySurface, transport: Transport) -> Result<(), EngineError> {
        let settings = &self.settings;
        log::info!("Spawning mpv ({:?})...", settings.binary);

        fs::write(&settings.input_conf_path, settings.input_conf()).map_err(|e| {
            EngineError::Setup(format!(
                "cannot write {:?}: {}",
                settings.input_conf_path, e
            ))
        })?;
        let _ = fs::remove_file(&settings.socket_path);

        let mut child = Command::new(&settings.binary)
            .args(settings.spawn_args(surface, transport))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| EngineError::Spawn {
                binary: settings.binary.display().to_string(),
                source,
            })?;

        log::info!("mpv spawned with PID: {}", child.id());

        if let Some(stderr) = child.stderr.take() {
            thread::spawn(move || Self::read_stderr(stderr));
        }

        let stream = match Self::connect(&mut child, settings) {
            Ok(stream) => stream,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(e);
            }
        };

        *self.playback.lock() = Playback::default();
        let ipc = IpcClient::start(
            stream,
            settings.ipc_timeout,
            self.playback.clone(),
            self.hook.clone(),
        )?;

        self.process = Some(MpvProcess {
            child,
            ipc,
            surface,
            transport,
        });
        Ok(())
    }

    /// Wait for mpv to create its IPC socket.
    fn connect(child: &mut Child, settings: &MpvSettings) -> Result<UnixStream, EngineError> {
        let deadline = Instant::now() + SOCKET_WAIT;
        loop {
            if let Ok(Some(status)) = child.try_wait() {
                log::error!("mpv exited during startup: {}", status);
                return Err(EngineError::NotRunning);
            }
            match UnixStream::connect(&settings.socket_path) {
                Ok(stream) => {
                    log::info!("Connected to mpv IPC at {:?}", settings.socket_path);
                    return Ok(stream);
                }
                Err(_) if Instant::now() < deadline => {
                    thread::sleep(Duration::from_millis(100));
                }
                Err(_) => {
                    return Err(EngineError::IpcUnavailable(settings.socket_path.clone()));
                }
            }
        }
    }

    fn read_stderr(stderr: ChildStderr) {
        let reader = BufReader::new(stderr);

        for line in reader.lines() {
            match line {
                Ok(line) => {
                    if !line.trim().is_empty() {
                        log::debug!("[mpv] {}", line);
                    }
                }
                Err(e) => {
                    log::error!("Error reading mpv stderr: {}", e);
                    break;
                }
            }
        }
    }

    /// Stop the mpv process: ask politely, then SIGTERM, then kill.
    fn terminate(&mut self) {
        let Some(mut process) = self.process.take() else {
            return;
        };
        let pid = process.child.id();
        log::info!("Stopping mpv process with PID {}...", pid);

        let _ = process.ipc.command(json!(["quit"]));
        if Self::wait_for_exit(&mut process.child, Duration::from_secs(1)) {
            return;
        }

        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            log::info!("Sending SIGTERM to mpv process {}", pid);
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }

        if Self::wait_for_exit(&mut process.child, Duration::from_secs(2)) {
            return;
        }

        log::warn!("mpv didn't stop after SIGTERM, killing...");
        if let Err(e) = process.child.kill() {
            log::error!("Failed to kill mpv: {}", e);
        }
        let _ = process.child.wait();
        log::info!("mpv process forcefully terminated");
    }

    fn wait_for_exit(child: &mut Child, max_wait: Duration) -> bool {
        let check_interval = Duration::from_millis(100);
        let deadline = Instant::now() + max_wait;

        while Instant::now() < deadline {
            match child.try_wait() {
                Ok(Some(status)) => {
                    log::info!("mpv exited with status: {}", status);
                    return true;
                }
                Ok(None) => thread::sleep(check_interval),
                Err(e) => {
                    log::error!("Error checking mpv status: {}", e);
                    return false;
                }
            }
        }
        false
    }

    fn ipc(&mut self) -> Result<&mut IpcClient, EngineError> {
        self.process
            .as_mut()
            .map(|p| &mut p.ipc)
            .ok_or(EngineError::NotRunning)
    }
}

impl MediaEngine for MpvEngine {
    fn open(&mut self, request: &OpenRequest) -> Result<(), EngineError> {
        self.ensure_running(request.surface, request.transport)?;

        self.playback.lock().load_pending = true;
        let ipc = self.ipc()?;
        ipc.command(json!(["set_property", "cache-secs", request.caching.as_secs_f64()]))?;
        if let Err(e) = ipc.command(json!(["loadfile", request.url, "replace"])) {
            self.playback.lock().load_pending = false;
            return Err(e);
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<(), EngineError> {
        if self.process.is_none() {
            return Ok(());
        }
        self.playback.lock().load_pending = false;
        self.ipc()?.command(json!(["stop"]))?;
        Ok(())
    }

    fn state(&mut self) -> PlayerState {
        if !self.is_running() {
            return PlayerState::Error;
        }
        let playback = self.playback.clone();
        let Ok(ipc) = self.ipc() else {
            return PlayerState::Error;
        };

        let idle = match ipc.get_bool("idle-active") {
            Ok(idle) => idle,
            Err(e) => {
                log::warn!("mpv state query failed: {}", e);
                return PlayerState::Error;
            }
        };

        // Snapshot: the reader thread needs the lock to deliver our replies.
        let tracker = playback.lock().clone();
        tracker.classify(idle, || {
            Ok(ipc.get_bool("paused-for-cache")? || ipc.get_bool("core-idle")?)
        })
    }

    fn show_status(&mut self, text: Option<&str>) {
        let Ok(ipc) = self.ipc() else {
            return;
        };
        let command = match text {
            Some(text) => json!(["show-text", text, STATUS_DURATION_MS]),
            None => json!(["show-text", "", 1]),
        };
        if let Err(e) = ipc.command(command) {
            log::debug!("Failed to update OSD: {}", e);
        }
    }

    fn shutdown(&mut self) -> Result<(), EngineError> {
        self.terminate();
        let _ = fs::remove_file(&self.settings.socket_path);
        let _ = fs::remove_file(&self.settings.input_conf_path);
        Ok(())
    }
}

impl Drop for MpvEngine {
    fn drop(&mut self) {
        if self.process.is_some() {
            log::info!("MpvEngine dropped, cleaning up...");
            let _ = self.shutdown();
        }
    }
}
