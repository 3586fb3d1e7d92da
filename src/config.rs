use std::fs;
use std::io::Write;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{ConfigError, SaveError};
use crate::types::SettingsForm;

pub const DEFAULT_CONFIG_FILE: &str = "nvr_config.json";

/// Key names used by earlier installs, mapped to their current spelling.
const LEGACY_KEYS: [(&str, &str); 7] = [
    ("nvr_ip", "host"),
    ("nvr_port", "port"),
    ("nvr_user", "username"),
    ("nvr_pass", "password"),
    ("admin_pass", "admin_password"),
    ("ping_interval", "ping_interval_seconds"),
    ("network_caching", "network_caching_ms"),
];

const MAX_CACHING_MS: u64 = 60_000;
const MAX_PING_INTERVAL_SECS: u64 = 3_600;

/// The flat configuration record. Unknown keys found in the file ride along
/// in `extra` and are written back untouched.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ViewerConfig {
    pub host: String,
    pub port: String,
    pub username: String,
    pub password: String,
    /// 0 is the NVR's multi-camera overview, 1+ a single camera.
    pub channel: String,
    /// 0 main stream, 1 sub stream.
    pub subtype: String,
    pub admin_password: String,
    pub ping_interval_seconds: u64,
    pub network_caching_ms: u64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            host: "192.168.1.108".to_string(),
            port: "554".to_string(),
            username: "admin".to_string(),
            password: "admin123".to_string(),
            channel: "0".to_string(),
            subtype: "0".to_string(),
            admin_password: "admin".to_string(),
            ping_interval_seconds: 5,
            network_caching_ms: 600,
            extra: Map::new(),
        }
    }
}

impl ViewerConfig {
    /// Build a record from a parsed JSON object, field by field. Returns the
    /// record plus the names of fields whose values had to be discarded.
    pub fn from_object(mut map: Map<String, Value>) -> (Self, Vec<String>) {
        for (legacy, current) in LEGACY_KEYS {
            if let Some(value) = map.remove(legacy) {
                if !map.contains_key(current) {
                    map.insert(current.to_string(), value);
                }
            }
        }

        let mut invalid = Vec::new();
        let mut config = ViewerConfig::default();

        if let Some(v) = take_string(&mut map, "host", &mut invalid) {
            config.host = v;
        }
        if let Some(v) = take_string(&mut map, "port", &mut invalid) {
            config.port = v;
        }
        if let Some(v) = take_string(&mut map, "username", &mut invalid) {
            config.username = v;
        }
        if let Some(v) = take_string(&mut map, "password", &mut invalid) {
            config.password = v;
        }
        if let Some(v) = take_string(&mut map, "channel", &mut invalid) {
            config.channel = v;
        }
        if let Some(v) = take_string(&mut map, "subtype", &mut invalid) {
            config.subtype = v;
        }
        if let Some(v) = take_string(&mut map, "admin_password", &mut invalid) {
            config.admin_password = v;
        }
        let interval = take_u64(
            &mut map,
            "ping_interval_seconds",
            1..=MAX_PING_INTERVAL_SECS,
            &mut invalid,
        );
        if let Some(v) = interval {
            config.ping_interval_seconds = v;
        }
        let caching = take_u64(&mut map, "network_caching_ms", 0..=MAX_CACHING_MS, &mut invalid);
        if let Some(v) = caching {
            config.network_caching_ms = v;
        }

        config.extra = map;
        (config, invalid)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_seconds.max(1))
    }

    /// Exact, case-sensitive comparison against the stored admin password.
    pub fn admin_password_matches(&self, input: &str) -> bool {
        input == self.admin_password
    }

    pub fn to_form(&self) -> SettingsForm {
        SettingsForm {
            host: self.host.clone(),
            port: self.port.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            channel: self.channel.clone(),
            subtype: self.subtype.clone(),
            ping_interval_seconds: self.ping_interval_seconds,
            network_caching_ms: self.network_caching_ms,
            new_admin_password: String::new(),
        }
    }

    /// Validate a submitted form and copy it into this record. Nothing is
    /// changed if any field is rejected.
    pub fn apply_form(&mut self, form: &SettingsForm) -> Result<(), ConfigError> {
        let host = form.host.trim();
        if host.is_empty() || host.contains(char::is_whitespace) {
            return Err(invalid_setting("host", "must be a hostname or IP address"));
        }
        let port = form.port.trim();
        match port.parse::<u16>() {
            Ok(p) if p > 0 => {}
            _ => return Err(invalid_setting("port", "must be between 1 and 65535")),
        }
        if !is_digits(form.channel.trim()) {
            return Err(invalid_setting("channel", "must be a number"));
        }
        if !is_digits(form.subtype.trim()) {
            return Err(invalid_setting("subtype", "must be a number"));
        }
        if !(1..=MAX_PING_INTERVAL_SECS).contains(&form.ping_interval_seconds) {
            return Err(invalid_setting(
                "ping_interval_seconds",
                &format!("must be between 1 and {}", MAX_PING_INTERVAL_SECS),
            ));
        }
        if form.network_caching_ms > MAX_CACHING_MS {
            return Err(invalid_setting(
                "network_caching_ms",
                &format!("must be at most {}", MAX_CACHING_MS),
            ));
        }

        self.host = host.to_string();
        self.port = port.to_string();
        self.username = form.username.clone();
        self.password = form.password.clone();
        self.channel = form.channel.trim().to_string();
        self.subtype = form.subtype.trim().to_string();
        self.ping_interval_seconds = form.ping_interval_seconds;
        self.network_caching_ms = form.network_caching_ms;
        if !form.new_admin_password.is_empty() {
            self.admin_password = form.new_admin_password.clone();
        }
        Ok(())
    }
}

fn invalid_setting(field: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidFields(vec![format!("{} {}", field, reason)])
}

fn is_digits(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_digit())
}

fn take_string(map: &mut Map<String, Value>, key: &str, invalid: &mut Vec<String>) -> Option<String> {
    match map.remove(key)? {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        other => {
            log::warn!("Config field '{}' has unusable value {}, using default", key, other);
            invalid.push(key.to_string());
            None
        }
    }
}

fn take_u64(
    map: &mut Map<String, Value>,
    key: &str,
    allowed: RangeInclusive<u64>,
    invalid: &mut Vec<String>,
) -> Option<u64> {
    let value = map.remove(key)?;
    let parsed = match &value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    };

    match parsed.filter(|n| allowed.contains(n)) {
        Some(n) => Some(n),
        None => {
            log::warn!("Config field '{}' has unusable value {}, using default", key, value);
            invalid.push(key.to_string());
            None
        }
    }
}

/// Outcome of [`ConfigStore::load`]: always a complete record, plus a
/// notice when some or all of it came from defaults.
#[derive(Debug)]
pub struct LoadedConfig {
    pub config: ViewerConfig,
    pub notice: Option<ConfigError>,
}

impl LoadedConfig {
    pub fn using_defaults(&self) -> bool {
        self.notice.is_some()
    }
}

/// Reads and writes the JSON configuration file.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the record. Never fails: a missing or broken file yields
    /// defaults, and a missing file is created so there is something to edit.
    pub fn load(&self) -> LoadedConfig {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::warn!("Config file {:?} not found, writing defaults", self.path);
                let config = ViewerConfig::default();
                if let Err(e) = self.save(&config) {
                    log::warn!("Could not create default config: {}", e);
                }
                return LoadedConfig {
                    config,
                    notice: Some(ConfigError::Missing(self.path.clone())),
                };
            }
            Err(e) => {
                log::error!("Error reading config {:?}: {}", self.path, e);
                return LoadedConfig {
                    config: ViewerConfig::default(),
                    notice: Some(ConfigError::Unreadable {
                        path: self.path.clone(),
                        source: e,
                    }),
                };
            }
        };

        let value = match serde_json::from_str::<Value>(&text) {
            Ok(value) => value,
            Err(e) => {
                log::error!("Error parsing config {:?}: {}", self.path, e);
                return LoadedConfig {
                    config: ViewerConfig::default(),
                    notice: Some(ConfigError::Malformed {
                        path: self.path.clone(),
                        source: e,
                    }),
                };
            }
        };

        let Value::Object(map) = value else {
            log::error!("Config {:?} is not a JSON object, using defaults", self.path);
            return LoadedConfig {
                config: ViewerConfig::default(),
                notice: Some(ConfigError::NotAnObject {
                    path: self.path.clone(),
                }),
            };
        };

        let (config, invalid) = ViewerConfig::from_object(map);
        log::info!("Loaded config from {:?}", self.path);
        LoadedConfig {
            config,
            notice: (!invalid.is_empty()).then(|| ConfigError::InvalidFields(invalid)),
        }
    }

    /// Write the record atomically: temp file next to the target, then rename.
    pub fn save(&self, config: &ViewerConfig) -> Result<(), SaveError> {
        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
        config.serialize(&mut serializer)?;
        buf.push(b'\n');

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if !parent.exists() {
                let _ = fs::create_dir_all(parent);
            }
        }

        let tmp_path = self.temp_path();
        let write = |path: &Path| -> std::io::Result<()> {
            let mut file = fs::File::create(path)?;
            file.write_all(&buf)?;
            file.sync_all()
        };
        if let Err(source) = write(&tmp_path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(SaveError::Write {
                path: tmp_path,
                source,
            });
        }

        fs::rename(&tmp_path, &self.path).map_err(|source| {
            let _ = fs::remove_file(&tmp_path);
            SaveError::Replace {
                path: self.path.clone(),
                source,
            }
        })?;

        log::info!("Saved config to {:?}", self.path);
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| DEFAULT_CONFIG_FILE.into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn store_with(contents: &str) -> (tempfile::TempDir, ConfigStore) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nvr_config.json");
        fs::write(&path, contents).unwrap();
        (dir, ConfigStore::new(path))
    }

    #[test]
    fn test_missing_file_yields_defaults_and_creates_it() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("nvr_config.json"));

        let loaded = store.load();
        assert_eq!(loaded.config, ViewerConfig::default());
        assert!(matches!(loaded.notice, Some(ConfigError::Missing(_))));
        assert!(store.path().exists());

        let reloaded = store.load();
        assert_eq!(reloaded.config, ViewerConfig::default());
        assert!(reloaded.notice.is_none());
    }

    #[test]
    fn test_malformed_inputs_yield_complete_defaults() {
        for contents in ["", "{", "not json", "[1, 2, 3]", "42", "null", "\"host\""] {
            let (_dir, store) = store_with(contents);
            let loaded = store.load();
            assert_eq!(loaded.config, ViewerConfig::default(), "input {:?}", contents);
            assert!(loaded.using_defaults(), "input {:?}", contents);
        }
    }

    #[test]
    fn test_missing_fields_are_filled_individually() {
        let (_dir, store) = store_with(r#"{"host": "10.0.0.9", "ping_interval_seconds": 12}"#);
        let loaded = store.load();

        assert!(loaded.notice.is_none());
        assert_eq!(loaded.config.host, "10.0.0.9");
        assert_eq!(loaded.config.ping_interval_seconds, 12);
        assert_eq!(loaded.config.port, "554");
        assert_eq!(loaded.config.admin_password, "admin");
        assert_eq!(loaded.config.network_caching_ms, 600);
    }

    #[test]
    fn test_bad_field_values_fall_back_per_field() {
        let (_dir, store) = store_with(
            r#"{"host": ["x"], "port": 8554, "ping_interval_seconds": "7",
                "network_caching_ms": -5, "channel": "3"}"#,
        );
        let loaded = store.load();

        assert_eq!(loaded.config.host, "192.168.1.108");
        assert_eq!(loaded.config.port, "8554");
        assert_eq!(loaded.config.ping_interval_seconds, 7);
        assert_eq!(loaded.config.network_caching_ms, 600);
        assert_eq!(loaded.config.channel, "3");
        match loaded.notice {
            Some(ConfigError::InvalidFields(fields)) => {
                assert_eq!(fields, vec!["host".to_string(), "network_caching_ms".to_string()]);
            }
            other => panic!("unexpected notice: {:?}", other),
        }
    }

    #[test]
    fn test_zero_interval_is_rejected() {
        let (_dir, store) = store_with(r#"{"ping_interval_seconds": 0}"#);
        let loaded = store.load();
        assert_eq!(loaded.config.ping_interval_seconds, 5);
        assert!(loaded.using_defaults());
    }

    #[test]
    fn test_oversized_numbers_fall_back_to_defaults() {
        let (_dir, store) = store_with(
            r#"{"ping_interval_seconds": 18446744073709551615, "network_caching_ms": "900000"}"#,
        );
        let loaded = store.load();
        assert_eq!(loaded.config.ping_interval_seconds, 5);
        assert_eq!(loaded.config.network_caching_ms, 600);
        match loaded.notice {
            Some(ConfigError::InvalidFields(fields)) => assert_eq!(
                fields,
                vec!["ping_interval_seconds".to_string(), "network_caching_ms".to_string()]
            ),
            other => panic!("unexpected notice: {:?}", other),
        }

        let (_dir, store) = store_with(r#"{"ping_interval_seconds": 3600}"#);
        assert_eq!(store.load().config.ping_interval_seconds, 3600);
    }

    #[test]
    fn test_legacy_keys_are_understood() {
        let (_dir, store) = store_with(
            r#"{"nvr_ip": "192.168.0.50", "nvr_port": "10554", "nvr_user": "view",
                "nvr_pass": "secret", "admin_pass": "letmein", "ping_interval": 3,
                "network_caching": 1200, "host": "192.168.0.60"}"#,
        );
        let config = store.load().config;

        // canonical key wins over the legacy spelling
        assert_eq!(config.host, "192.168.0.60");
        assert_eq!(config.port, "10554");
        assert_eq!(config.username, "view");
        assert_eq!(config.password, "secret");
        assert_eq!(config.admin_password, "letmein");
        assert_eq!(config.ping_interval_seconds, 3);
        assert_eq!(config.network_caching_ms, 1200);
        assert!(config.extra.is_empty());
    }

    #[test]
    fn test_unknown_fields_survive_a_save() {
        let (_dir, store) = store_with(r#"{"host": "10.1.1.1", "rotation": 90, "notes": {"a": [1, 2]}}"#);
        let loaded = store.load();
        assert_eq!(loaded.config.extra.get("rotation"), Some(&json!(90)));

        store.save(&loaded.config).unwrap();
        let raw: Value = serde_json::from_str(&fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(raw["rotation"], json!(90));
        assert_eq!(raw["notes"], json!({"a": [1, 2]}));
        assert_eq!(raw["host"], json!("10.1.1.1"));
    }

    #[test]
    fn test_save_of_loaded_record_is_idempotent() {
        let (_dir, store) = store_with(r#"{"nvr_ip": "10.2.2.2", "subtype": 1, "extra_key": true}"#);

        let first = store.load().config;
        store.save(&first).unwrap();
        let bytes_after_first = fs::read(store.path()).unwrap();

        let second = store.load().config;
        assert_eq!(first, second);
        store.save(&second).unwrap();
        assert_eq!(bytes_after_first, fs::read(store.path()).unwrap());
    }

    #[test]
    fn test_saved_file_uses_exact_keys_and_types() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("nvr_config.json"));
        store.save(&ViewerConfig::default()).unwrap();

        let raw: Value = serde_json::from_str(&fs::read_to_string(store.path()).unwrap()).unwrap();
        let object = raw.as_object().unwrap();
        let mut keys: Vec<&str> = object.keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(
            keys,
            vec![
                "admin_password",
                "channel",
                "host",
                "network_caching_ms",
                "password",
                "ping_interval_seconds",
                "port",
                "subtype",
                "username",
            ]
        );
        assert!(object["port"].is_string());
        assert!(object["ping_interval_seconds"].is_u64());
        assert!(!dir.path().join("nvr_config.json.tmp").exists());
    }

    #[test]
    fn test_save_failure_is_reported() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("not_a_dir");
        fs::write(&blocker, "file").unwrap();
        let store = ConfigStore::new(blocker.join("nvr_config.json"));

        let err = store.save(&ViewerConfig::default()).unwrap_err();
        assert!(matches!(err, SaveError::Write { .. }));
    }

    #[test]
    fn test_admin_password_is_exact() {
        let config = ViewerConfig {
            admin_password: "Secret".to_string(),
            ..ViewerConfig::default()
        };
        assert!(config.admin_password_matches("Secret"));
        assert!(!config.admin_password_matches("secret"));
        assert!(!config.admin_password_matches("SECRET"));
        assert!(!config.admin_password_matches("Secret "));
        assert!(!config.admin_password_matches(""));
    }

    #[test]
    fn test_apply_form_validates_before_changing_anything() {
        let mut config = ViewerConfig::default();
        let mut form = config.to_form();
        form.host = "10.9.9.9".to_string();
        form.port = "70000".to_string();

        assert!(config.apply_form(&form).is_err());
        assert_eq!(config, ViewerConfig::default());

        form.port = " 8554 ".to_string();
        form.new_admin_password = "n3w".to_string();
        config.apply_form(&form).unwrap();
        assert_eq!(config.host, "10.9.9.9");
        assert_eq!(config.port, "8554");
        assert_eq!(config.admin_password, "n3w");
    }

    #[test]
    fn test_apply_form_bounds_ping_interval() {
        let mut config = ViewerConfig::default();
        let mut form = config.to_form();
        form.ping_interval_seconds = 9_000_000_000_000_000_000;
        assert!(config.apply_form(&form).is_err());
        assert_eq!(config.ping_interval_seconds, 5);

        form.ping_interval_seconds = 3_601;
        assert!(config.apply_form(&form).is_err());

        form.ping_interval_seconds = 3_600;
        config.apply_form(&form).unwrap();
        assert_eq!(config.ping_interval(), Duration::from_secs(3_600));
    }

    #[test]
    fn test_apply_form_keeps_admin_password_when_blank() {
        let mut config = ViewerConfig::default();
        let form = config.to_form();
        config.apply_form(&form).unwrap();
        assert_eq!(config.admin_password, "admin");
    }
}
