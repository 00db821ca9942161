use rollcall_core::matcher::DEFAULT_MATCH_THRESHOLD;
use rollcall_core::LatePolicy;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

const SYSTEM_CONFIG_PATH: &str = "/etc/rollcall/rollcall.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid late_cutoff {0:?}: expected HH:MM")]
    Cutoff(String),
    #[error("invalid {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Which message bus the daemon registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    System,
    Session,
}

impl FromStr for BusKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "system" => Ok(Self::System),
            "session" => Ok(Self::Session),
            other => Err(format!("unknown bus {other:?}")),
        }
    }
}

/// Daemon configuration.
///
/// Built-in defaults, then an optional TOML file, then `ROLLCALL_*`
/// environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    pub camera_width: u32,
    pub camera_height: u32,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// External program that turns a PNG frame into a face descriptor.
    pub extractor_command: PathBuf,
    pub extractor_args: Vec<String>,
    /// Maximum Euclidean distance for a positive match.
    pub match_threshold: f32,
    /// Local time of day after which arrivals are late, `HH:MM`.
    pub late_cutoff: String,
    /// Late count above which a person is put on the late-comers roster.
    pub late_escalation_threshold: u32,
    /// Interval between detection cycles while the camera runs.
    pub sample_interval_ms: u64,
    /// Number of frames to discard after opening the camera (AGC/AE settle).
    pub warmup_frames: usize,
    /// Number of frames to capture per registration.
    pub frames_per_enroll: usize,
    /// Length of the in-memory recent attendance list.
    pub recent_capacity: usize,
    /// Hex SHA-256 of the admin password guarding export and clear.
    pub admin_password_sha256: Option<String>,
    pub bus: BusKind,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        Self {
            camera_device: "/dev/video0".to_string(),
            camera_width: 640,
            camera_height: 480,
            db_path: data_dir.join("attendance.db"),
            extractor_command: PathBuf::from("/usr/libexec/rollcall/rollcall-extract"),
            extractor_args: Vec::new(),
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            late_cutoff: "08:30".to_string(),
            late_escalation_threshold: LatePolicy::default().escalation_threshold,
            sample_interval_ms: 1000,
            warmup_frames: 4,
            frames_per_enroll: 5,
            recent_capacity: 49,
            admin_password_sha256: None,
            bus: BusKind::System,
        }
    }
}

impl Config {
    /// Load from `ROLLCALL_CONFIG` (or the system path if it exists) and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        let file = std::env::var("ROLLCALL_CONFIG")
            .map(PathBuf::from)
            .ok()
            .or_else(|| {
                let p = PathBuf::from(SYSTEM_CONFIG_PATH);
                p.exists().then_some(p)
            });

        let mut config = match file {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Override fields from `ROLLCALL_*` variables. Unparsable values are
    /// logged and ignored.
    pub fn apply_env<F>(&mut self, get: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = get("ROLLCALL_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Some(v) = get("ROLLCALL_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = get("ROLLCALL_EXTRACTOR_COMMAND") {
            self.extractor_command = PathBuf::from(v);
        }
        if let Some(v) = get("ROLLCALL_EXTRACTOR_ARGS") {
            self.extractor_args = v.split_whitespace().map(str::to_string).collect();
        }
        if let Some(v) = get("ROLLCALL_LATE_CUTOFF") {
            self.late_cutoff = v;
        }
        if let Some(v) = get("ROLLCALL_ADMIN_PASSWORD_SHA256") {
            self.admin_password_sha256 = Some(v);
        }
        env_parse(&get, "ROLLCALL_CAMERA_WIDTH", &mut self.camera_width);
        env_parse(&get, "ROLLCALL_CAMERA_HEIGHT", &mut self.camera_height);
        env_parse(&get, "ROLLCALL_MATCH_THRESHOLD", &mut self.match_threshold);
        env_parse(&get, "ROLLCALL_LATE_ESCALATION_THRESHOLD", &mut self.late_escalation_threshold);
        env_parse(&get, "ROLLCALL_SAMPLE_INTERVAL_MS", &mut self.sample_interval_ms);
        env_parse(&get, "ROLLCALL_WARMUP_FRAMES", &mut self.warmup_frames);
        env_parse(&get, "ROLLCALL_FRAMES_PER_ENROLL", &mut self.frames_per_enroll);
        env_parse(&get, "ROLLCALL_RECENT_CAPACITY", &mut self.recent_capacity);
        env_parse(&get, "ROLLCALL_BUS", &mut self.bus);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        LatePolicy::parse_cutoff(&self.late_cutoff)
            .ok_or_else(|| ConfigError::Cutoff(self.late_cutoff.clone()))?;
        if !(self.match_threshold.is_finite() && self.match_threshold > 0.0) {
            return Err(ConfigError::Invalid {
                key: "match_threshold",
                reason: format!("{} is not a positive distance", self.match_threshold),
            });
        }
        if self.sample_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                key: "sample_interval_ms",
                reason: "must be greater than zero".into(),
            });
        }
        if self.frames_per_enroll == 0 {
            return Err(ConfigError::Invalid {
                key: "frames_per_enroll",
                reason: "must be greater than zero".into(),
            });
        }
        Ok(())
    }

    pub fn late_policy(&self) -> LatePolicy {
        LatePolicy {
            cutoff: LatePolicy::parse_cutoff(&self.late_cutoff)
                .unwrap_or(LatePolicy::default().cutoff),
            escalation_threshold: self.late_escalation_threshold,
        }
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }
}

fn env_parse<F, T>(get: &F, key: &str, slot: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    let Some(raw) = get(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(v) => *slot = v,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparsable environment override"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.match_threshold, 0.6);
        assert_eq!(config.late_policy(), LatePolicy::default());
        assert_eq!(config.sample_interval(), Duration::from_secs(1));
        assert_eq!(config.recent_capacity, 49);
    }

    #[test]
    fn test_toml_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rollcall.toml");
        std::fs::write(
            &path,
            r#"
camera_device = "/dev/video4"
late_cutoff = "09:00"
match_threshold = 0.5
extractor_args = ["--model", "/opt/models"]
bus = "session"
"#,
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.camera_device, "/dev/video4");
        assert_eq!(config.match_threshold, 0.5);
        assert_eq!(config.extractor_args, ["--model", "/opt/models"]);
        assert_eq!(config.bus, BusKind::Session);
        assert_eq!(config.late_policy().cutoff.to_string(), "09:00:00");
        // untouched keys keep their defaults
        assert_eq!(config.frames_per_enroll, 5);
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rollcall.toml");
        std::fs::write(&path, "camera = \"/dev/video0\"\n").unwrap();
        assert!(matches!(Config::from_file(&path), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_env(env(&[
            ("ROLLCALL_MATCH_THRESHOLD", "0.45"),
            ("ROLLCALL_SAMPLE_INTERVAL_MS", "250"),
            ("ROLLCALL_BUS", "session"),
            ("ROLLCALL_EXTRACTOR_ARGS", "--fast  --cpu"),
        ]));
        assert_eq!(config.match_threshold, 0.45);
        assert_eq!(config.sample_interval_ms, 250);
        assert_eq!(config.bus, BusKind::Session);
        assert_eq!(config.extractor_args, ["--fast", "--cpu"]);
    }

    #[test]
    fn test_bad_env_value_is_ignored() {
        let mut config = Config::default();
        config.apply_env(env(&[("ROLLCALL_WARMUP_FRAMES", "lots")]));
        assert_eq!(config.warmup_frames, 4);
    }

    #[test]
    fn test_validate_rejects_bad_cutoff() {
        let config = Config {
            late_cutoff: "half past eight".into(),
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Cutoff(_))));
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let config = Config {
            sample_interval_ms: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
