use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};

pub const CONFIG_VERSION: u32 = 1;
/// Largest 2D and cube texture edge a config may allow.
pub const MAX_TEXTURE_EDGE: u32 = 16384;
pub const MAX_BUSY_WAIT_POLL: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Wgpu,
    Null,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Wgpu => "wgpu",
            BackendKind::Null => "null",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ServerConfig {
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<PathBuf>,
    #[serde(default)]
    pub backend: BackendKind,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(
        default = "default_busy_wait_poll",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub busy_wait_poll: Duration,
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    #[serde(default)]
    pub limits: Limits,
    #[serde(default)]
    pub null_backend: NullBackendConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Limits {
    pub max_texture_2d: u32,
    pub max_texture_3d: u32,
    pub max_texture_cube: u32,
    /// Longest command batch accepted, in 32-bit words.
    pub max_command_words: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_texture_2d: 16384,
            max_texture_3d: 2048,
            max_texture_cube: 16384,
            max_command_words: 1 << 20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct NullBackendConfig {
    /// Polls a fence stays unsignalled.
    pub fence_latency: u32,
}

impl Default for NullBackendConfig {
    fn default() -> Self {
        Self { fence_latency: 2 }
    }
}

fn default_max_connections() -> usize {
    16
}

fn default_busy_wait_poll() -> Duration {
    Duration::from_millis(1)
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            socket_path: None,
            backend: BackendKind::default(),
            max_connections: default_max_connections(),
            busy_wait_poll: default_busy_wait_poll(),
            log_filter: default_log_filter(),
            limits: Limits::default(),
            null_backend: NullBackendConfig::default(),
        }
    }
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    struct Visitor;
    impl<'de> de::Visitor<'de> for Visitor {
        type Value = Duration;

        fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
            formatter.write_str("a duration as number of seconds or human-readable string")
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            humantime::parse_duration(v)
                .map_err(|err| E::custom(format!("invalid duration '{v}': {err}")))
        }

        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(Duration::from_secs(v))
        }

        fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v < 0 {
                return Err(E::custom("duration must be non-negative"));
            }
            Ok(Duration::from_secs(v as u64))
        }

        fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v.is_nan() || v.is_sign_negative() {
                return Err(E::custom("duration must be non-negative"));
            }
            Ok(Duration::from_secs_f64(v))
        }
    }

    deserializer.deserialize_any(Visitor)
}

fn serialize_duration<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&humantime::format_duration(*value).to_string())
}

impl ServerConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let raw: ServerConfig = toml::from_str(input)?;
        raw.validate()?;
        Ok(raw)
    }

    /// Reads and validates a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let input = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&input)
    }

    /// Like [`ServerConfig::load`], but a missing file yields the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load(path)
    }

    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.version != CONFIG_VERSION {
            return Err(ConfigError::Invalid(format!(
                "unsupported config version {}; expected {CONFIG_VERSION}",
                self.version
            )));
        }

        if self.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "max_connections must be at least 1".into(),
            ));
        }

        if self.busy_wait_poll > MAX_BUSY_WAIT_POLL {
            return Err(ConfigError::Invalid(format!(
                "busy_wait_poll must be at most {}",
                humantime::format_duration(MAX_BUSY_WAIT_POLL)
            )));
        }

        if let Some(path) = &self.socket_path {
            if path.as_os_str().is_empty() {
                return Err(ConfigError::Invalid("socket_path may not be empty".into()));
            }
        }

        let limits = &self.limits;
        for (name, value) in [
            ("max_texture_2d", limits.max_texture_2d),
            ("max_texture_cube", limits.max_texture_cube),
        ] {
            if value == 0 || value > MAX_TEXTURE_EDGE {
                return Err(ConfigError::Invalid(format!(
                    "limits.{name} must be between 1 and {MAX_TEXTURE_EDGE}"
                )));
            }
        }
        if limits.max_texture_3d == 0 {
            return Err(ConfigError::Invalid(
                "limits.max_texture_3d must be greater than zero".into(),
            ));
        }
        if limits.max_command_words == 0 {
            return Err(ConfigError::Invalid(
                "limits.max_command_words must be greater than zero".into(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
version = 1
socket_path = "/tmp/.virgl_test"
backend = "null"
max_connections = 4
busy_wait_poll = "2ms"
log_filter = "vgpuserver=debug"

[limits]
max_texture_2d = 8192
max_command_words = 65536

[null_backend]
fence_latency = 0
"#;

    #[test]
    fn parses_sample_config() {
        let config = ServerConfig::from_toml_str(SAMPLE).expect("parse config");
        assert_eq!(config.backend, BackendKind::Null);
        assert_eq!(config.max_connections, 4);
        assert_eq!(config.busy_wait_poll, Duration::from_millis(2));
        assert_eq!(config.limits.max_texture_2d, 8192);
        assert_eq!(config.limits.max_texture_3d, 2048);
        assert_eq!(config.null_backend.fence_latency, 0);
        assert_eq!(
            config.socket_path.as_deref(),
            Some(Path::new("/tmp/.virgl_test"))
        );
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let config = ServerConfig::from_toml_str("version = 1").unwrap();
        assert_eq!(config, ServerConfig::default());
    }

    #[test]
    fn rejects_bad_values() {
        for input in [
            "version = 2",
            "version = 1\nmax_connections = 0",
            "version = 1\nbusy_wait_poll = \"5s\"",
            "version = 1\n[limits]\nmax_texture_2d = 32768",
            "version = 1\n[limits]\nmax_command_words = 0",
        ] {
            let err = ServerConfig::from_toml_str(input).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid(_)), "{input}: {err}");
        }
    }

    #[test]
    fn rejects_unknown_backend() {
        let err = ServerConfig::from_toml_str("version = 1\nbackend = \"vulkan\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn printed_config_parses_back() {
        let config = ServerConfig::from_toml_str(SAMPLE).unwrap();
        let printed = config.to_toml_string().unwrap();
        assert!(printed.contains("busy_wait_poll = \"2ms\""));
        assert_eq!(ServerConfig::from_toml_str(&printed).unwrap(), config);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        assert_eq!(
            ServerConfig::load_or_default(&path).unwrap(),
            ServerConfig::default()
        );
        assert!(matches!(
            ServerConfig::load(&path).unwrap_err(),
            ConfigError::Io { .. }
        ));

        fs::write(&path, SAMPLE).unwrap();
        assert_eq!(ServerConfig::load(&path).unwrap().max_connections, 4);
    }
}
