//! Runtime configuration.
//!
//! A [`RuntimeConfig`] is a plain record of the knobs the runtime consults
//! when a worker thread lazily builds its scheduler and reactor: default
//! coroutine stack size, timer-wheel geometry, readiness batch size, and
//! the initial state of the syscall hook layer.
//!
//! Configuration is process-global and read-once. It can come from three
//! places, in increasing precedence:
//!
//! 1. built-in defaults,
//! 2. a TOML document (`RuntimeConfig::from_toml_str`),
//! 3. `WEFT_*` environment variables (`apply_env`).
//!
//! Call [`install`] before the first worker touches the runtime; after a
//! scheduler or reactor exists on any thread, installation is refused.

use std::env;
use std::sync::OnceLock;

use log::warn;
use serde::Deserialize;

/// Process-wide runtime settings.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Default coroutine stack size in bytes, rounded up to a page multiple
    /// at allocation time.
    pub stack_size: usize,
    /// Number of slots in each reactor's timer wheel.
    pub wheel_slots: usize,
    /// Width of one timer-wheel slot in milliseconds.
    pub wheel_granularity_ms: u64,
    /// Maximum readiness events drained per event-loop iteration.
    pub max_events: usize,
    /// Whether the blocking-syscall hook layer starts enabled.
    pub hook_enabled: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            stack_size: 64 * 1024,
            wheel_slots: 1000,
            wheel_granularity_ms: 1,
            max_events: 256,
            hook_enabled: true,
        }
    }
}

impl RuntimeConfig {
    /// Parse a TOML document. Unknown keys are rejected.
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    /// Read and parse a TOML file.
    pub fn from_file(path: &std::path::Path) -> std::io::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Override fields from `WEFT_*` environment variables. Unparseable
    /// values are logged and ignored.
    pub fn apply_env(&mut self) {
        fn parse<T: std::str::FromStr>(name: &str, slot: &mut T) {
            if let Ok(raw) = env::var(name) {
                match raw.parse() {
                    Ok(v) => *slot = v,
                    Err(_) => warn!("ignoring unparseable {name}={raw}"),
                }
            }
        }
        parse("WEFT_STACK_SIZE", &mut self.stack_size);
        parse("WEFT_WHEEL_SLOTS", &mut self.wheel_slots);
        parse("WEFT_WHEEL_GRANULARITY_MS", &mut self.wheel_granularity_ms);
        parse("WEFT_MAX_EVENTS", &mut self.max_events);
        parse("WEFT_HOOK_ENABLED", &mut self.hook_enabled);
    }
}

static CONFIG: OnceLock<RuntimeConfig> = OnceLock::new();

/// Install the process-wide configuration. Returns `false` if a
/// configuration was already installed (or defaulted by first use), in
/// which case the existing one stays in effect.
pub fn install(config: RuntimeConfig) -> bool {
    let hook_enabled = config.hook_enabled;
    let installed = CONFIG.set(config).is_ok();
    if installed {
        crate::hook::set_enabled(hook_enabled);
    } else {
        warn!("runtime configuration already installed; ignoring");
    }
    installed
}

/// The active configuration. First use freezes defaults plus any `WEFT_*`
/// environment overrides.
pub fn runtime() -> &'static RuntimeConfig {
    CONFIG.get_or_init(|| {
        let mut config = RuntimeConfig::default();
        config.apply_env();
        config
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.stack_size, 64 * 1024);
        assert_eq!(config.wheel_slots, 1000);
        assert_eq!(config.wheel_granularity_ms, 1);
        assert_eq!(config.max_events, 256);
        assert!(config.hook_enabled);
    }

    #[test]
    fn parses_toml() {
        let config = RuntimeConfig::from_toml_str(
            "stack_size = 131072\nwheel_slots = 512\nhook_enabled = false\n",
        )
        .unwrap();
        assert_eq!(config.stack_size, 131072);
        assert_eq!(config.wheel_slots, 512);
        assert!(!config.hook_enabled);
        // unspecified keys keep their defaults
        assert_eq!(config.max_events, 256);
    }

    #[test]
    fn rejects_unknown_keys() {
        assert!(RuntimeConfig::from_toml_str("stak_size = 1\n").is_err());
    }

    #[test]
    fn loads_from_file() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "wheel_slots = 128\nwheel_granularity_ms = 4\n").unwrap();
        let config = RuntimeConfig::from_file(file.path()).unwrap();
        assert_eq!(config.wheel_slots, 128);
        assert_eq!(config.wheel_granularity_ms, 4);
        assert!(RuntimeConfig::from_file(std::path::Path::new("/nonexistent/weft.toml")).is_err());
    }

    #[test]
    fn env_overrides() {
        let mut config = RuntimeConfig::default();
        env::set_var("WEFT_MAX_EVENTS", "128");
        env::set_var("WEFT_WHEEL_GRANULARITY_MS", "not-a-number");
        config.apply_env();
        env::remove_var("WEFT_MAX_EVENTS");
        env::remove_var("WEFT_WHEEL_GRANULARITY_MS");
        assert_eq!(config.max_events, 128);
        assert_eq!(config.wheel_granularity_ms, 1);
    }
}
