use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::dispatch::DEFAULT_HIGH_WATER;
use crate::protocol::{DEFAULT_MAX_PAYLOAD_LEN, StreamId};
use crate::session::{DEFAULT_MAX_RESOLUTION, Resolution};

pub const SERVER_ENV: &str = "BEACH_REEL_SERVER";
pub const MAX_PAYLOAD_ENV: &str = "BEACH_REEL_MAX_PAYLOAD";
pub const QUEUE_WARN_ENV: &str = "BEACH_REEL_QUEUE_WARN";
pub const PREWARM_ENV: &str = "BEACH_REEL_PREWARM";
pub const MAX_RESOLUTION_ENV: &str = "BEACH_REEL_MAX_RESOLUTION";

pub const DEFAULT_SERVER: &str = "192.168.1.62:12345";
pub const DEFAULT_TICK_HZ: u32 = 60;

/// A stream whose session is created up front instead of on first sighting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prewarm {
    pub stream: StreamId,
    pub resolution: Resolution,
}

impl fmt::Display for Prewarm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.stream, self.resolution)
    }
}

impl FromStr for Prewarm {
    type Err = String;

    /// Parses `ID:WIDTHxHEIGHT`, e.g. `0:1920x800`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (stream, resolution) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| format!("expected ID:WIDTHxHEIGHT, got {s:?}"))?;
        let stream = stream
            .trim()
            .parse::<StreamId>()
            .map_err(|err| format!("invalid stream id {stream:?}: {err}"))?;
        Ok(Self {
            stream,
            resolution: resolution.parse()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// `host:port` of the sender.
    pub server: String,
    /// Largest payload a header may announce before it is treated as noise.
    pub max_payload_len: u32,
    /// Largest declared picture size a frame may carry; bigger frames are
    /// dropped before any buffer is sized for them.
    pub max_resolution: Resolution,
    pub tick_hz: u32,
    /// Dispatch queue depth that triggers a warning.
    pub queue_warn_depth: usize,
    pub prewarm: Vec<Prewarm>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: DEFAULT_SERVER.to_string(),
            max_payload_len: DEFAULT_MAX_PAYLOAD_LEN,
            max_resolution: DEFAULT_MAX_RESOLUTION,
            tick_hz: DEFAULT_TICK_HZ,
            queue_warn_depth: DEFAULT_HIGH_WATER,
            prewarm: vec![Prewarm {
                stream: 0,
                resolution: Resolution::new(1920, 800),
            }],
        }
    }
}

impl Config {
    /// Defaults overlaid with whatever the environment sets. Unusable values
    /// are logged and ignored.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let server = env::var(SERVER_ENV)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or(defaults.server);
        // Avoid an IPv6 (::1) preference when resolving localhost.
        let server = if server.starts_with("localhost:") {
            server.replacen("localhost", "127.0.0.1", 1)
        } else {
            server
        };
        Self {
            server,
            max_payload_len: parse_env(MAX_PAYLOAD_ENV, defaults.max_payload_len, 1),
            max_resolution: parse_resolution_env(MAX_RESOLUTION_ENV, defaults.max_resolution),
            tick_hz: defaults.tick_hz,
            queue_warn_depth: parse_env(QUEUE_WARN_ENV, defaults.queue_warn_depth, 1),
            prewarm: match env::var(PREWARM_ENV) {
                Ok(value) => parse_prewarm_list(&value),
                Err(_) => defaults.prewarm,
            },
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(1) / self.tick_hz.max(1)
    }
}

fn parse_env<T>(var: &str, default: T, min: T) -> T
where
    T: FromStr + PartialOrd + fmt::Display + Copy,
    T::Err: fmt::Display,
{
    let Ok(value) = env::var(var) else {
        return default;
    };
    match value.trim().parse::<T>() {
        Ok(parsed) if parsed >= min => parsed,
        Ok(parsed) => {
            tracing::warn!(
                target: "beach_reel::config",
                var,
                %parsed,
                %min,
                %default,
                "config value below minimum; using default"
            );
            default
        }
        Err(err) => {
            tracing::warn!(
                target: "beach_reel::config",
                var,
                error = %err,
                %default,
                "failed to parse config from env; using default"
            );
            default
        }
    }
}

fn parse_resolution_env(var: &str, default: Resolution) -> Resolution {
    let Ok(value) = env::var(var) else {
        return default;
    };
    match value.parse::<Resolution>() {
        Ok(parsed) => parsed,
        Err(err) => {
            tracing::warn!(
                target: "beach_reel::config",
                var,
                error = %err,
                %default,
                "failed to parse config from env; using default"
            );
            default
        }
    }
}

/// Comma separated `ID:WIDTHxHEIGHT` entries. Bad entries are skipped; an
/// empty string disables prewarming.
pub fn parse_prewarm_list(value: &str) -> Vec<Prewarm> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| match entry.parse::<Prewarm>() {
            Ok(prewarm) => Some(prewarm),
            Err(err) => {
                tracing::warn!(
                    target: "beach_reel::config",
                    entry,
                    error = %err,
                    "ignoring prewarm entry"
                );
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{LazyLock, Mutex};

    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    fn clear_env() {
        unsafe {
            for var in [
                SERVER_ENV,
                MAX_PAYLOAD_ENV,
                MAX_RESOLUTION_ENV,
                QUEUE_WARN_ENV,
                PREWARM_ENV,
            ] {
                env::remove_var(var);
            }
        }
    }

    #[test]
    fn defaults_prewarm_stream_zero() {
        let config = Config::default();
        assert_eq!(config.server, "192.168.1.62:12345");
        assert_eq!(config.prewarm, vec!["0:1920x800".parse::<Prewarm>().unwrap()]);
        assert_eq!(config.tick_interval(), Duration::from_secs(1) / 60);
        assert_eq!(config.max_resolution, Resolution::new(4096, 4096));
    }

    #[test]
    fn from_env_without_vars_is_default() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        assert_eq!(Config::from_env(), Config::default());
    }

    #[test]
    fn from_env_reads_overrides() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        unsafe {
            env::set_var(SERVER_ENV, "localhost:9000");
            env::set_var(MAX_PAYLOAD_ENV, "4096");
            env::set_var(MAX_RESOLUTION_ENV, "2560x1440");
            env::set_var(QUEUE_WARN_ENV, "0");
            env::set_var(PREWARM_ENV, "1:640x480, bogus, 2:63x64,3:32x32");
        }
        let config = Config::from_env();
        clear_env();

        assert_eq!(config.server, "127.0.0.1:9000");
        assert_eq!(config.max_payload_len, 4096);
        assert_eq!(config.max_resolution, Resolution::new(2560, 1440));
        assert_eq!(config.queue_warn_depth, DEFAULT_HIGH_WATER);
        assert_eq!(
            config.prewarm,
            vec![
                Prewarm {
                    stream: 1,
                    resolution: Resolution::new(640, 480),
                },
                Prewarm {
                    stream: 3,
                    resolution: Resolution::new(32, 32),
                },
            ]
        );
    }

    #[test]
    fn empty_prewarm_disables_it() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        unsafe {
            env::set_var(PREWARM_ENV, "");
        }
        let config = Config::from_env();
        clear_env();
        assert!(config.prewarm.is_empty());
    }

    #[test]
    fn bad_max_resolution_keeps_default() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        unsafe {
            env::set_var(MAX_RESOLUTION_ENV, "1921x1080");
        }
        let config = Config::from_env();
        clear_env();
        assert_eq!(config.max_resolution, DEFAULT_MAX_RESOLUTION);
    }

    #[test]
    fn prewarm_parse_errors() {
        assert!("300:64x64".parse::<Prewarm>().is_err());
        assert!("1-64x64".parse::<Prewarm>().is_err());
        assert_eq!("7:64x32".parse::<Prewarm>().unwrap().to_string(), "7:64x32");
    }
}
