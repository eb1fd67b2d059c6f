//! Session configuration.

use std::time::Duration;

use thiserror::Error;

/// What a read does when the pending message is larger than the caller's
/// buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TruncationPolicy {
    /// Fill the buffer, drop the rest of the message.
    #[default]
    Truncate,
    /// Fail with `BufferTooSmall` and keep the message for the next read.
    Reject,
}

impl std::str::FromStr for TruncationPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "truncate" => Ok(Self::Truncate),
            "reject" => Ok(Self::Reject),
            _ => Err(ConfigError::Invalid {
                key: "VAN_TRUNCATION",
                value: s.to_owned(),
                expected: "`truncate` or `reject`",
            }),
        }
    }
}

/// Configuration shared by a session and the hosts attaching to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VanConfig {
    /// Prefix of every shared memory name, so independent sessions (and
    /// parallel tests) never collide.
    pub namespace: String,
    /// Devices that may be open at once.
    pub max_devices: usize,
    /// Upper bound for blocking reads. `None` waits forever.
    pub read_timeout: Option<Duration>,
    /// How long `open` with `WAIT_FOR_HOST` waits for a host.
    pub attach_timeout: Duration,
    pub truncation: TruncationPolicy,
    /// Trace level applied by `Session::init`.
    pub trace_level: u32,
}

impl Default for VanConfig {
    fn default() -> Self {
        Self {
            namespace: "van".to_owned(),
            max_devices: 8,
            read_timeout: None,
            attach_timeout: Duration::from_secs(1),
            truncation: TruncationPolicy::Truncate,
            trace_level: 0,
        }
    }
}

/// A configuration value could not be used.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid {key}=`{value}`: expected {expected}")]
    Invalid {
        key: &'static str,
        value: String,
        expected: &'static str,
    },
}

impl VanConfig {
    /// Defaults overlaid with the `VAN_*` environment variables.
    ///
    /// # Errors
    ///
    /// [`ConfigError`] naming the first malformed variable.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`VanConfig::from_env`] with an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// See [`VanConfig::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(ns) = lookup("VAN_NAMESPACE") {
            config.namespace = parse_namespace(&ns)?;
        }
        if let Some(max) = lookup("VAN_MAX_DEVICES") {
            config.max_devices = parse_number("VAN_MAX_DEVICES", &max, "a positive integer")?;
            if config.max_devices == 0 {
                return Err(invalid("VAN_MAX_DEVICES", &max, "a positive integer"));
            }
        }
        if let Some(ms) = lookup("VAN_READ_TIMEOUT_MS") {
            let ms: u64 = parse_number("VAN_READ_TIMEOUT_MS", &ms, "milliseconds")?;
            config.read_timeout = Some(Duration::from_millis(ms));
        }
        if let Some(policy) = lookup("VAN_TRUNCATION") {
            config.truncation = policy.parse()?;
        }
        if let Some(level) = lookup("VAN_TRACE") {
            config.trace_level = parse_number("VAN_TRACE", &level, "a trace level")?;
        }
        Ok(config)
    }
}

/// Checks a namespace. Namespaces become part of shared memory names, so they
/// follow the same character rules as device names.
///
/// # Errors
///
/// [`ConfigError::Invalid`] for empty, overlong or non-portable names.
pub fn parse_namespace(ns: &str) -> Result<String, ConfigError> {
    let valid = !ns.is_empty()
        && ns.len() <= 64
        && ns
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'));
    if valid {
        Ok(ns.to_owned())
    } else {
        Err(invalid("VAN_NAMESPACE", ns, "1..=64 characters from [A-Za-z0-9_.-]"))
    }
}

fn parse_number<T: std::str::FromStr>(
    key: &'static str,
    value: &str,
    expected: &'static str,
) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| invalid(key, value, expected))
}

fn invalid(key: &'static str, value: &str, expected: &'static str) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_owned(),
        expected,
    }
}
