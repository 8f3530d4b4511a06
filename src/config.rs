//! Tick scheduling configuration.
//!
//! A [`Config`] is built once, usually from boot command line arguments, and
//! used to construct a [`TickSched`](crate::TickSched). The values that may be
//! changed while the system is running are then held in [`Tunables`].
use crate::{
    jiffies::nanos,
    loom::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering::*},
};
use alloc::string::{String, ToString};
use core::{fmt, time::Duration};

/// The default tick frequency, in ticks per second.
pub const HZ: u64 = 1000;

const NSEC_PER_SEC: u64 = 1_000_000_000;

/// Tick scheduling configuration.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Config {
    enabled: bool,
    tick_period: Duration,
    nohz_tick_period: Duration,
    cpus_per_domain: usize,
}

/// Errors returned when parsing a configuration argument.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The argument was not of the form `key=value`.
    #[error("expected a `key=value` argument, found `{0}`")]
    Malformed(String),
    /// The key is not a tick scheduling option.
    #[error("unknown tick scheduling option `{0}`")]
    UnknownKey(String),
    /// The value could not be parsed for this key.
    #[error("invalid value `{value}` for `{key}`")]
    InvalidValue {
        /// The option being set.
        key: &'static str,
        /// The rejected value.
        value: String,
    },
    /// The option must not be zero.
    #[error("`{0}` must be greater than zero")]
    Zero(&'static str),
}

/// The subset of the configuration that may be changed at runtime.
///
/// Every field is an atomic, so tunables may be written from any CPU while
/// tick scheduling is running. Changes take effect the next time a CPU
/// consults them.
pub struct Tunables {
    enabled: AtomicBool,
    nohz_tick_period: AtomicU64,
    cpus_per_domain: AtomicUsize,
}

// === impl Config ===

impl Config {
    /// Returns the default configuration: tickless operation enabled, a tick
    /// frequency of [`HZ`], a nohz tick period of 100 ticks, and domains of
    /// four CPUs.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            enabled: true,
            tick_period: Duration::from_nanos(NSEC_PER_SEC / HZ),
            nohz_tick_period: Duration::from_nanos(100 * NSEC_PER_SEC / HZ),
            cpus_per_domain: 4,
        }
    }

    #[must_use]
    pub const fn with_enabled(self, enabled: bool) -> Self {
        Self { enabled, ..self }
    }

    /// Sets the base tick period.
    #[must_use]
    pub const fn with_tick_period(self, tick_period: Duration) -> Self {
        Self {
            tick_period,
            ..self
        }
    }

    /// Sets the tick period used by CPUs that are marked as nohz-on.
    #[must_use]
    pub const fn with_nohz_tick_period(self, nohz_tick_period: Duration) -> Self {
        Self {
            nohz_tick_period,
            ..self
        }
    }

    /// Sets the number of CPUs grouped into a nohz target domain.
    #[must_use]
    pub const fn with_cpus_per_domain(self, cpus_per_domain: usize) -> Self {
        Self {
            cpus_per_domain,
            ..self
        }
    }

    #[must_use]
    pub const fn enabled(&self) -> bool {
        self.enabled
    }

    #[must_use]
    pub const fn tick_period(&self) -> Duration {
        self.tick_period
    }

    #[must_use]
    pub const fn nohz_tick_period(&self) -> Duration {
        self.nohz_tick_period
    }

    #[must_use]
    pub const fn cpus_per_domain(&self) -> usize {
        self.cpus_per_domain
    }

    /// Applies a single `key=value` argument.
    ///
    /// The following keys are recognized:
    ///
    /// | key              | value                                  |
    /// |------------------|----------------------------------------|
    /// | `nohz`           | `on` or `off`                          |
    /// | `nohz_cpd`       | CPUs per domain, greater than zero     |
    /// | `nohz_period_ns` | nohz tick period in nanoseconds        |
    /// | `tick_period_ns` | base tick period in nanoseconds        |
    ///
    /// On error, the configuration is left unchanged.
    pub fn apply_arg(&mut self, arg: &str) -> Result<(), ConfigError> {
        let (key, value) = arg
            .trim()
            .split_once('=')
            .ok_or_else(|| ConfigError::Malformed(arg.to_string()))?;
        match key {
            "nohz" => {
                self.enabled = match value {
                    "on" => true,
                    "off" => false,
                    _ => return Err(invalid("nohz", value)),
                };
            }
            "nohz_cpd" => {
                self.cpus_per_domain = usize::try_from(nonzero("nohz_cpd", value)?)
                    .map_err(|_| invalid("nohz_cpd", value))?
            }
            "nohz_period_ns" => {
                self.nohz_tick_period = Duration::from_nanos(nonzero("nohz_period_ns", value)?)
            }
            "tick_period_ns" => {
                self.tick_period = Duration::from_nanos(nonzero("tick_period_ns", value)?)
            }
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        }
        tracing::debug!(key, value, "applied tick configuration argument");
        Ok(())
    }

    /// Builds a configuration by applying each argument in `args` to the
    /// defaults, in order.
    pub fn parse_args<'a>(args: impl IntoIterator<Item = &'a str>) -> Result<Self, ConfigError> {
        let mut config = Self::new();
        for arg in args {
            config.apply_arg(arg)?;
        }
        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

fn invalid(key: &'static str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key,
        value: value.to_string(),
    }
}

fn nonzero(key: &'static str, value: &str) -> Result<u64, ConfigError> {
    match value.parse::<u64>() {
        Ok(0) => Err(ConfigError::Zero(key)),
        Ok(n) => Ok(n),
        Err(_) => Err(invalid(key, value)),
    }
}

// === impl Tunables ===

impl Tunables {
    pub(crate) fn new(config: &Config) -> Self {
        Self {
            enabled: AtomicBool::new(config.enabled),
            nohz_tick_period: AtomicU64::new(nanos(config.nohz_tick_period).max(1)),
            cpus_per_domain: AtomicUsize::new(config.cpus_per_domain.max(1)),
        }
    }

    /// Returns `true` if tickless operation is enabled.
    #[inline]
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Acquire)
    }

    /// Enables or disables tickless operation.
    ///
    /// CPUs that already switched to oneshot operation keep their mode;
    /// disabling prevents further switches and makes the idle time queries
    /// report `None`.
    pub fn set_enabled(&self, enabled: bool) {
        tracing::info!(enabled, "tickless operation toggled");
        self.enabled.store(enabled, Release);
    }

    #[must_use]
    pub fn cpus_per_domain(&self) -> usize {
        self.cpus_per_domain.load(Relaxed)
    }

    /// Sets the number of CPUs per nohz target domain. Zero is ignored.
    ///
    /// Returns `true` if the value was updated.
    pub fn set_cpus_per_domain(&self, cpus: usize) -> bool {
        if cpus == 0 {
            return false;
        }
        self.cpus_per_domain.store(cpus, Relaxed);
        true
    }

    #[must_use]
    pub fn nohz_tick_period(&self) -> Duration {
        Duration::from_nanos(self.nohz_tick_period.load(Relaxed))
    }

    /// Sets the tick period of nohz-on CPUs. A zero period is ignored.
    ///
    /// Returns `true` if the value was updated.
    pub fn set_nohz_tick_period(&self, period: Duration) -> bool {
        let period = nanos(period);
        if period == 0 {
            return false;
        }
        self.nohz_tick_period.store(period, Relaxed);
        true
    }
}

impl fmt::Debug for Tunables {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tunables")
            .field("enabled", &self.is_enabled())
            .field("cpus_per_domain", &self.cpus_per_domain())
            .field("nohz_tick_period", &self.nohz_tick_period())
            .finish()
    }
}
