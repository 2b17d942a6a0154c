//! Deployment constants and the small, in-process configuration surface
//! for knobs that are set once per deployment rather than per call.

use std::time::Duration;

use snafu::Snafu;

/// Number of iovec entries contributed per key tuple: one for the key
/// header, one for the key bytes.
pub const KEY_IOVS: usize = 2;

/// Number of iovec entries contributed per value tuple: one for the value
/// header, one for the value bytes.
pub const VAL_IOVS: usize = 2;

/// Magic identifying an encoded key-tuple header.
pub const C1_KEY_MAGIC: u32 = 0xc1_4b_45_59; // "C1KEY" (truncated)

/// Magic identifying an encoded value-tuple header.
pub const C1_VAL_MAGIC: u32 = 0xc1_76_61_6c; // "C1val" (truncated)

/// Sentinel for "no value sequence number has ever been observed".
pub const INVALID_SEQNO: u64 = u64::MAX;

/// Growth increment for the log's scratch buffer: it is grown in multiples
/// of this size.
pub const DEFAULT_SCRATCH_GROWTH_UNIT: usize = 128 * 1024;

/// Soft ceiling above which the scratch buffer is released back to empty
/// after a bundle that forced it past this size.
pub const DEFAULT_SCRATCH_SOFT_CEILING: usize = 256 * 1024;

/// Fraction of total capacity usable for payload; the remainder is
/// headroom reserved for media-log metadata overhead.
pub const DEFAULT_USABLE_CAPACITY_NUM: u64 = 9;
pub const DEFAULT_USABLE_CAPACITY_DEN: u64 = 10;

/// Rounds `n` up to the next multiple of 16.
///
/// Header and iovec-array regions within the scratch buffer are placed on
/// 16-byte boundaries so they can be read back as a contiguous, aligned
/// gather list.
#[must_use]
pub const fn align16(n: usize) -> usize {
    (n + 15) & !15
}

/// Rounds `n` up to the next multiple of `unit`.
#[must_use]
pub const fn round_up_to(n: usize, unit: usize) -> usize {
    if unit == 0 {
        return n;
    }
    let rem = n % unit;
    if rem == 0 {
        n
    } else {
        n + (unit - rem)
    }
}

/// Error returned when a [`LogConfig`] is built with invalid parameters.
#[derive(Debug, Snafu)]
pub enum ConfigBuildError {
    #[snafu(display("parameter '{param_name}' was invalid: {reason}"))]
    InvalidParameter {
        param_name: &'static str,
        reason: String,
    },
}

/// Deployment-level configuration for a log instance.
///
/// This is in-process, builder-validated configuration, not a file or
/// environment loader — those belong to the orchestration layer that
/// routes bundles to logs and is out of scope for this core.
#[derive(Clone, Copy, Debug)]
pub struct LogConfig {
    pub(crate) usable_capacity_num: u64,
    pub(crate) usable_capacity_den: u64,
    pub(crate) scratch_growth_unit: usize,
    pub(crate) scratch_soft_ceiling: usize,
    pub(crate) flush_interval: Duration,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            usable_capacity_num: DEFAULT_USABLE_CAPACITY_NUM,
            usable_capacity_den: DEFAULT_USABLE_CAPACITY_DEN,
            scratch_growth_unit: DEFAULT_SCRATCH_GROWTH_UNIT,
            scratch_soft_ceiling: DEFAULT_SCRATCH_SOFT_CEILING,
            flush_interval: Duration::from_millis(500),
        }
    }
}

impl LogConfig {
    /// Returns a builder seeded with the default deployment constants.
    #[must_use]
    pub fn builder() -> LogConfigBuilder {
        LogConfigBuilder::default()
    }

    /// Computes the usable capacity for a given total `capacity`, applying
    /// this config's fraction and rounding down.
    #[must_use]
    pub(crate) fn usable_capacity(&self, capacity: u64) -> u64 {
        capacity
            .saturating_mul(self.usable_capacity_num)
            .wrapping_div(self.usable_capacity_den)
    }
}

/// Builder for [`LogConfig`].
#[derive(Clone, Copy, Debug, Default)]
pub struct LogConfigBuilder {
    usable_capacity_num: Option<u64>,
    usable_capacity_den: Option<u64>,
    scratch_growth_unit: Option<usize>,
    scratch_soft_ceiling: Option<usize>,
    flush_interval: Option<Duration>,
}

impl LogConfigBuilder {
    /// Sets the usable-capacity fraction as `num / den`.
    ///
    /// Defaults to 9/10.
    #[must_use]
    pub fn usable_capacity_fraction(mut self, num: u64, den: u64) -> Self {
        self.usable_capacity_num = Some(num);
        self.usable_capacity_den = Some(den);
        self
    }

    /// Sets the scratch-buffer growth increment, in bytes.
    ///
    /// Defaults to 128 KiB.
    #[must_use]
    pub fn scratch_growth_unit(mut self, amount: usize) -> Self {
        self.scratch_growth_unit = Some(amount);
        self
    }

    /// Sets the scratch-buffer soft ceiling, in bytes.
    ///
    /// Defaults to 256 KiB.
    #[must_use]
    pub fn scratch_soft_ceiling(mut self, amount: usize) -> Self {
        self.scratch_soft_ceiling = Some(amount);
        self
    }

    /// Sets the flush interval advisory used by higher layers to decide
    /// when to call [`crate::handle::LogHandle::flush`].
    ///
    /// Defaults to 500ms.
    #[must_use]
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = Some(interval);
        self
    }

    /// Consumes this builder and constructs a [`LogConfig`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigBuildError`] if any parameter is out of range.
    pub fn build(self) -> Result<LogConfig, ConfigBuildError> {
        let usable_capacity_den = self.usable_capacity_den.unwrap_or(DEFAULT_USABLE_CAPACITY_DEN);
        if usable_capacity_den == 0 {
            return Err(ConfigBuildError::InvalidParameter {
                param_name: "usable_capacity_fraction",
                reason: "denominator cannot be zero".to_string(),
            });
        }

        let usable_capacity_num = self.usable_capacity_num.unwrap_or(DEFAULT_USABLE_CAPACITY_NUM);
        if usable_capacity_num > usable_capacity_den {
            return Err(ConfigBuildError::InvalidParameter {
                param_name: "usable_capacity_fraction",
                reason: "numerator cannot exceed denominator".to_string(),
            });
        }

        let scratch_growth_unit = self.scratch_growth_unit.unwrap_or(DEFAULT_SCRATCH_GROWTH_UNIT);
        if scratch_growth_unit == 0 {
            return Err(ConfigBuildError::InvalidParameter {
                param_name: "scratch_growth_unit",
                reason: "cannot be zero".to_string(),
            });
        }

        let scratch_soft_ceiling = self
            .scratch_soft_ceiling
            .unwrap_or(DEFAULT_SCRATCH_SOFT_CEILING);
        if scratch_soft_ceiling < scratch_growth_unit {
            return Err(ConfigBuildError::InvalidParameter {
                param_name: "scratch_soft_ceiling",
                reason: "must be at least as large as the scratch growth unit".to_string(),
            });
        }

        Ok(LogConfig {
            usable_capacity_num,
            usable_capacity_den,
            scratch_growth_unit,
            scratch_soft_ceiling,
            flush_interval: self.flush_interval.unwrap_or(Duration::from_millis(500)),
        })
    }
}
