//! Heap Configuration System
//!
//! Size-class boundaries and segment geometry, with validation and environment
//! support. [`HeapSettings`] carries the raw inputs (defaults, TOML files,
//! `RMAHEAP_*` variables); [`HeapConfig`] is the validated, power-of-two rounded
//! form the heap is built from.

use crate::error::{HeapError, HeapResult};
use garde::Validate;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

/// Prefix of every environment variable read by [`HeapSettings::from_env`]
pub const ENV_PREFIX: &str = "RMAHEAP_";

/// Spacing of the linear tiny size classes is `1 << TINY_INCREMENT_SHIFT`
pub const TINY_INCREMENT_SHIFT: usize = 3;

/// Largest accepted size input; keeps `2 * large_limit` rounding representable
pub const MAX_SIZE_INPUT: usize = 1 << (usize::BITS - 3);

const DEFAULT_NEVER_FREE: bool = false;
const DEFAULT_NUM_RESERVE_SEGMENTS: usize = 16;
const DEFAULT_TINY_LIMIT: usize = 128;
const DEFAULT_SMALL_LIMIT: usize = 4096;
const DEFAULT_LARGE_LIMIT: usize = 2_097_152;
const DEFAULT_TINY_SEGMENT_SIZE: usize = 65_536;
const DEFAULT_SMALL_SEGMENT_SIZE: usize = 65_536;
const DEFAULT_LARGE_SEGMENT_SIZE: usize = 2_097_152;

/// `1` for `n < 2`, otherwise the bit length of `n`
#[must_use]
pub const fn log2_c(n: usize) -> usize {
    if n < 2 {
        1
    } else {
        (usize::BITS - n.leading_zeros()) as usize
    }
}

/// Smallest power of two `>= n`, `None` on overflow
#[must_use]
pub const fn round_up_pow2(n: usize) -> Option<usize> {
    n.checked_next_power_of_two()
}

/// Raw heap configuration inputs
///
/// Missing keys in a file or environment keep the compiled-in defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct HeapSettings {
    /// Keep every segment alive once created
    #[garde(skip)]
    pub never_free: bool,

    /// Segments a pool keeps even when they become empty
    #[garde(range(max = MAX_SIZE_INPUT))]
    pub num_reserve_segments: usize,

    /// Largest size served by the linear tiny classes
    #[garde(range(min = 8, max = MAX_SIZE_INPUT))]
    pub tiny_limit: usize,

    /// Largest size served by the small classes
    #[garde(range(min = 16, max = MAX_SIZE_INPUT))]
    pub small_limit: usize,

    /// Largest size served by the large classes
    #[garde(range(min = 32, max = MAX_SIZE_INPUT))]
    pub large_limit: usize,

    /// Segment size backing tiny classes
    #[garde(range(min = 8, max = MAX_SIZE_INPUT))]
    pub tiny_segment_size: usize,

    /// Segment size backing small classes
    #[garde(range(min = 16, max = MAX_SIZE_INPUT))]
    pub small_segment_size: usize,

    /// Segment size backing large classes
    #[garde(range(min = 32, max = MAX_SIZE_INPUT))]
    pub large_segment_size: usize,
}

impl Default for HeapSettings {
    fn default() -> Self {
        Self {
            never_free: DEFAULT_NEVER_FREE,
            num_reserve_segments: DEFAULT_NUM_RESERVE_SEGMENTS,
            tiny_limit: DEFAULT_TINY_LIMIT,
            small_limit: DEFAULT_SMALL_LIMIT,
            large_limit: DEFAULT_LARGE_LIMIT,
            tiny_segment_size: DEFAULT_TINY_SEGMENT_SIZE,
            small_segment_size: DEFAULT_SMALL_SEGMENT_SIZE,
            large_segment_size: DEFAULT_LARGE_SEGMENT_SIZE,
        }
    }
}

impl HeapSettings {
    /// Defaults overridden by `RMAHEAP_*` environment variables
    ///
    /// A malformed value falls back to that key's default and is logged.
    #[must_use]
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Load a TOML file, then apply environment overrides
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or does not deserialize.
    pub fn from_file(path: impl AsRef<Path>) -> HeapResult<Self> {
        let path = path.as_ref();
        let settings: Self = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Toml))
            .build()
            .and_then(config::Config::try_deserialize)
            .map_err(|e| HeapError::config(format!("{}: {e}", path.display())))?;

        tracing::debug!(path = %path.display(), "loaded heap settings");
        Ok(settings.with_env_overrides())
    }

    /// Serialize to TOML, the format read by [`HeapSettings::from_file`]
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_toml(&self) -> HeapResult<String> {
        toml::to_string_pretty(self).map_err(|e| HeapError::config(e.to_string()))
    }

    /// Replace each field whose environment variable is set
    #[must_use]
    pub fn with_env_overrides(self) -> Self {
        Self {
            never_free: env_value("NEVER_FREE", self.never_free, parse_bool),
            num_reserve_segments: env_value(
                "NUM_RESERVE_SEGMENTS",
                self.num_reserve_segments,
                parse_number,
            ),
            tiny_limit: env_value("TINY_LIMIT", self.tiny_limit, parse_number),
            small_limit: env_value("SMALL_LIMIT", self.small_limit, parse_number),
            large_limit: env_value("LARGE_LIMIT", self.large_limit, parse_number),
            tiny_segment_size: env_value("TINY_SEGMENT_SIZE", self.tiny_segment_size, parse_number),
            small_segment_size: env_value(
                "SMALL_SEGMENT_SIZE",
                self.small_segment_size,
                parse_number,
            ),
            large_segment_size: env_value(
                "LARGE_SEGMENT_SIZE",
                self.large_segment_size,
                parse_number,
            ),
        }
    }
}

fn env_value<T>(key: &str, default: T, parse: fn(&str) -> Option<T>) -> T {
    let name = format!("{ENV_PREFIX}{key}");
    let Ok(raw) = std::env::var(&name) else {
        return default;
    };
    parse(raw.trim()).unwrap_or_else(|| {
        tracing::warn!(variable = %name, value = %raw, "malformed value, using default");
        default
    })
}

fn parse_number(raw: &str) -> Option<usize> {
    usize::from_str(raw).ok()
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Validated size-class description
///
/// All sizes are powers of two. Derived values are computed once in
/// [`HeapConfig::new`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapConfig {
    never_free: bool,
    num_reserve_segments: usize,
    tiny_limit: usize,
    small_limit: usize,
    large_limit: usize,
    tiny_segment_size: usize,
    small_segment_size: usize,
    large_segment_size: usize,
    bucket_shift: usize,
    tiny_increment: usize,
    num_tiny_heaps: usize,
    num_small_heaps: usize,
    num_large_heaps: usize,
}

impl HeapConfig {
    /// Validate `settings`, round sizes up to powers of two and derive bucket geometry
    ///
    /// # Errors
    ///
    /// Returns [`HeapError::Configuration`] if a field is out of range, the limits
    /// are not strictly increasing, or a limit exceeds its segment size.
    pub fn new(settings: HeapSettings) -> HeapResult<Self> {
        garde::Validate::validate(&settings, &())
            .map_err(|e| HeapError::config(format!("invalid heap settings: {e}")))?;

        let round = |name: &str, value: usize| {
            round_up_pow2(value).ok_or_else(|| HeapError::config(format!("{name} ({value}) overflows")))
        };
        let tiny_limit = round("tiny_limit", settings.tiny_limit)?;
        let small_limit = round("small_limit", settings.small_limit)?;
        let large_limit = round("large_limit", settings.large_limit)?;
        let tiny_segment_size = round("tiny_segment_size", settings.tiny_segment_size)?;
        let small_segment_size = round("small_segment_size", settings.small_segment_size)?;
        let large_segment_size = round("large_segment_size", settings.large_segment_size)?;

        if tiny_limit >= small_limit {
            return Err(HeapError::config(format!(
                "tiny_limit ({tiny_limit}) must be less than small_limit ({small_limit})"
            )));
        }
        if small_limit >= large_limit {
            return Err(HeapError::config(format!(
                "small_limit ({small_limit}) must be less than large_limit ({large_limit})"
            )));
        }
        for (limit_name, limit, segment_name, segment) in [
            ("tiny_limit", tiny_limit, "tiny_segment_size", tiny_segment_size),
            ("small_limit", small_limit, "small_segment_size", small_segment_size),
            ("large_limit", large_limit, "large_segment_size", large_segment_size),
        ] {
            if limit > segment {
                return Err(HeapError::config(format!(
                    "{limit_name} ({limit}) exceeds {segment_name} ({segment})"
                )));
            }
        }

        let tiny_increment = 1 << TINY_INCREMENT_SHIFT;
        Ok(Self {
            never_free: settings.never_free,
            num_reserve_segments: settings.num_reserve_segments,
            tiny_limit,
            small_limit,
            large_limit,
            tiny_segment_size,
            small_segment_size,
            large_segment_size,
            bucket_shift: log2_c(tiny_limit) - 1,
            tiny_increment,
            num_tiny_heaps: tiny_limit / tiny_increment,
            num_small_heaps: log2_c(small_limit) - log2_c(tiny_limit),
            num_large_heaps: log2_c(large_limit) - log2_c(small_limit),
        })
    }

    /// Configuration from `RMAHEAP_*` environment variables
    ///
    /// # Errors
    ///
    /// Returns error if the resulting values violate the structural constraints.
    pub fn from_env() -> HeapResult<Self> {
        Self::new(HeapSettings::from_env())
    }

    /// Configuration from a TOML file plus environment overrides
    ///
    /// # Errors
    ///
    /// Returns error if loading fails or the values are invalid.
    pub fn from_file(path: impl AsRef<Path>) -> HeapResult<Self> {
        Self::new(HeapSettings::from_file(path)?)
    }

    /// Keep every segment alive once created
    #[must_use]
    pub const fn never_free(&self) -> bool {
        self.never_free
    }

    /// Segments a pool keeps even when empty
    #[must_use]
    pub const fn num_reserve_segments(&self) -> usize {
        self.num_reserve_segments
    }

    /// Tiny class limit
    #[must_use]
    pub const fn tiny_limit(&self) -> usize {
        self.tiny_limit
    }

    /// Small class limit
    #[must_use]
    pub const fn small_limit(&self) -> usize {
        self.small_limit
    }

    /// Large class limit
    #[must_use]
    pub const fn large_limit(&self) -> usize {
        self.large_limit
    }

    /// Tiny segment size
    #[must_use]
    pub const fn tiny_segment_size(&self) -> usize {
        self.tiny_segment_size
    }

    /// Small segment size
    #[must_use]
    pub const fn small_segment_size(&self) -> usize {
        self.small_segment_size
    }

    /// Large segment size
    #[must_use]
    pub const fn large_segment_size(&self) -> usize {
        self.large_segment_size
    }

    /// Shift applied before taking `log2_c` in the exponential buckets
    #[must_use]
    pub const fn bucket_shift(&self) -> usize {
        self.bucket_shift
    }

    /// Shift of the tiny class spacing
    #[must_use]
    pub const fn tiny_increment_shift(&self) -> usize {
        TINY_INCREMENT_SHIFT
    }

    /// Tiny class spacing in bytes
    #[must_use]
    pub const fn tiny_increment(&self) -> usize {
        self.tiny_increment
    }

    /// Number of tiny classes
    #[must_use]
    pub const fn num_tiny_heaps(&self) -> usize {
        self.num_tiny_heaps
    }

    /// Number of small classes
    #[must_use]
    pub const fn num_small_heaps(&self) -> usize {
        self.num_small_heaps
    }

    /// Number of large classes
    #[must_use]
    pub const fn num_large_heaps(&self) -> usize {
        self.num_large_heaps
    }

    /// Largest size served by the exponential buckets, the next power of two of `2 * large_limit`
    #[must_use]
    pub const fn max_size(&self) -> usize {
        // large_limit is a power of two below MAX_SIZE_INPUT
        self.large_limit << 1
    }
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            never_free: DEFAULT_NEVER_FREE,
            num_reserve_segments: DEFAULT_NUM_RESERVE_SEGMENTS,
            tiny_limit: DEFAULT_TINY_LIMIT,
            small_limit: DEFAULT_SMALL_LIMIT,
            large_limit: DEFAULT_LARGE_LIMIT,
            tiny_segment_size: DEFAULT_TINY_SEGMENT_SIZE,
            small_segment_size: DEFAULT_SMALL_SEGMENT_SIZE,
            large_segment_size: DEFAULT_LARGE_SEGMENT_SIZE,
            bucket_shift: log2_c(DEFAULT_TINY_LIMIT) - 1,
            tiny_increment: 1 << TINY_INCREMENT_SHIFT,
            num_tiny_heaps: DEFAULT_TINY_LIMIT >> TINY_INCREMENT_SHIFT,
            num_small_heaps: log2_c(DEFAULT_SMALL_LIMIT) - log2_c(DEFAULT_TINY_LIMIT),
            num_large_heaps: log2_c(DEFAULT_LARGE_LIMIT) - log2_c(DEFAULT_SMALL_LIMIT),
        }
    }
}

impl TryFrom<HeapSettings> for HeapConfig {
    type Error = HeapError;

    fn try_from(settings: HeapSettings) -> HeapResult<Self> {
        Self::new(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(
        tiny: usize,
        small: usize,
        large: usize,
        tiny_seg: usize,
        small_seg: usize,
        large_seg: usize,
    ) -> HeapSettings {
        HeapSettings {
            tiny_limit: tiny,
            small_limit: small,
            large_limit: large,
            tiny_segment_size: tiny_seg,
            small_segment_size: small_seg,
            large_segment_size: large_seg,
            ..HeapSettings::default()
        }
    }

    #[test]
    fn test_defaults() -> HeapResult<()> {
        let config = HeapConfig::default();
        assert!(!config.never_free());
        assert_eq!(config.num_reserve_segments(), 16);
        assert_eq!(config.tiny_limit(), 128);
        assert_eq!(config.small_limit(), 4096);
        assert_eq!(config.large_limit(), 2_097_152);
        assert_eq!(config.tiny_segment_size(), 65_536);
        assert_eq!(config.small_segment_size(), 65_536);
        assert_eq!(config.large_segment_size(), 2_097_152);
        assert_eq!(config.bucket_shift(), 7);
        assert_eq!(config.tiny_increment_shift(), 3);
        assert_eq!(config.tiny_increment(), 8);
        assert_eq!(config.num_tiny_heaps(), 16);
        assert_eq!(config.num_small_heaps(), 5);
        assert_eq!(config.num_large_heaps(), 9);
        assert_eq!(config.max_size(), 4_194_304);

        assert_eq!(HeapConfig::new(HeapSettings::default())?, config);
        Ok(())
    }

    #[test]
    fn test_tiny_limit_changes_derived_values() -> HeapResult<()> {
        let config = HeapConfig::new(HeapSettings {
            tiny_limit: 256,
            ..HeapSettings::default()
        })?;
        assert_eq!(config.bucket_shift(), 8);
        assert_eq!(config.num_tiny_heaps(), 32);
        assert_eq!(config.num_small_heaps(), 4);
        Ok(())
    }

    #[test]
    fn test_small_limit_changes_derived_values() -> HeapResult<()> {
        let config = HeapConfig::new(HeapSettings {
            small_limit: 8192,
            ..HeapSettings::default()
        })?;
        assert_eq!(config.num_small_heaps(), 6);
        assert_eq!(config.num_large_heaps(), 8);
        Ok(())
    }

    #[test]
    fn test_large_limit_changes_derived_values() -> HeapResult<()> {
        let config = HeapConfig::new(HeapSettings {
            large_limit: 32768,
            ..HeapSettings::default()
        })?;
        assert_eq!(config.num_large_heaps(), 3);
        assert_eq!(config.max_size(), 65536);
        Ok(())
    }

    #[test]
    fn test_rounds_to_power_of_two() -> HeapResult<()> {
        let config = HeapConfig::new(HeapSettings {
            never_free: true,
            num_reserve_segments: 17,
            tiny_limit: 200,
            small_limit: 500,
            large_limit: 20000,
            tiny_segment_size: 1000,
            small_segment_size: 3000,
            large_segment_size: 100_000,
        })?;
        assert!(config.never_free());
        assert_eq!(config.num_reserve_segments(), 17);
        assert_eq!(config.tiny_limit(), 256);
        assert_eq!(config.small_limit(), 512);
        assert_eq!(config.large_limit(), 32768);
        assert_eq!(config.tiny_segment_size(), 1024);
        assert_eq!(config.small_segment_size(), 4096);
        assert_eq!(config.large_segment_size(), 131_072);
        Ok(())
    }

    #[test]
    fn test_rejects_unordered_limits() {
        let result = HeapConfig::new(settings(2048, 1024, 2_097_152, 65536, 65536, 2_097_152));
        assert!(
            matches!(result, Err(HeapError::Configuration { ref message }) if message.contains("tiny_limit (2048)"))
        );

        let result = HeapConfig::new(settings(128, 131_072, 65536, 65536, 131_072, 2_097_152));
        assert!(
            matches!(result, Err(HeapError::Configuration { ref message }) if message.contains("small_limit (131072)"))
        );
    }

    #[test]
    fn test_rejects_limit_above_segment_size() {
        for bad in [
            settings(2048, 4096, 2_097_152, 1024, 65536, 2_097_152),
            settings(128, 131_072, 2_097_152, 65536, 65536, 2_097_152),
            settings(128, 4096, 262_144, 65536, 65536, 131_072),
        ] {
            assert!(matches!(
                HeapConfig::new(bad),
                Err(HeapError::Configuration { .. })
            ));
        }
    }

    #[test]
    fn test_rejects_out_of_range_fields() {
        let result = HeapConfig::new(HeapSettings {
            tiny_limit: 4,
            ..HeapSettings::default()
        });
        assert!(matches!(result, Err(HeapError::Configuration { .. })));
    }

    #[test]
    fn test_log2_c() {
        assert_eq!(log2_c(0), 1);
        assert_eq!(log2_c(1), 1);
        assert_eq!(log2_c(2), 2);
        assert_eq!(log2_c(3), 2);
        assert_eq!(log2_c(4), 3);
        assert_eq!(log2_c(128), 8);
        assert_eq!(round_up_pow2(usize::MAX), None);
    }

    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_bool("1"), Some(true));
        assert_eq!(parse_bool("ON"), Some(true));
        assert_eq!(parse_bool("false"), Some(false));
        assert_eq!(parse_bool("foo"), None);
    }

    #[test]
    fn test_toml_round_trip_through_file() -> HeapResult<()> {
        let original = HeapSettings {
            never_free: true,
            tiny_limit: 256,
            ..HeapSettings::default()
        };
        let path = std::env::temp_dir().join(format!("rmaheap-settings-{}.toml", std::process::id()));
        std::fs::write(&path, original.to_toml()?)
            .map_err(|e| HeapError::config(e.to_string()))?;

        let loaded = HeapSettings::from_file(&path);
        let _ = std::fs::remove_file(&path);
        let loaded = loaded?;
        assert!(loaded.never_free);
        assert_eq!(loaded.tiny_limit, 256);
        assert_eq!(loaded.small_limit, original.small_limit);
        Ok(())
    }

    #[test]
    fn test_partial_file_keeps_defaults() -> HeapResult<()> {
        let path = std::env::temp_dir().join(format!("rmaheap-partial-{}.toml", std::process::id()));
        std::fs::write(&path, "small_limit = 8192\n").map_err(|e| HeapError::config(e.to_string()))?;

        let config = HeapConfig::from_file(&path);
        let _ = std::fs::remove_file(&path);
        let config = config?;
        assert_eq!(config.small_limit(), 8192);
        assert_eq!(config.tiny_limit(), 128);
        assert_eq!(config.num_small_heaps(), 6);
        Ok(())
    }
}
