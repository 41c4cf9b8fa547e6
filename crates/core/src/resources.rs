//! Typed view over a service's free-form resource map.
//!
//! The resource map is a `String -> String` bag of hints (CPU type, memory,
//! slot count, duration limits). Leaf processors forward the hints they
//! understand; the engine only reads the hard duration limit.

use std::collections::BTreeMap;
use std::time::Duration;

pub const RESOURCE_CPU_TYPE: &str = "cpuType";
pub const RESOURCE_MEMORY_GB: &str = "memoryGB";
pub const RESOURCE_SLOTS: &str = "slots";
pub const RESOURCE_SOFT_DURATION_SECS: &str = "softDurationSecs";
pub const RESOURCE_HARD_DURATION_SECS: &str = "hardDurationSecs";

/// Borrowed accessor over a resource map. Unparseable values read as absent.
#[derive(Debug, Clone, Copy)]
pub struct ResourceHints<'a> {
    map: &'a BTreeMap<String, String>,
}

impl<'a> ResourceHints<'a> {
    pub fn new(map: &'a BTreeMap<String, String>) -> Self {
        Self { map }
    }

    pub fn cpu_type(&self) -> Option<&'a str> {
        self.map.get(RESOURCE_CPU_TYPE).map(String::as_str)
    }

    pub fn memory_gb(&self) -> Option<u32> {
        self.parse(RESOURCE_MEMORY_GB)
    }

    /// Number of slots requested, at least one.
    pub fn slots(&self) -> u32 {
        self.parse(RESOURCE_SLOTS).unwrap_or(1).max(1)
    }

    pub fn soft_duration(&self) -> Option<Duration> {
        self.parse(RESOURCE_SOFT_DURATION_SECS).map(Duration::from_secs)
    }

    pub fn hard_duration(&self) -> Option<Duration> {
        self.parse(RESOURCE_HARD_DURATION_SECS).map(Duration::from_secs)
    }

    fn parse<T: std::str::FromStr>(&self, key: &str) -> Option<T> {
        self.map.get(key).and_then(|v| v.trim().parse().ok())
    }
}
