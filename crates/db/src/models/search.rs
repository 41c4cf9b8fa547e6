//! Search filters and paging for service listings.

use pipewright_core::scheduling::ServiceState;
use pipewright_core::types::{ServiceId, Timestamp};
use serde::{Deserialize, Serialize};

/// Default number of items per page.
pub const DEFAULT_PAGE_SIZE: u32 = 50;

/// Upper bound on a requested page size.
pub const MAX_PAGE_SIZE: u32 = 1000;

/// Field filters; unset fields match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServicePattern {
    /// Exact name, or a glob with `*` wildcards.
    pub name: Option<String>,
    #[serde(default)]
    pub states: Vec<ServiceState>,
    pub owner_key: Option<String>,
    /// Every listed tag must be present.
    #[serde(default)]
    pub tags: Vec<String>,
    pub parent_id: Option<ServiceId>,
    pub root_id: Option<ServiceId>,
    pub queue_id: Option<String>,
}

impl ServicePattern {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn in_states(mut self, states: &[ServiceState]) -> Self {
        self.states = states.to_vec();
        self
    }

    /// SQL `LIKE` form of the name filter.
    pub fn name_like(&self) -> Option<String> {
        self.name.as_ref().map(|n| {
            n.replace('\\', "\\\\")
                .replace('%', "\\%")
                .replace('_', "\\_")
                .replace('*', "%")
        })
    }
}

/// Half-open window `[from, to)` on creation time.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TimeRange {
    pub from: Option<Timestamp>,
    pub to: Option<Timestamp>,
}

impl TimeRange {
    pub fn contains(&self, ts: Timestamp) -> bool {
        self.from.map_or(true, |from| ts >= from) && self.to.map_or(true, |to| ts < to)
    }
}

/// Zero-based page request. Results are ordered newest first.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PageRequest {
    pub page: u32,
    pub page_size: u32,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 0,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl PageRequest {
    pub fn new(page: u32, page_size: u32) -> Self {
        Self { page, page_size }
    }

    /// Page size clamped to `1..=MAX_PAGE_SIZE`.
    pub fn limit(&self) -> i64 {
        i64::from(self.page_size.clamp(1, MAX_PAGE_SIZE))
    }

    pub fn offset(&self) -> i64 {
        i64::from(self.page) * self.limit()
    }
}

/// One page of results plus the total match count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub page_size: u32,
    pub total: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    #[test]
    fn glob_becomes_like_pattern() {
        let p = ServicePattern::named("lsm_*");
        assert_eq!(p.name_like().as_deref(), Some("lsm\\_%"));
    }

    #[test]
    fn page_bounds() {
        assert_eq!(PageRequest::new(2, 10).offset(), 20);
        assert_eq!(PageRequest::new(0, 0).limit(), 1);
        assert_eq!(PageRequest::new(0, 5000).limit(), i64::from(MAX_PAGE_SIZE));
    }

    #[test]
    fn time_range_is_half_open() {
        let now = Utc::now();
        let range = TimeRange {
            from: Some(now),
            to: Some(now + Duration::seconds(1)),
        };
        assert!(range.contains(now));
        assert!(!range.contains(now + Duration::seconds(1)));
        assert!(TimeRange::default().contains(now));
    }
}
