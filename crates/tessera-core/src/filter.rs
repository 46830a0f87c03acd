//! Query filters over stored records
//!
//! Every predicate is optional and all supplied predicates are combined
//! conjunctively. Filters normalize themselves as they are built: level
//! names are mapped onto [`LogLevel`] and pagination is clamped.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use regex::Regex;

use crate::error::FilterError;
use crate::level::LogLevel;
use crate::record::StorageRecord;

/// Page size used when none (or zero) is requested
pub const DEFAULT_LIMIT: usize = 100;

/// Largest page a single query may return
pub const MAX_LIMIT: usize = 10_000;

/// The instant `hours` before now, saturating at the earliest representable time
pub fn hours_ago(hours: u32) -> DateTime<Utc> {
    saturating_ago(Duration::try_hours(i64::from(hours)))
}

/// The instant `days` before now, saturating at the earliest representable time
pub fn days_ago(days: u32) -> DateTime<Utc> {
    saturating_ago(Duration::try_days(i64::from(days)))
}

fn saturating_ago(span: Option<Duration>) -> DateTime<Utc> {
    span.and_then(|span| Utc::now().checked_sub_signed(span))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Result ordering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    /// Most recent record first
    #[default]
    NewestFirst,
    /// Emission order
    Chronological,
}

/// Filter and pagination for record queries
#[derive(Debug, Clone)]
pub struct QueryFilter {
    pub owner_id: Option<String>,
    pub execution_id: Option<String>,
    pub namespace: Option<String>,
    pub correlation_id: Option<String>,
    pub levels: Option<BTreeSet<LogLevel>>,
    /// Inclusive lower bound on the event timestamp
    pub start_time: Option<DateTime<Utc>>,
    /// Exclusive upper bound on the event timestamp
    pub end_time: Option<DateTime<Utc>>,
    /// Lower-cased substring matched case-insensitively
    message_contains: Option<String>,
    message_pattern: Option<Regex>,
    limit: usize,
    offset: usize,
    pub order: SortOrder,
}

impl Default for QueryFilter {
    fn default() -> Self {
        Self {
            owner_id: None,
            execution_id: None,
            namespace: None,
            correlation_id: None,
            levels: None,
            start_time: None,
            end_time: None,
            message_contains: None,
            message_pattern: None,
            limit: DEFAULT_LIMIT,
            offset: 0,
            order: SortOrder::default(),
        }
    }
}

impl QueryFilter {
    /// Match everything, newest first, default page size
    pub fn new() -> Self {
        Self::default()
    }

    /// Only records of this owner
    pub fn owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    /// Only records of this execution
    pub fn execution(mut self, execution_id: impl Into<String>) -> Self {
        self.execution_id = Some(execution_id.into());
        self
    }

    /// Only records in this namespace
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Only records with this correlation id
    pub fn correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Only records at one of these levels
    ///
    /// Names are matched case-insensitively, aliases included. Unknown
    /// names match nothing; an empty list removes the predicate.
    pub fn levels<I, S>(mut self, levels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut requested = false;
        let mut set = BTreeSet::new();
        for name in levels {
            requested = true;
            match LogLevel::parse(name.as_ref()) {
                Some(level) => {
                    set.insert(level);
                }
                None => tracing::debug!(requested = name.as_ref(), "Ignoring unknown level in filter"),
            }
        }
        self.levels = requested.then_some(set);
        self
    }

    /// Only records with timestamp in `[start, end)`
    pub fn between(
        mut self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Self, FilterError> {
        if start >= end {
            return Err(FilterError::InvalidWindow {
                start: start.to_rfc3339(),
                end: end.to_rfc3339(),
            });
        }
        self.start_time = Some(start);
        self.end_time = Some(end);
        Ok(self)
    }

    /// Only records at or after `start`
    pub fn since(mut self, start: DateTime<Utc>) -> Self {
        self.start_time = Some(start);
        self
    }

    /// Only records strictly before `end`
    pub fn until(mut self, end: DateTime<Utc>) -> Self {
        self.end_time = Some(end);
        self
    }

    /// Only records from the trailing number of hours
    pub fn last_hours(self, hours: u32) -> Self {
        self.since(hours_ago(hours))
    }

    /// Case-insensitive message substring
    pub fn message_contains(mut self, text: impl AsRef<str>) -> Self {
        let text = text.as_ref().trim();
        self.message_contains = if text.is_empty() {
            None
        } else {
            Some(text.to_lowercase())
        };
        self
    }

    /// Regular expression the message must match
    pub fn message_pattern(mut self, pattern: &str) -> Result<Self, FilterError> {
        self.message_pattern = Some(Regex::new(pattern)?);
        Ok(self)
    }

    /// Page size; zero means the default, values above the maximum are capped
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = match limit {
            0 => DEFAULT_LIMIT,
            n => n.min(MAX_LIMIT),
        };
        self
    }

    /// Number of matching records to skip
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Return records in emission order
    pub fn chronological(mut self) -> Self {
        self.order = SortOrder::Chronological;
        self
    }

    pub fn page_limit(&self) -> usize {
        self.limit
    }

    pub fn page_offset(&self) -> usize {
        self.offset
    }

    /// Evaluate every predicate against a record
    pub fn matches(&self, record: &StorageRecord) -> bool {
        if let Some(owner) = &self.owner_id {
            if &record.owner_id != owner {
                return false;
            }
        }
        if let Some(execution) = &self.execution_id {
            if &record.execution_id != execution {
                return false;
            }
        }
        if let Some(namespace) = &self.namespace {
            if &record.namespace != namespace {
                return false;
            }
        }
        if let Some(correlation) = &self.correlation_id {
            if &record.correlation_id != correlation {
                return false;
            }
        }
        if let Some(levels) = &self.levels {
            if !levels.contains(&record.level) {
                return false;
            }
        }
        if let Some(start) = self.start_time {
            if record.timestamp < start {
                return false;
            }
        }
        if let Some(end) = self.end_time {
            if record.timestamp >= end {
                return false;
            }
        }
        if let Some(needle) = &self.message_contains {
            if !record.message.to_lowercase().contains(needle) {
                return false;
            }
        }
        if let Some(pattern) = &self.message_pattern {
            if !pattern.is_match(&record.message) {
                return false;
            }
        }
        true
    }
}
