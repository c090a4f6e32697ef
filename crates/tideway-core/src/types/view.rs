use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque `If-Match` style tag carried by every conditionally written record
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionTag(u64);

impl VersionTag {
    pub const INITIAL: VersionTag = VersionTag(0);

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u64 {
        self.0
    }

    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for VersionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Contribution of a group of events to one aggregate
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Delta {
    pub count: u64,
    pub total: f64,
}

impl Delta {
    pub fn new(count: u64, total: f64) -> Self {
        Self { count, total }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0 && self.total == 0.0
    }
}

impl std::ops::Add for Delta {
    type Output = Delta;

    fn add(self, rhs: Delta) -> Delta {
        Delta {
            count: self.count + rhs.count,
            total: self.total + rhs.total,
        }
    }
}

impl std::ops::AddAssign for Delta {
    fn add_assign(&mut self, rhs: Delta) {
        self.count += rhs.count;
        self.total += rhs.total;
    }
}

/// Keyed accumulator derived from the change stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateView {
    pub key: String,
    pub count: u64,
    pub total: f64,
    /// `None` until the view has been written for the first time
    #[serde(default)]
    pub version_tag: Option<VersionTag>,
}

impl AggregateView {
    pub fn empty(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            count: 0,
            total: 0.0,
            version_tag: None,
        }
    }

    /// New value of this view after adding `delta`, keeping the read version
    pub fn with_delta(&self, delta: Delta) -> Self {
        Self {
            key: self.key.clone(),
            count: self.count + delta.count,
            total: self.total + delta.total,
            version_tag: self.version_tag,
        }
    }
}
