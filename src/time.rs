//! Timestamps used by head nodes and the master block.
use std::cmp::Ordering;

use chrono::prelude::*;
use serde_derive::{Deserialize, Serialize};

/// A point in time, used for `createTime`/`modifyTime` on Afs objects.
///
/// Every mutating Afs operation takes an explicit `AfsTime` rather than
/// sampling the clock internally, so that callers (and tests) control
/// exactly what gets recorded.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct AfsTime {
    inner: DateTime<Utc>,
}

impl AfsTime {
    /// The current wall-clock time.
    pub fn now() -> Self {
        AfsTime { inner: Utc::now() }
    }

    /// Seconds since the Unix epoch.
    pub fn unix_timestamp(self) -> i64 {
        self.inner.timestamp()
    }
}

impl PartialOrd for AfsTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for AfsTime {
    fn cmp(&self, other: &Self) -> Ordering {
        self.inner.cmp(&other.inner)
    }
}
