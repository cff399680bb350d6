use serde::{Deserialize, Serialize};

/// Boundary between already-fetched and unseen messages, as provider
/// `internal_date` epoch millis. Messages strictly newer than the cursor
/// are unseen.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(i64);

impl Cursor {
    pub const EPOCH: Cursor = Cursor(0);

    pub fn from_millis(millis: i64) -> Self {
        Self(millis.max(0))
    }

    pub fn millis(self) -> i64 {
        self.0
    }

    pub fn is_cold(self) -> bool {
        self.0 == 0
    }

    /// Whether a message with this internal date lies beyond the cursor.
    pub fn admits(self, internal_date: i64) -> bool {
        internal_date > self.0
    }
}

impl std::fmt::Display for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
