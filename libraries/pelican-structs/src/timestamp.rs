use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// A seconds-granularity Unix timestamp, represented as an integer.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub fn now() -> Self {
        Self(
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("system clock before unix epoch")
                .as_secs(),
        )
    }

    pub fn plus_secs(self, secs: u64) -> Self {
        Self(self.0.saturating_add(secs))
    }

    pub fn is_past(self) -> bool {
        self <= Self::now()
    }
}

/// A nanoseconds-granularity Unix timestamp, used where strict per-mailbox
/// ordering matters.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct NanoTimestamp(pub u64);

impl NanoTimestamp {
    pub fn now() -> Self {
        Self(
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("system clock before unix epoch")
                .as_nanos() as u64,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plus_secs_moves_forward() {
        let t = Timestamp(100);
        assert_eq!(t.plus_secs(30), Timestamp(130));
    }

    #[test]
    fn past_detection() {
        assert!(Timestamp(0).is_past());
        assert!(!Timestamp::now().plus_secs(3600).is_past());
    }
}
