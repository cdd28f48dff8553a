use chrono::Utc;

/// Source of wall-clock time for expiry checks.
///
/// A session manager holds exactly one clock so that every expiry comparison
/// sees the same notion of "now".
pub trait Clock: Send + Sync {
    /// Current time in epoch seconds
    fn now(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        Utc::now().timestamp()
    }
}
