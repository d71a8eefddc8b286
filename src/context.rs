//! Explicit per-call context: who is acting and what time it is.

use chrono::{DateTime, Duration, Utc};
use std::fmt;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for tests and replays.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *guard += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub user_id: Option<Uuid>,
    pub request_id: String,
    pub clock: Arc<dyn Clock>,
}

impl RequestContext {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            user_id: None,
            request_id: Uuid::new_v4().to_string(),
            clock,
        }
    }

    /// Context for background work driven by the wall clock.
    pub fn system() -> Self {
        Self::new(Arc::new(SystemClock))
    }

    pub fn with_user(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Actor label written into audit entries.
    pub fn actor(&self) -> String {
        self.user_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "system".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn fixed_clock_advances() {
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let clock = FixedClock::new(start);
        clock.advance(Duration::seconds(90));
        assert_eq!(clock.now(), start + Duration::seconds(90));
    }

    #[test]
    fn actor_defaults_to_system() {
        let ctx = RequestContext::system();
        assert_eq!(ctx.actor(), "system");
        let user = Uuid::new_v4();
        assert_eq!(ctx.with_user(user).actor(), user.to_string());
    }
}
