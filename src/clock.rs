use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Injectable wall clock. Production uses `SystemClock`; tests pin time with
/// `ManualClock` so timeout and hold-time behaviour is deterministic.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub type SharedClock = Arc<dyn Clock>;

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use parking_lot::Mutex;

    /// Clock that only moves when told to.
    pub struct ManualClock {
        now: Mutex<DateTime<Utc>>,
    }

    impl ManualClock {
        pub fn at(now: DateTime<Utc>) -> Arc<Self> {
            Arc::new(Self { now: Mutex::new(now) })
        }

        pub fn advance(&self, delta: chrono::Duration) {
            let mut now = self.now.lock();
            *now += delta;
        }

        pub fn set(&self, to: DateTime<Utc>) {
            *self.now.lock() = to;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.now.lock()
        }
    }
}
