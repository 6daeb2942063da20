use chrono::{DateTime, Utc};

/// Abstracts "now" so state-machine and lease-expiry logic can be driven
/// by a fake clock in tests instead of racing real wall-clock time.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

/// The real, system-clock-backed implementation used outside tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(any(test, feature = "test-util"))]
pub mod test_util {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};

    /// A clock whose value is set explicitly; advances only when told to.
    pub struct FakeClock {
        micros_since_epoch: AtomicI64,
    }

    impl FakeClock {
        pub fn new(start: DateTime<Utc>) -> Self {
            Self {
                micros_since_epoch: AtomicI64::new(start.timestamp_micros()),
            }
        }

        pub fn advance(&self, delta: chrono::Duration) {
            self.micros_since_epoch
                .fetch_add(delta.num_microseconds().unwrap_or(0), Ordering::SeqCst);
        }
    }

    impl Clock for FakeClock {
        fn now(&self) -> DateTime<Utc> {
            DateTime::from_timestamp_micros(self.micros_since_epoch.load(Ordering::SeqCst))
                .expect("fake clock value is always a valid instant")
        }
    }
}
