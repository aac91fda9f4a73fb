//! A source of wall-clock time, in milliseconds since the UNIX epoch.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use ClockSource::{FixedOffset, Mock, System};

/// A source of time.
#[derive(Debug, Clone)]
pub enum ClockSource {
    /// Clock source based on the system clock.
    System,

    /// Maintains a fixed number of seconds offset (positive or negative)
    /// from the system clock. Only for testing.
    FixedOffset(i32),

    /// Only for testing.
    Mock(Arc<AtomicU64>),
}

impl ClockSource {
    pub fn new_mock(now_millis: u64) -> ClockSource {
        Mock(Arc::new(AtomicU64::new(now_millis)))
    }

    /// Milliseconds since the UNIX epoch.
    pub fn epoch_millis(&self) -> u64 {
        match self {
            System => match SystemTime::now().duration_since(UNIX_EPOCH) {
                Ok(n) => n.as_millis() as u64,
                Err(e) => panic!("SystemTime before UNIX EPOCH! {e:?}"),
            },
            FixedOffset(offset) => {
                System
                    .epoch_millis()
                    .saturating_add_signed(*offset as i64 * 1000)
            }
            Mock(now) => now.load(SeqCst),
        }
    }

    /// Seconds since the UNIX epoch.
    pub fn epoch_seconds(&self) -> u64 {
        self.epoch_millis() / 1000
    }

    /// Sets the current time of this Mock clock, in milliseconds.
    /// For test use only.
    pub fn set_millis(&self, now_millis: u64) {
        match self {
            System => unreachable!(),
            FixedOffset(_) => unreachable!(),
            Mock(n) => n.store(now_millis, SeqCst),
        }
    }

    /// Advances this Mock clock. For test use only.
    pub fn advance_millis(&self, delta_millis: u64) {
        match self {
            System => unreachable!(),
            FixedOffset(_) => unreachable!(),
            Mock(n) => {
                n.fetch_add(delta_millis, SeqCst);
            }
        }
    }
}
