use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Absolute, monotonic microseconds. Leases (§3, §4.3) are timestamped with
/// this rather than wall-clock time so that `due` comparisons are immune to
/// clock adjustments within a single process; the "loosely synchronized
/// wall clocks across machines" assumption in §4.3 is about *cross-process*
/// agreement on lease deadlines, which this type does not attempt to
/// solve — it only guarantees a single process's clock never runs
/// backwards.
pub type MicroInstant = u64;

/// A source of monotonic time. Production code uses [`SystemClock`]; lease
/// and compaction tests use [`FakeClock`] so that scenarios like "writer
/// commits exactly at `frozen_due`" are deterministic instead of racing a
/// sleep against the wall clock.
pub trait Clock: Send + Sync {
    fn now_us(&self) -> MicroInstant;
}

#[derive(Clone)]
pub struct SystemClock {
    epoch: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        SystemClock {
            epoch: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn now_us(&self) -> MicroInstant {
        self.epoch.elapsed().as_micros() as MicroInstant
    }
}

/// A clock a test can advance by hand, for exercising the LLT coherence
/// protocol's deadline logic without sleeping.
#[derive(Default)]
pub struct FakeClock {
    now: AtomicU64,
}

impl FakeClock {
    pub fn new(start_us: MicroInstant) -> Self {
        FakeClock {
            now: AtomicU64::new(start_us),
        }
    }

    pub fn advance(&self, delta_us: u64) {
        self.now.fetch_add(delta_us, Ordering::SeqCst);
    }

    pub fn set(&self, us: MicroInstant) {
        self.now.store(us, Ordering::SeqCst);
    }
}

impl Clock for FakeClock {
    fn now_us(&self) -> MicroInstant {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_clock_advances() {
        let c = FakeClock::new(100);
        assert_eq!(c.now_us(), 100);
        c.advance(50);
        assert_eq!(c.now_us(), 150);
    }

    #[test]
    fn system_clock_never_goes_backwards() {
        let c = SystemClock::default();
        let a = c.now_us();
        let b = c.now_us();
        assert!(b >= a);
    }
}
