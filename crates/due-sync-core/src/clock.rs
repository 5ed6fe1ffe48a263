use parking_lot::Mutex;
use time::{Duration, OffsetDateTime};

/// Source of wall-clock time and blocking waits.
pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;

    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }

    fn sleep(&self, duration: Duration) {
        if duration.is_positive() {
            std::thread::sleep(duration.unsigned_abs());
        }
    }
}

/// Clock that only moves when told to. `sleep` advances it instantly.
#[derive(Debug)]
pub struct ManualClock {
    state: Mutex<ManualClockState>,
}

#[derive(Debug)]
struct ManualClockState {
    now: OffsetDateTime,
    slept: Duration,
}

impl ManualClock {
    #[must_use]
    pub fn new(start: OffsetDateTime) -> Self {
        Self { state: Mutex::new(ManualClockState { now: start, slept: Duration::ZERO }) }
    }

    pub fn advance(&self, by: Duration) {
        self.state.lock().now += by;
    }

    pub fn set(&self, now: OffsetDateTime) {
        self.state.lock().now = now;
    }

    /// Total time spent in `sleep`.
    #[must_use]
    pub fn slept(&self) -> Duration {
        self.state.lock().slept
    }
}

impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        self.state.lock().now
    }

    fn sleep(&self, duration: Duration) {
        if duration.is_positive() {
            let mut state = self.state.lock();
            state.now += duration;
            state.slept += duration;
        }
    }
}
