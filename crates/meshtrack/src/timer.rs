//! Performance measurement tools.

use std::{
    fmt, mem,
    sync::Mutex,
    time::{Duration, Instant},
};

/// A timer that measures and averages the time an operation takes.
///
/// Collected timings are averaged and reset when the timer is displayed using `{}`
/// ([`std::fmt::Display`]).
pub struct Timer {
    name: &'static str,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    total: Duration,
    count: u32,
}

impl Timer {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(State::default()),
        }
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Invokes a closure, measuring and recording the time it takes.
    pub fn time<T>(&self, timee: impl FnOnce() -> T) -> T {
        let _guard = self.start();
        timee()
    }

    /// Starts timing an operation using a drop guard.
    ///
    /// The time between the call to `start` and the drop of the returned [`TimerGuard`] is
    /// recorded.
    pub fn start(&self) -> TimerGuard<'_> {
        TimerGuard {
            start: Instant::now(),
            timer: self,
        }
    }

    /// Returns how many measurements were recorded since the timer was last displayed.
    pub fn count(&self) -> u32 {
        self.lock().count
    }

    fn stop(&self, start: Instant) {
        let mut state = self.lock();
        state.total += start.elapsed();
        state.count += 1;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Displays the average recorded time and resets it.
impl fmt::Display for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = mem::take(&mut *self.lock());
        let avg_ms = if state.count == 0 {
            0.0
        } else {
            state.total.as_secs_f32() * 1000.0 / state.count as f32
        };

        write!(f, "{}: {}x{avg_ms:.01}ms", self.name, state.count)
    }
}

/// Cloning a timer resets its collected timings.
impl Clone for Timer {
    fn clone(&self) -> Self {
        Self::new(self.name)
    }
}

/// Guard returned by [`Timer::start`]. Stops timing the operation when dropped.
pub struct TimerGuard<'a> {
    start: Instant,
    timer: &'a Timer,
}

impl Drop for TimerGuard<'_> {
    fn drop(&mut self) {
        self.timer.stop(self.start);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_resets() {
        let timer = Timer::new("infer");
        timer.time(|| ());
        timer.time(|| ());
        assert_eq!(timer.count(), 2);

        let s = timer.to_string();
        assert!(s.starts_with("infer: 2x"), "{s}");
        assert_eq!(timer.count(), 0);
        assert_eq!(timer.to_string(), "infer: 0x0.0ms");
    }
}
