use std::time::{SystemTime, UNIX_EPOCH};

use log::debug;

/// Millisecond stopwatch for latency bookkeeping in the control loop.
pub struct TickTimer {
    pub milis: f64,
}

impl TickTimer {
    pub fn new() -> Self {
        Self { milis: now_ms() }
    }

    /// Milliseconds since the previous tick (or construction).
    pub fn tick(&mut self) -> f64 {
        let milis = now_ms();
        let diff = milis - self.milis;
        self.milis = milis;
        diff
    }

    pub fn tick_log(&mut self, msg: &str) -> f64 {
        let diff = self.tick();
        debug!("{}: {:.3} ms", msg, diff);
        diff
    }
}

impl Default for TickTimer {
    fn default() -> Self {
        Self::new()
    }
}

fn now_ms() -> f64 {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Time went backwards");
    duration.as_secs() as f64 * 1e3 + duration.subsec_nanos() as f64 / 1e6
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ticks_are_nonnegative_and_reset() {
        let mut timer = TickTimer::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let first = timer.tick();
        assert!(first >= 0.0);
        // Second tick measures from the first, not from construction.
        let second = timer.tick();
        assert!(second >= 0.0 && second <= first + 1_000.0);
    }
}
