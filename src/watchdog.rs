// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.

//! Per-object watchdog (spec.md §4.4 "Watchdog"): a worker thread is
//! expected to `kick()` before `interval` elapses; missing `max_retries` in
//! a row is reported as a bark so the host process can decide what to do
//! about a stuck callback.

use std::time::{Duration, Instant};

pub struct Watchdog {
    interval: Duration,
    max_retries: u32,
    misses: u32,
    last_kick: Instant,
}

impl Watchdog {
    pub fn new(interval: Duration, max_retries: u32) -> Watchdog {
        Watchdog { interval, max_retries, misses: 0, last_kick: Instant::now() }
    }

    pub fn kick(&mut self) {
        self.misses = 0;
        self.last_kick = Instant::now();
    }

    /// Call on every watchdog timer tick. Returns `true` exactly once, the
    /// tick on which `max_retries` consecutive misses is reached (a bark);
    /// the caller decides what that means (log, abort, restart).
    pub fn on_timer_tick(&mut self) -> bool {
        if self.last_kick.elapsed() < self.interval {
            return false;
        }
        self.misses += 1;
        self.last_kick = Instant::now();
        self.misses >= self.max_retries
    }

    pub fn misses(&self) -> u32 {
        self.misses
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kick_resets_the_miss_counter() {
        let mut wd = Watchdog::new(Duration::from_millis(0), 3);
        assert!(!wd.on_timer_tick());
        assert!(!wd.on_timer_tick());
        wd.kick();
        assert_eq!(wd.misses(), 0);
    }

    #[test]
    fn barks_after_max_retries_consecutive_misses() {
        let mut wd = Watchdog::new(Duration::from_millis(0), 3);
        assert!(!wd.on_timer_tick());
        assert!(!wd.on_timer_tick());
        assert!(wd.on_timer_tick());
    }
}
