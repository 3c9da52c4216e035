use std::time::{Duration, Instant};

/// One fixed-width ring of load samples feeding an optional wider ring.
struct AverageRing {
    samples: Vec<i64>,
    pos: usize,
    filled: bool,
}

impl AverageRing {
    fn new(len: usize) -> Self {
        AverageRing {
            samples: vec![0; len],
            pos: 0,
            filled: false,
        }
    }

    /// Adds a sample. Returns the ring average when the ring wrapped,
    /// which is the moment the next-wider ring takes a sample.
    fn add(&mut self, value: i64) -> Option<i64> {
        self.samples[self.pos] = value;
        self.pos += 1;
        if self.pos == self.samples.len() {
            self.pos = 0;
            self.filled = true;
            Some(self.average())
        } else {
            None
        }
    }

    fn average(&self) -> i64 {
        let n = if self.filled {
            self.samples.len()
        } else {
            self.pos
        };
        if n == 0 {
            return 0;
        }
        self.samples[..n].iter().sum::<i64>() / n as i64
    }
}

/// Busy-vs-idle ratio of one worker, kept as 1-second, 1-minute and 1-hour
/// moving averages. The 1-second window also drives the poll timeout: a
/// worker sleeps at most until the end of its current measurement window.
pub struct WorkerLoad {
    start_time: Instant,
    wait_start: Instant,
    wait_time: Duration,
    load_1_second: i64,
    minute: AverageRing,
    hour: AverageRing,
}

pub const GRANULARITY: Duration = Duration::from_secs(1);

impl WorkerLoad {
    pub fn new(now: Instant) -> Self {
        WorkerLoad {
            start_time: now,
            wait_start: now,
            wait_time: Duration::ZERO,
            load_1_second: 0,
            minute: AverageRing::new(60),
            hour: AverageRing::new(60),
        }
    }

    pub fn reset(&mut self, now: Instant) {
        self.start_time = now;
        self.wait_start = now;
        self.wait_time = Duration::ZERO;
    }

    /// Called right before blocking in poll. Returns how long the worker
    /// may sleep before the current window needs closing.
    pub fn about_to_wait(&mut self, now: Instant) -> Duration {
        self.wait_start = now;
        let dur = now.duration_since(self.start_time);
        if dur >= GRANULARITY {
            Duration::ZERO
        } else {
            GRANULARITY - dur
        }
    }

    /// Called when poll returns.
    pub fn about_to_work(&mut self, now: Instant) {
        let dur = now.duration_since(self.start_time);
        self.wait_time += now.duration_since(self.wait_start);
        self.wait_start = now;

        if dur >= GRANULARITY {
            let busy = dur.saturating_sub(self.wait_time);
            let load =
                (0.5 + 100.0 * busy.as_secs_f64() / dur.as_secs_f64()) as i64;
            self.start_time = now;
            self.wait_time = Duration::ZERO;
            self.load_1_second = load.min(100);
            if let Some(minute_avg) = self.minute.add(self.load_1_second) {
                self.hour.add(minute_avg);
            }
        }
    }

    pub fn percentage_1s(&self) -> i64 {
        self.load_1_second
    }

    pub fn percentage_1m(&self) -> i64 {
        self.minute.average()
    }

    pub fn percentage_1h(&self) -> i64 {
        self.hour.average()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_window_reports_zero_load() {
        let t0 = Instant::now();
        let mut load = WorkerLoad::new(t0);
        load.about_to_wait(t0);
        load.about_to_work(t0 + Duration::from_millis(1100));
        assert_eq!(load.percentage_1s(), 0);
    }

    #[test]
    fn busy_window_reports_high_load() {
        let t0 = Instant::now();
        let mut load = WorkerLoad::new(t0);
        // waited only 50ms of an 1100ms window
        load.about_to_wait(t0);
        load.about_to_work(t0 + Duration::from_millis(50));
        load.about_to_wait(t0 + Duration::from_millis(50));
        load.about_to_work(t0 + Duration::from_millis(1100));
        assert!(load.percentage_1s() <= 10, "got {}", load.percentage_1s());

        let mut load = WorkerLoad::new(t0);
        load.about_to_wait(t0 + Duration::from_millis(1050));
        load.about_to_work(t0 + Duration::from_millis(1100));
        assert!(load.percentage_1s() >= 90, "got {}", load.percentage_1s());
    }

    #[test]
    fn wait_budget_shrinks_within_window() {
        let t0 = Instant::now();
        let mut load = WorkerLoad::new(t0);
        let full = load.about_to_wait(t0);
        assert_eq!(full, GRANULARITY);
        let partial = load.about_to_wait(t0 + Duration::from_millis(400));
        assert_eq!(partial, Duration::from_millis(600));
    }

    #[test]
    fn ring_average_wraps() {
        let mut ring = AverageRing::new(4);
        assert_eq!(ring.add(10), None);
        assert_eq!(ring.add(20), None);
        assert_eq!(ring.add(30), None);
        assert_eq!(ring.add(40), Some(25));
        assert_eq!(ring.average(), 25);
    }
}
