//! Lap timer for task timing

use std::time::Duration;

use tokio::time::Instant;

/// Records labeled laps from a start instant
#[derive(Debug, Clone)]
pub struct Stopwatch {
    started: Instant,
    stopped: Option<Instant>,
    laps: Vec<Lap>,
}

/// A labeled point in time relative to the stopwatch start
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lap {
    pub label: String,
    pub elapsed: Duration,
}

impl Stopwatch {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
            stopped: None,
            laps: Vec::new(),
        }
    }

    pub fn lap(&mut self, label: impl Into<String>) {
        if self.stopped.is_some() {
            return;
        }
        self.laps.push(Lap {
            label: label.into(),
            elapsed: self.started.elapsed(),
        });
    }

    pub fn stop(&mut self) {
        if self.stopped.is_none() {
            self.stopped = Some(Instant::now());
        }
    }

    /// Time from start until stop, or until now if still running
    pub fn elapsed(&self) -> Duration {
        match self.stopped {
            Some(stopped) => stopped - self.started,
            None => self.started.elapsed(),
        }
    }

    pub fn laps(&self) -> &[Lap] {
        &self.laps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_laps_in_order() {
        let mut sw = Stopwatch::start();
        tokio::time::advance(Duration::from_millis(10)).await;
        sw.lap("queued");
        tokio::time::advance(Duration::from_millis(20)).await;
        sw.lap("started");

        let laps = sw.laps();
        assert_eq!(laps.len(), 2);
        assert_eq!(laps[0].label, "queued");
        assert!(laps[1].elapsed >= laps[0].elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_freezes_elapsed() {
        let mut sw = Stopwatch::start();
        tokio::time::advance(Duration::from_millis(30)).await;
        sw.stop();
        let frozen = sw.elapsed();
        tokio::time::advance(Duration::from_millis(30)).await;
        assert_eq!(sw.elapsed(), frozen);

        sw.lap("ignored");
        assert!(sw.laps().is_empty());
    }
}
