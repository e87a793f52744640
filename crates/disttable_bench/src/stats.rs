use std::{
    fmt,
    time::Duration,
};

/// Latencies of the insert batches of one iteration.
#[derive(Debug, Default, Clone)]
pub struct BatchStats {
    count: u32,
    total: Duration,
    min: Option<Duration>,
    max: Duration,
}

impl BatchStats {
    pub fn record(&mut self, elapsed: Duration) {
        self.count += 1;
        self.total += elapsed;
        self.min = Some(self.min.map_or(elapsed, |min| min.min(elapsed)));
        self.max = self.max.max(elapsed);
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn total(&self) -> Duration {
        self.total
    }

    pub fn min(&self) -> Duration {
        self.min.unwrap_or_default()
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    pub fn average(&self) -> Duration {
        if self.count == 0 {
            return Duration::ZERO;
        }
        self.total / self.count
    }
}

impl fmt::Display for BatchStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "count: {}", self.count)?;
        writeln!(f, "duration: {:?}", self.total)?;
        writeln!(
            f,
            "min: {:?}, avg: {:?}, max: {:?}",
            self.min(),
            self.average(),
            self.max
        )
    }
}
