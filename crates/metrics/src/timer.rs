use std::time::{
    Duration,
    Instant,
};

use prometheus::HistogramVec;

use crate::{
    get_desc,
    log_distribution_with_labels,
    Labels,
    StaticMetricLabel,
};

/// Status timer that defaults to error unless `.finish()` is explicitly called
/// upon success.
pub struct StatusTimer {
    start: Instant,
    histogram: &'static HistogramVec,
    labels: Labels,
    status: StaticMetricLabel,
}

impl StatusTimer {
    pub fn new(histogram: &'static HistogramVec) -> Self {
        Self {
            start: Instant::now(),
            histogram,
            labels: Vec::new(),
            status: StaticMetricLabel::STATUS_ERROR,
        }
    }

    pub fn add_label(&mut self, label: StaticMetricLabel) {
        self.labels.push(label);
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Finish the timer with status success
    pub fn finish(mut self) -> Duration {
        self.status = StaticMetricLabel::STATUS_SUCCESS;
        self.start.elapsed()
    }

    /// Finish the timer with the given status, e.g. `"not_found"`.
    pub fn finish_with(mut self, status: &'static str) -> Duration {
        self.status = StaticMetricLabel::new_const("status", status);
        self.start.elapsed()
    }
}

impl Drop for StatusTimer {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        let elapsed = self.start.elapsed();
        let mut labels = std::mem::take(&mut self.labels);
        labels.push(self.status.clone());
        tracing::debug!(
            "{elapsed:?} for timer {:?} {:?}",
            get_desc(self.histogram),
            labels
        );
        log_distribution_with_labels(self.histogram, elapsed.as_secs_f64(), labels);
    }
}
