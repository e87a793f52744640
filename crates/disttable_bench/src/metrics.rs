use std::time::Duration;

use metrics::{
    log_distribution_with_labels,
    log_gauge,
    register_disttable_gauge,
    register_disttable_histogram,
    StaticMetricLabel,
};

use crate::config::BenchConfig;

fn mode_label(dist: bool) -> StaticMetricLabel {
    StaticMetricLabel::new("mode", if dist { "dist" } else { "plain" })
}

register_disttable_histogram!(
    INSERT_BATCH_SECONDS,
    "Time to insert one batch of documents",
    &["mode"]
);
pub fn log_insert_batch(dist: bool, elapsed: Duration) {
    log_distribution_with_labels(
        &INSERT_BATCH_SECONDS,
        elapsed.as_secs_f64(),
        vec![mode_label(dist)],
    );
}

register_disttable_gauge!(BENCH_ITERATIONS, "Number of iterations per run");
register_disttable_gauge!(BENCH_BATCH_DOCUMENTS, "Number of documents per insert batch");
pub fn log_run_config(config: &BenchConfig) {
    log_gauge(&BENCH_ITERATIONS, config.iterations as f64);
    log_gauge(&BENCH_BATCH_DOCUMENTS, config.batch_size as f64);
}

register_disttable_gauge!(
    BENCH_FINISHED_AT_SECONDS,
    "Unix time the run finished at"
);
pub fn log_finished_at(unix_seconds: i64) {
    log_gauge(&BENCH_FINISHED_AT_SECONDS, unix_seconds as f64);
}
