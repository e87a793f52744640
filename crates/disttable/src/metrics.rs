use metrics::{
    log_counter_with_labels,
    register_disttable_counter,
    register_disttable_histogram,
    StaticMetricLabel,
    StatusTimer,
};

use crate::state::MigrationStep;

register_disttable_histogram!(
    STEP_SECONDS,
    "Time to execute one step of a distribution protocol",
    &["step", "status"]
);
pub fn step_timer(step: MigrationStep) -> StatusTimer {
    let mut timer = StatusTimer::new(&STEP_SECONDS);
    timer.add_label(StaticMetricLabel::new("step", <&'static str>::from(step)));
    timer
}

register_disttable_counter!(
    MIGRATIONS_TOTAL,
    "Number of distribute, drop and rollback operations run",
    &["operation", "status"]
);
pub fn log_operation(operation: &'static str, is_ok: bool) {
    log_counter_with_labels(
        &MIGRATIONS_TOTAL,
        1,
        vec![
            StaticMetricLabel::new("operation", operation),
            StaticMetricLabel::status(is_ok),
        ],
    );
}
