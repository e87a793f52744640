use crate::{
    gather_text,
    log_counter_with_labels,
    register_disttable_counter,
    register_disttable_histogram,
    StaticMetricLabel,
    StatusTimer,
    STATUS_LABEL,
};

register_disttable_histogram!(TEST_TIMER_SECONDS, "Timer used by tests", &["op", "status"]);
register_disttable_counter!(TEST_EVENTS_TOTAL, "Counter used by tests", &STATUS_LABEL);

#[test]
fn test_status_timer_defaults_to_error() -> anyhow::Result<()> {
    {
        let mut timer = StatusTimer::new(&TEST_TIMER_SECONDS);
        timer.add_label(StaticMetricLabel::new("op", "dropped"));
    }
    {
        let mut timer = StatusTimer::new(&TEST_TIMER_SECONDS);
        timer.add_label(StaticMetricLabel::new("op", "finished"));
        timer.finish();
    }
    let dropped = TEST_TIMER_SECONDS.get_metric_with_label_values(&["dropped", "error"])?;
    assert_eq!(dropped.get_sample_count(), 1);
    let finished = TEST_TIMER_SECONDS.get_metric_with_label_values(&["finished", "success"])?;
    assert_eq!(finished.get_sample_count(), 1);
    Ok(())
}

#[test]
fn test_gather_text_includes_prefix() -> anyhow::Result<()> {
    log_counter_with_labels(&TEST_EVENTS_TOTAL, 3, vec![StaticMetricLabel::status(true)]);
    let text = String::from_utf8(gather_text()?)?;
    assert!(text.contains("disttable_test_events_total"), "{text}");
    Ok(())
}

#[test]
fn test_metric_name_validation() {
    let name = crate::metric_name!("insert_batch_seconds");
    assert_eq!(&*name, "insert_batch_seconds");
}
