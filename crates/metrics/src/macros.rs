pub use paste::paste;
pub use prometheus;

/// Register a labeled histogram with the disttable metrics registry and
/// store in a static variable.
/// The reported metric name will be the lower_snake_case version of the
/// declared variable name, prefixed with `disttable_`.
#[macro_export]
macro_rules! register_disttable_histogram {
    ($VIS:vis $NAME:ident, $HELP:literal, $LABELS:expr $(,)?) => {
        $VIS static $NAME: std::sync::LazyLock<$crate::prometheus::HistogramVec> =
            std::sync::LazyLock::new(|| {
                $crate::paste! {
                    let name = $crate::metric_name!(stringify!([<$NAME:lower>]));
                }
                let help = $crate::metric_help!($HELP);
                $crate::prometheus::register_histogram_vec_with_registry!(
                    &*name,
                    &*help,
                    $LABELS,
                    $crate::DISTTABLE_METRICS_REGISTRY
                )
                .expect("Metric initialization failed")
            });
    };
}

/// Register a labeled integer counter with the disttable metrics registry and
/// store in a static variable.
#[macro_export]
macro_rules! register_disttable_counter {
    ($VIS:vis $NAME:ident, $HELP:literal, $LABELS:expr $(,)?) => {
        $VIS static $NAME: std::sync::LazyLock<$crate::prometheus::IntCounterVec> =
            std::sync::LazyLock::new(|| {
                $crate::paste! {
                    let name = $crate::metric_name!(stringify!([<$NAME:lower>]));
                }
                let help = $crate::metric_help!($HELP);
                $crate::prometheus::register_int_counter_vec_with_registry!(
                    &*name,
                    &*help,
                    $LABELS,
                    $crate::DISTTABLE_METRICS_REGISTRY
                )
                .expect("Metric initialization failed")
            });
    };
}

/// Register a floating-point gauge with the disttable metrics registry and
/// store in a static variable.
#[macro_export]
macro_rules! register_disttable_gauge {
    ($VIS:vis $NAME:ident, $HELP:literal $(,)?) => {
        $VIS static $NAME: std::sync::LazyLock<$crate::prometheus::Gauge> =
            std::sync::LazyLock::new(|| {
                $crate::paste! {
                    let name = $crate::metric_name!(stringify!([<$NAME:lower>]));
                }
                let help = $crate::metric_help!($HELP);
                $crate::prometheus::register_gauge_with_registry!(
                    &*name,
                    &*help,
                    $crate::DISTTABLE_METRICS_REGISTRY
                )
                .expect("Metric initialization failed")
            });
    };
}
