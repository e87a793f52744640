//! Code for interacting with our metrics logging

mod labels;
mod macros;
mod metrics;
mod reporting;
mod timer;

#[cfg(test)]
mod tests;

pub use crate::{
    labels::*,
    macros::*,
    metrics::*,
    reporting::{
        gather_text,
        get_desc,
        log_counter_with_labels,
        log_distribution_with_labels,
        log_gauge,
    },
    timer::StatusTimer,
};
