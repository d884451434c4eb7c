//! Sample aggregation for sub-metrics given as raw measurements
//!
//! Sub-type names double as aggregation names: a latency metric with
//! sub-types `avg` and `p90` reduces the scorer's raw samples twice.

use crate::{Error, Result};
use statrs::statistics::{Data, OrderStatistics, Statistics};

/// Supported aggregation names.
pub const AGGREGATIONS: &[&str] = &[
    "avg", "mean", "min", "max", "sum", "count", "std", "p50", "p75", "p90", "p95", "p99", "p999",
];

/// Whether `name` is a known aggregation.
#[must_use]
pub fn is_aggregation(name: &str) -> bool {
    AGGREGATIONS.contains(&name)
}

/// Reduce `samples` by the named aggregation.
///
/// # Errors
/// Returns `Evaluation` error for unknown names or empty samples.
#[allow(clippy::cast_precision_loss)]
pub fn aggregate(name: &str, samples: &[f64]) -> Result<f64> {
    if samples.is_empty() {
        return Err(Error::Evaluation(format!(
            "cannot aggregate '{name}' over zero samples"
        )));
    }
    let value = match name {
        "avg" | "mean" => samples.mean(),
        "min" => Statistics::min(samples),
        "max" => Statistics::max(samples),
        "sum" => samples.iter().sum(),
        "count" => samples.len() as f64,
        "std" => {
            if samples.len() < 2 {
                0.0
            } else {
                samples.std_dev()
            }
        }
        percentile => {
            let tau = match percentile {
                "p50" => 0.50,
                "p75" => 0.75,
                "p90" => 0.90,
                "p95" => 0.95,
                "p99" => 0.99,
                "p999" => 0.999,
                other => {
                    return Err(Error::Evaluation(format!(
                        "unknown aggregation '{other}' (supported: {})",
                        AGGREGATIONS.join(", ")
                    )))
                }
            };
            let mut data = Data::new(samples.to_vec());
            data.quantile(tau)
        }
    };
    Ok(value)
}
