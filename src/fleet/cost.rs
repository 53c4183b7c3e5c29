//! Rough spot cost of a finished job.
//!
//! Prices are not time-weighted: the highest price seen while the fleet was
//! up is charged for the whole window, which overcounts when the price moved.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{info, warn};

use crate::cloud::{ComputeProvider, SpotPrice};
use crate::error::ComputeError;

#[derive(Debug, Clone, PartialEq)]
pub struct CostEstimate {
    /// Highest hourly price in the window.
    pub price_per_hour: Decimal,
    pub hours: Decimal,
    pub instance_count: usize,
    pub total: Decimal,
    pub distinct_prices: usize,
}

/// Estimate from raw samples. `None` when there are no samples.
pub fn estimate(
    samples: &[SpotPrice],
    elapsed: Duration,
    instance_count: usize,
) -> Option<CostEstimate> {
    let distinct: BTreeSet<Decimal> = samples.iter().map(|s| s.price.normalize()).collect();
    let price_per_hour = *distinct.last()?;

    if distinct.len() > 1 {
        warn!(
            distinct = distinct.len(),
            max = %price_per_hour,
            "Spot price changed during the job, charging the maximum"
        );
    }

    let hours = Decimal::from(elapsed.num_milliseconds().max(0)) / dec!(3_600_000);
    let total = (price_per_hour * hours * Decimal::from(instance_count)).round_dp(4);

    Some(CostEstimate {
        price_per_hour,
        hours,
        instance_count,
        total,
        distinct_prices: distinct.len(),
    })
}

/// Fetch the price history for `[started, finished]` and estimate from it.
pub async fn estimate_fleet_cost(
    compute: &dyn ComputeProvider,
    instance_type: &str,
    availability_zone: Option<&str>,
    started: DateTime<Utc>,
    finished: DateTime<Utc>,
    instance_count: usize,
) -> Result<Option<CostEstimate>, ComputeError> {
    let samples = compute
        .spot_price_history(instance_type, availability_zone, started, finished)
        .await?;
    let estimate = estimate(&samples, finished - started, instance_count);
    match &estimate {
        Some(e) => info!(
            instance_type,
            price_per_hour = %e.price_per_hour,
            instances = instance_count,
            total = %e.total,
            "Estimated spot cost"
        ),
        None => warn!(instance_type, "No spot price samples for the job window"),
    }
    Ok(estimate)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(price: Decimal) -> SpotPrice {
        SpotPrice {
            timestamp: Utc::now(),
            price,
            availability_zone: "z".into(),
        }
    }

    #[test]
    fn charges_the_maximum_price() {
        let samples = [sample(dec!(0.2)), sample(dec!(0.35)), sample(dec!(0.2))];
        let e = estimate(&samples, Duration::minutes(90), 2).unwrap();
        assert_eq!(e.price_per_hour, dec!(0.35));
        assert_eq!(e.distinct_prices, 2);
        assert_eq!(e.total, dec!(1.05));
    }

    #[test]
    fn equal_prices_with_different_scale_count_once() {
        let samples = [sample(dec!(0.50)), sample(dec!(0.5))];
        let e = estimate(&samples, Duration::hours(1), 1).unwrap();
        assert_eq!(e.distinct_prices, 1);
        assert_eq!(e.total, dec!(0.5));
    }

    #[test]
    fn no_samples_no_estimate() {
        assert_eq!(estimate(&[], Duration::hours(1), 3), None);
    }
}
