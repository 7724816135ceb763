// src/ingestion/split.rs
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// Deterministic train / held-out split. Membership is decided by a seeded
/// shuffle; both halves keep the input order.
pub fn split_holdout<T>(records: Vec<T>, holdout_fraction: f64, seed: u64) -> (Vec<T>, Vec<T>) {
    let n = records.len();
    let fraction = holdout_fraction.clamp(0.0, 1.0);
    let mut holdout_count = (n as f64 * fraction).round() as usize;
    if fraction > 0.0 && n >= 2 {
        holdout_count = holdout_count.clamp(1, n - 1);
    }

    let mut order: Vec<usize> = (0..n).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    order.shuffle(&mut rng);

    let mut in_holdout = vec![false; n];
    for &i in order.iter().take(holdout_count) {
        in_holdout[i] = true;
    }

    let mut train = Vec::with_capacity(n - holdout_count);
    let mut holdout = Vec::with_capacity(holdout_count);
    for (record, held_out) in records.into_iter().zip(in_holdout) {
        if held_out {
            holdout.push(record);
        } else {
            train.push(record);
        }
    }
    (train, holdout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::property::PropertyRecord;

    fn records(n: i64) -> Vec<PropertyRecord> {
        (0..n)
            .map(|id| PropertyRecord {
                id,
                lat: 47.5,
                long: -122.2,
                sqft_living: 1000.0 + id as f64,
                sqft_lot: 5000.0,
                bedrooms: 3.0,
                bathrooms: 2.0,
                grade: 7.0,
                yr_built: 1990.0,
                floors: None,
                waterfront: None,
                view: None,
                condition: None,
                yr_renovated: None,
                price: Some(300000.0),
            })
            .collect()
    }

    #[test]
    fn test_split_is_deterministic_and_ordered() {
        let (train_a, holdout_a) = split_holdout(records(50), 0.2, 42);
        let (train_b, holdout_b) = split_holdout(records(50), 0.2, 42);
        assert_eq!(holdout_a.len(), 10);
        assert_eq!(train_a.len(), 40);
        assert_eq!(holdout_a, holdout_b);
        assert_eq!(train_a, train_b);
        assert!(holdout_a.windows(2).all(|w| w[0].id < w[1].id));
        assert!(train_a.iter().all(|r| !holdout_a.iter().any(|h| h.id == r.id)));
    }

    #[test]
    fn test_small_datasets_keep_both_sides_non_empty() {
        let (train, holdout) = split_holdout(records(3), 0.01, 1);
        assert_eq!(holdout.len(), 1);
        assert_eq!(train.len(), 2);
    }
}
