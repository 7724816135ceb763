// src/evaluation/metrics.rs
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// Error metrics in price space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegressionMetrics {
    pub rmse: f64,
    pub mae: f64,
    pub r2: f64,
    pub n: usize,
}

pub fn compute_metrics(actual: &[f64], predicted: &[f64]) -> Result<RegressionMetrics> {
    if actual.len() != predicted.len() {
        return Err(anyhow!(
            "{} actual values but {} predictions",
            actual.len(),
            predicted.len()
        ));
    }
    if actual.is_empty() {
        return Err(anyhow!("Cannot compute metrics on an empty evaluation split"));
    }
    let n = actual.len() as f64;
    let mean = actual.iter().sum::<f64>() / n;
    let (sse, sae, sst) = actual.iter().zip(predicted).fold(
        (0.0, 0.0, 0.0),
        |(sse, sae, sst), (a, p)| {
            let err = a - p;
            (sse + err * err, sae + err.abs(), sst + (a - mean).powi(2))
        },
    );
    // Constant targets: perfect fit scores 1, anything else 0.
    let r2 = if sst > 0.0 {
        1.0 - sse / sst
    } else if sse == 0.0 {
        1.0
    } else {
        0.0
    };
    Ok(RegressionMetrics {
        rmse: (sse / n).sqrt(),
        mae: sae / n,
        r2,
        n: actual.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_on_known_values() {
        let m = compute_metrics(&[1.0, 2.0, 3.0, 4.0], &[1.0, 2.0, 3.0, 6.0]).unwrap();
        assert!((m.rmse - 1.0).abs() < 1e-12);
        assert!((m.mae - 0.5).abs() < 1e-12);
        assert!((m.r2 - (1.0 - 4.0 / 5.0)).abs() < 1e-12);
        assert_eq!(m.n, 4);
    }

    #[test]
    fn test_degenerate_inputs() {
        assert!(compute_metrics(&[], &[]).is_err());
        assert!(compute_metrics(&[1.0], &[1.0, 2.0]).is_err());
        assert_eq!(compute_metrics(&[5.0, 5.0], &[5.0, 5.0]).unwrap().r2, 1.0);
    }
}
