// =============================================================================
// Return Correlation
// =============================================================================
//
// Pearson correlation of close-to-close returns between two candle series.
// The scanner uses this against the BTC series to score and gate candidates.

use crate::market_data::Candle;

/// Pearson correlation coefficient of two equal-length samples.
///
/// Returns `None` for fewer than 2 points or zero variance in either sample.
pub fn pearson(a: &[f64], b: &[f64]) -> Option<f64> {
    if a.len() != b.len() || a.len() < 2 {
        return None;
    }

    let n = a.len() as f64;
    let mean_a = a.iter().sum::<f64>() / n;
    let mean_b = b.iter().sum::<f64>() / n;

    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for (x, y) in a.iter().zip(b.iter()) {
        let dx = x - mean_a;
        let dy = y - mean_b;
        cov += dx * dy;
        var_a += dx * dx;
        var_b += dy * dy;
    }

    if var_a == 0.0 || var_b == 0.0 {
        return None;
    }

    let r = cov / (var_a.sqrt() * var_b.sqrt());
    if r.is_finite() {
        Some(r.clamp(-1.0, 1.0))
    } else {
        None
    }
}

/// Close-to-close returns of a candle series, oldest first.
fn returns(candles: &[Candle]) -> Vec<f64> {
    candles
        .windows(2)
        .filter(|w| w[0].close > 0.0)
        .map(|w| w[1].close / w[0].close - 1.0)
        .collect()
}

/// Correlation of returns between `candles` and `reference`, using the
/// overlapping tail of both series. Returns 0.0 when correlation cannot be
/// computed — uncorrelated is the neutral assumption for scoring.
pub fn return_correlation(candles: &[Candle], reference: &[Candle]) -> f64 {
    let ra = returns(candles);
    let rb = returns(reference);
    let n = ra.len().min(rb.len());
    if n < 2 {
        return 0.0;
    }
    pearson(&ra[ra.len() - n..], &rb[rb.len() - n..]).unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series(closes: &[f64]) -> Vec<Candle> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Candle {
                ts_ms: i as i64 * 300_000,
                open: c,
                high: c + 1.0,
                low: c - 1.0,
                close: c,
                volume: 1.0,
            })
            .collect()
    }

    #[test]
    fn identical_series_fully_correlated() {
        let a = series(&[100.0, 101.0, 99.0, 102.0, 103.0, 101.5]);
        let r = return_correlation(&a, &a);
        assert!((r - 1.0).abs() < 1e-9, "got {r}");
    }

    #[test]
    fn inverted_series_fully_anticorrelated() {
        let a = series(&[100.0, 102.0, 100.0, 104.0, 100.0]);
        // Mirror the moves around 100.
        let b = series(&[100.0, 98.0, 100.0, 96.0, 100.0]);
        let r = return_correlation(&a, &b);
        assert!(r < -0.9, "got {r}");
    }

    #[test]
    fn flat_series_is_neutral() {
        let a = series(&[100.0; 10]);
        let b = series(&[100.0, 101.0, 102.0, 103.0, 104.0, 105.0, 106.0, 107.0, 108.0, 109.0]);
        assert_eq!(return_correlation(&a, &b), 0.0);
    }

    #[test]
    fn pearson_rejects_mismatched_lengths() {
        assert!(pearson(&[1.0, 2.0], &[1.0]).is_none());
        assert!(pearson(&[1.0], &[1.0]).is_none());
    }
}
