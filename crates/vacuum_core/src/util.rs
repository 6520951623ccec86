//! Small vector helpers shared across the pipeline.

pub fn l2_norm(v: &[f64]) -> f64 {
    v.iter().map(|value| value * value).sum::<f64>().sqrt()
}

pub fn squared_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
}

pub fn l2_distance(a: &[f64], b: &[f64]) -> f64 {
    squared_distance(a, b).sqrt()
}

pub fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

pub fn subtract(a: &[f64], b: &[f64]) -> Vec<f64> {
    a.iter().zip(b.iter()).map(|(x, y)| x - y).collect()
}

/// True if every coordinate of `a` is within `half_width` of `b`.
pub fn within_hypercube(a: &[f64], b: &[f64], half_width: f64) -> bool {
    a.len() == b.len()
        && a
            .iter()
            .zip(b.iter())
            .all(|(x, y)| (x - y).abs() <= half_width)
}

/// `count` points spaced evenly in log between `low` and `high` (inclusive).
pub fn log_spaced(low: f64, high: f64, count: usize) -> Vec<f64> {
    match count {
        0 => Vec::new(),
        1 => vec![low],
        _ => {
            let (ln_low, ln_high) = (low.ln(), high.ln());
            let step = (ln_high - ln_low) / (count - 1) as f64;
            (0..count)
                .map(|i| match i {
                    0 => low,
                    i if i == count - 1 => high,
                    i => (ln_low + step * i as f64).exp(),
                })
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hypercube_is_per_coordinate() {
        assert!(within_hypercube(&[1.0, 2.0], &[1.05, 1.95], 0.1));
        assert!(!within_hypercube(&[1.0, 2.0], &[1.05, 2.2], 0.1));
        assert!(!within_hypercube(&[1.0], &[1.0, 0.0], 0.1));
    }

    #[test]
    fn log_spacing_hits_both_ends() {
        let scales = log_spaced(10.0, 1000.0, 3);
        assert_eq!(scales.len(), 3);
        assert_eq!(scales[0], 10.0);
        assert!((scales[1] - 100.0).abs() < 1e-9);
        assert_eq!(scales[2], 1000.0);
        assert_eq!(log_spaced(3.0, 7.0, 4)[0], 3.0);
    }
}
