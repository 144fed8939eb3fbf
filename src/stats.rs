// Descriptive statistics shared by the tracker and scorer

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population variance
pub fn variance(values: &[f64], mean: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64
}

pub fn std_dev(values: &[f64]) -> f64 {
    variance(values, mean(values)).sqrt()
}

pub fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Relative deviation of `value` from `reference`; infinite when the
/// reference is zero and the value is not.
pub fn relative_deviation(value: f64, reference: f64) -> f64 {
    let diff = (value - reference).abs();
    if reference.abs() < f64::EPSILON {
        if diff < f64::EPSILON {
            0.0
        } else {
            f64::INFINITY
        }
    } else {
        diff / reference.abs()
    }
}
