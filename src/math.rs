use std::f64::consts::PI;

pub fn arithmetic_mean(x: &[f64]) -> f64 {
    x.iter().sum::<f64>() / x.len() as f64
}

/// Sample standard deviation (n - 1 denominator).
///
/// Returns `None` for fewer than two observations; dispersion of a single
/// value is undefined, not zero.
pub fn sample_std_dev(x: &[f64]) -> Option<f64> {
    if x.len() < 2 {
        return None;
    }
    let mean = arithmetic_mean(x);
    let ss = x.iter().map(|v| (v - mean).powi(2)).sum::<f64>();
    Some((ss / (x.len() - 1) as f64).sqrt())
}

/// Standard error of the mean: StDev / sqrt(n).
pub fn sem(x: &[f64]) -> Option<f64> {
    sample_std_dev(x).map(|sd| sd / (x.len() as f64).sqrt())
}

/// Circle-equivalent diameter of a region from its area: 2 * sqrt(A / pi).
pub fn diameter_from_area(area: f64) -> f64 {
    2.0 * (area / PI).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_arithmetic_mean() {
        let x = vec![1., 2., 3.];
        assert_relative_eq!(arithmetic_mean(&x), 2.0);
    }

    #[test]
    fn test_sample_std_dev() {
        let x = vec![1., 2., 3.];
        assert_relative_eq!(sample_std_dev(&x).unwrap(), 1.0);
        assert!(sample_std_dev(&[5.0]).is_none());
    }

    #[test]
    fn test_sem() {
        let x = vec![1., 2., 3.];
        assert_relative_eq!(sem(&x).unwrap(), 1.0 / 3f64.sqrt());
    }

    #[test]
    fn test_diameter_from_area() {
        // A = pi r^2 with r = 1 gives d = 2
        assert_relative_eq!(diameter_from_area(PI), 2.0);
    }
}
