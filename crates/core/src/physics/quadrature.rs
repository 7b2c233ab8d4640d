//! Composite Simpson quadrature

/// Integrate `f` over `[a, b]` with `intervals` Simpson panels
///
/// `intervals` is rounded up to an even number. An empty or reversed
/// interval integrates to zero.
pub(crate) fn simpson<F>(a: f64, b: f64, intervals: usize, f: F) -> f64
where
    F: Fn(f64) -> f64,
{
    if b <= a {
        return 0.0;
    }
    let n = (intervals.max(2) + 1) & !1;
    let h = (b - a) / n as f64;
    let mut sum = f(a) + f(b);
    for i in 1..n {
        let weight = if i % 2 == 1 { 4.0 } else { 2.0 };
        sum += weight * f(a + h * i as f64);
    }
    sum * h / 3.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_cubic_is_exact() {
        let value = simpson(0.0, 2.0, 4, |x| x * x * x - x);
        assert_relative_eq!(value, 2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_odd_interval_count_rounds_up() {
        let value = simpson(0.0, std::f64::consts::PI, 101, f64::sin);
        assert_relative_eq!(value, 2.0, epsilon = 1e-7);
    }

    #[test]
    fn test_empty_interval() {
        assert_eq!(simpson(1.0, 1.0, 10, |x| x), 0.0);
        assert_eq!(simpson(2.0, 1.0, 10, |x| x), 0.0);
    }
}
