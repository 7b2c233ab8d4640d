//! Smoothing kernels in Fourier space
//!
//! Each kernel is the Fourier transform of a real-space window of radius `R`
//! normalised so the `k = 0` mode passes unchanged. The exponential kernel is
//! the exception: its window is damped by the mean free path and it keeps the
//! damping in its normalisation.

use rustfft::num_complex::Complex64;

/// Radius scaling that gives a sharp-k filter the volume of a top-hat
pub const SHARP_K_FACTOR: f64 = 0.413566994;

/// Width scaling that gives a Gaussian filter the volume of a top-hat
pub const GAUSSIAN_FACTOR: f64 = 0.643;

/// Smoothing window applied by [`super::GridFilterEngine`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FilterKind {
    /// Real-space spherical top-hat
    TopHat,
    /// Sharp cut-off in k-space
    SharpK,
    /// Gaussian
    Gaussian,
    /// Top-hat weighted by `exp(-r / mfp)`
    ExpMfp {
        /// Mean free path (Mpc)
        mfp: f64,
    },
    /// Spherical shell between `inner` and the filter radius
    Annulus {
        /// Inner shell radius (Mpc)
        inner: f64,
    },
}

impl FilterKind {
    /// Kernel for a `HII_FILTER`/`HEAT_FILTER` selector
    ///
    /// # Returns
    ///
    /// `None` for selectors other than 0 (top-hat), 1 (sharp-k), 2 (Gaussian)
    pub fn from_selector(selector: u8) -> Option<Self> {
        match selector {
            0 => Some(Self::TopHat),
            1 => Some(Self::SharpK),
            2 => Some(Self::Gaussian),
            _ => None,
        }
    }

    /// Fourier weight of mode `k` (Mpc⁻¹) for a window of radius `r` (Mpc)
    pub fn weight(&self, k: f64, r: f64) -> f64 {
        match *self {
            Self::TopHat => top_hat(k * r),
            Self::SharpK => {
                if k * r * SHARP_K_FACTOR > 1.0 {
                    0.0
                } else {
                    1.0
                }
            }
            Self::Gaussian => {
                let kr = GAUSSIAN_FACTOR * k * r;
                (-kr * kr / 2.0).exp()
            }
            Self::ExpMfp { mfp } => exp_mfp(k, r, mfp),
            Self::Annulus { inner } => {
                let outer3 = r * r * r;
                let inner3 = inner * inner * inner;
                if outer3 - inner3 <= 0.0 {
                    return top_hat(k * r);
                }
                (outer3 * top_hat(k * r) - inner3 * top_hat(k * inner)) / (outer3 - inner3)
            }
        }
    }
}

/// Fourier transform of a normalised spherical top-hat at `x = kR`
#[inline]
pub fn top_hat(x: f64) -> f64 {
    if x > 1e-4 {
        3.0 * (x.sin() - x * x.cos()) / (x * x * x)
    } else {
        1.0
    }
}

/// Fourier transform of `exp(-r/λ)` inside radius `R`, over the top-hat volume
fn exp_mfp(k: f64, r: f64, mfp: f64) -> f64 {
    let a = 1.0 / mfp;
    if k < 1e-10 {
        let a3 = a * a * a;
        return 3.0 / (r * r * r)
            * (2.0 / a3 - (-a * r).exp() * (r * r / a + 2.0 * r / (a * a) + 2.0 / a3));
    }
    let s = Complex64::new(-a, k);
    let integral = (s * r).exp() * (r / s - 1.0 / (s * s)) + 1.0 / (s * s);
    3.0 / (r * r * r * k) * integral.im
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_zero_mode_is_unity() {
        for kind in [
            FilterKind::TopHat,
            FilterKind::SharpK,
            FilterKind::Gaussian,
            FilterKind::Annulus { inner: 2.0 },
        ] {
            assert_relative_eq!(kind.weight(0.0, 5.0), 1.0);
        }
    }

    #[test]
    fn test_sharp_k_cutoff() {
        let r = 10.0;
        let edge = 1.0 / (r * SHARP_K_FACTOR);
        assert_eq!(FilterKind::SharpK.weight(edge * 0.99, r), 1.0);
        assert_eq!(FilterKind::SharpK.weight(edge * 1.01, r), 0.0);
    }

    #[test]
    fn test_exp_filter_small_k_limit_matches_series() {
        let (r, mfp) = (8.0, 20.0);
        let at_zero = FilterKind::ExpMfp { mfp }.weight(0.0, r);
        let near_zero = FilterKind::ExpMfp { mfp }.weight(1e-4, r);
        assert_relative_eq!(at_zero, near_zero, max_relative = 1e-5);
    }

    #[test]
    fn test_exp_filter_approaches_top_hat_for_long_mfp() {
        let r = 5.0;
        let kind = FilterKind::ExpMfp { mfp: 1e6 };
        for k in [0.05, 0.3, 1.0] {
            assert_relative_eq!(kind.weight(k, r), top_hat(k * r), epsilon = 1e-4);
        }
    }

    #[test]
    fn test_annulus_without_hole_is_top_hat() {
        let kind = FilterKind::Annulus { inner: 0.0 };
        assert_relative_eq!(kind.weight(0.4, 6.0), top_hat(2.4));
    }

    #[test]
    fn test_selector_range() {
        assert_eq!(FilterKind::from_selector(0), Some(FilterKind::TopHat));
        assert_eq!(FilterKind::from_selector(2), Some(FilterKind::Gaussian));
        assert_eq!(FilterKind::from_selector(3), None);
    }
}
