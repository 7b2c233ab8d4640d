//! Regular-grid interpolation tables
//!
//! Tables are sampled on a uniform grid and evaluated by linear (1D) or
//! bilinear (2D) interpolation. A query outside the sampled domain is an
//! error, never an extrapolation: the solvers size every table from the
//! extrema of the field that will query it.
//!
//! Tables built inside the radius loop are held by a [`TableScope`], so
//! they are released when the radius iteration ends, including on an early
//! `?` return.

mod conditional;

pub use conditional::{ConditionalTables, IntegralKind, TableBounds};

use crate::error::{ErrorContext, ReionError, Result};
use rayon::prelude::*;
use std::ops::Deref;
use tracing::trace;

/// Linear interpolation table on a regular grid
#[derive(Debug, Clone)]
pub struct RGTable1D {
    name: &'static str,
    x_min: f64,
    x_width: f64,
    y: Vec<f64>,
}

impl RGTable1D {
    /// Sample `f` at `n` points spanning `[x_min, x_max]`
    ///
    /// # Panics
    ///
    /// Panics if `n < 2` or the interval is empty
    pub fn build<F>(name: &'static str, x_min: f64, x_max: f64, n: usize, f: F) -> Self
    where
        F: Fn(f64) -> f64 + Sync,
    {
        assert!(n >= 2 && x_max > x_min, "Table needs at least two points");
        let x_width = (x_max - x_min) / (n - 1) as f64;
        let y = (0..n)
            .into_par_iter()
            .map(|i| f(x_min + x_width * i as f64))
            .collect();
        Self {
            name,
            x_min,
            x_width,
            y,
        }
    }

    /// Like [`RGTable1D::build`] for a fallible sampling function
    pub fn try_build<F>(name: &'static str, x_min: f64, x_max: f64, n: usize, f: F) -> Result<Self>
    where
        F: Fn(f64) -> Result<f64> + Sync,
    {
        assert!(n >= 2 && x_max > x_min, "Table needs at least two points");
        let x_width = (x_max - x_min) / (n - 1) as f64;
        let y = (0..n)
            .into_par_iter()
            .map(|i| f(x_min + x_width * i as f64))
            .collect::<Result<Vec<f64>>>()?;
        Ok(Self {
            name,
            x_min,
            x_width,
            y,
        })
    }

    /// Table over samples already taken at uniform spacing on `[x_min, x_max]`
    ///
    /// # Panics
    ///
    /// Panics if fewer than two samples are given or the interval is empty
    pub fn from_samples(name: &'static str, x_min: f64, x_max: f64, y: Vec<f64>) -> Self {
        assert!(y.len() >= 2 && x_max > x_min, "Table needs at least two points");
        Self {
            name,
            x_min,
            x_width: (x_max - x_min) / (y.len() - 1) as f64,
            y,
        }
    }

    /// Lower edge of the domain
    pub fn x_min(&self) -> f64 {
        self.x_min
    }

    /// Upper edge of the domain
    pub fn x_max(&self) -> f64 {
        self.x_min + self.x_width * (self.y.len() - 1) as f64
    }

    /// Interpolated value at `x`
    pub fn eval(&self, x: f64) -> Result<f64> {
        let (idx, t) = locate(self.name, x, self.x_min, self.x_width, self.y.len())?;
        Ok(self.y[idx] * (1.0 - t) + self.y[idx + 1] * t)
    }
}

/// Bilinear interpolation table on a regular grid
#[derive(Debug, Clone)]
pub struct RGTable2D {
    name: &'static str,
    x_min: f64,
    x_width: f64,
    nx: usize,
    y_min: f64,
    y_width: f64,
    ny: usize,
    z: Vec<f64>,
}

impl RGTable2D {
    /// Sample `f(x, y)` on an `nx × ny` grid
    ///
    /// # Panics
    ///
    /// Panics if either axis has fewer than two points or an empty interval
    pub fn try_build<F>(
        name: &'static str,
        (x_min, x_max, nx): (f64, f64, usize),
        (y_min, y_max, ny): (f64, f64, usize),
        f: F,
    ) -> Result<Self>
    where
        F: Fn(f64, f64) -> Result<f64> + Sync,
    {
        assert!(
            nx >= 2 && ny >= 2 && x_max > x_min && y_max > y_min,
            "Table needs at least two points"
        );
        let x_width = (x_max - x_min) / (nx - 1) as f64;
        let y_width = (y_max - y_min) / (ny - 1) as f64;
        let z = (0..nx * ny)
            .into_par_iter()
            .map(|k| {
                let (i, j) = (k / ny, k % ny);
                f(x_min + x_width * i as f64, y_min + y_width * j as f64)
            })
            .collect::<Result<Vec<f64>>>()?;
        Ok(Self {
            name,
            x_min,
            x_width,
            nx,
            y_min,
            y_width,
            ny,
            z,
        })
    }

    /// Interpolated value at `(x, y)`
    pub fn eval(&self, x: f64, y: f64) -> Result<f64> {
        let (i, tx) = locate(self.name, x, self.x_min, self.x_width, self.nx)?;
        let (j, ty) = locate(self.name, y, self.y_min, self.y_width, self.ny)?;
        let at = |a: usize, b: usize| self.z[a * self.ny + b];
        let left = at(i, j) * (1.0 - ty) + at(i, j + 1) * ty;
        let right = at(i + 1, j) * (1.0 - ty) + at(i + 1, j + 1) * ty;
        Ok(left * (1.0 - tx) + right * tx)
    }
}

/// Lower bin and fractional offset of `x`, or a table error
fn locate(name: &'static str, x: f64, min: f64, width: f64, n: usize) -> Result<(usize, f64)> {
    let max = min + width * (n - 1) as f64;
    let pos = (x - min) / width;
    // Admit round-off at the upper edge
    if !(0.0..=(n - 1) as f64 + 1e-6).contains(&pos) {
        return Err(ReionError::Table {
            context: ErrorContext::default(),
            table: name,
            value: x,
            min,
            max,
        });
    }
    let idx = (pos.floor() as usize).min(n - 2);
    Ok((idx, pos - idx as f64))
}

/// Tables owned by one radius iteration
///
/// Dereferences to the tables it holds. Dropping the scope releases them.
#[derive(Debug)]
pub struct TableScope<T> {
    tables: T,
    radius_index: usize,
}

impl<T> TableScope<T> {
    /// Take ownership of `tables` for radius `radius_index`
    pub fn new(tables: T, radius_index: usize) -> Self {
        trace!(radius_index, "building interpolation tables");
        Self {
            tables,
            radius_index,
        }
    }
}

impl<T> Deref for TableScope<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.tables
    }
}

impl<T> Drop for TableScope<T> {
    fn drop(&mut self) {
        trace!(radius_index = self.radius_index, "releasing interpolation tables");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use approx::assert_relative_eq;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_linear_table_exact_for_lines() {
        let table = RGTable1D::build("line", -1.0, 3.0, 9, |x| 2.0 * x + 1.0);
        assert_relative_eq!(table.eval(0.3).unwrap(), 1.6, epsilon = 1e-12);
        assert_relative_eq!(table.eval(3.0).unwrap(), 7.0, epsilon = 1e-12);
        assert_relative_eq!(table.eval(-1.0).unwrap(), -1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_out_of_domain_is_table_error() {
        let table = RGTable1D::build("line", 0.0, 1.0, 5, |x| x);
        let err = table.eval(1.5).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Table);
        assert!(table.eval(f64::NAN).is_err());
        assert!(table.eval(-0.01).is_err());
    }

    #[test]
    fn test_bilinear_table() {
        let table = RGTable2D::try_build("plane", (0.0, 2.0, 5), (10.0, 20.0, 3), |x, y| {
            Ok(x + 0.5 * y)
        })
        .unwrap();
        assert_relative_eq!(table.eval(1.3, 14.0).unwrap(), 8.3, epsilon = 1e-12);
        assert!(table.eval(1.0, 21.0).is_err());
    }

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    fn use_and_fail(flag: Arc<AtomicBool>) -> Result<()> {
        let scope = TableScope::new(DropFlag(flag), 3);
        let _ = &*scope;
        Err(ReionError::numerical(ErrorContext::at(7.0), "fcoll", "nan"))
    }

    #[test]
    fn test_scope_releases_on_error_exit() {
        let flag = Arc::new(AtomicBool::new(false));
        assert!(use_and_fail(flag.clone()).is_err());
        assert!(flag.load(Ordering::SeqCst));
    }
}
