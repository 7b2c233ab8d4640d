//! Per-cell turnover masses
//!
//! Star formation in a cell is suppressed below a turnover mass set by the
//! cooling channel and by radiative feedback from earlier steps. Both box
//! solvers evaluate it the same way:
//!
//! ```text
//! M_acg = max(M_atomic, M_reion)
//! M_mcg = max(M_LW(J21, vcb), M_reion, M_molecular)
//! ```
//!
//! where the floors `M_atomic` and `M_molecular` already include `M_TURN`.
//! Without minihalos every cell uses the feedback-free floors.

use crate::constants::StepConstants;
use crate::context::SimulationContext;
use crate::error::{ReionError, Result};
use crate::grid::{Field3D, GridLayout};
use crate::physics::Feedback;
use rayon::prelude::*;

/// Photoheating threshold of a cell that was never ionized (Msun)
const UNIONIZED_TURNOVER: f64 = 1e-40;

/// Fields of earlier steps that drive the radiative feedback
///
/// A missing field reads as zero in every cell.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeedbackFields<'a> {
    /// Lyman-Werner intensity (1e-21 erg s⁻¹ Hz⁻¹ cm⁻² sr⁻¹)
    pub j21_lw: Option<&'a Field3D>,
    /// Photoionization rate (1e-12 s⁻¹)
    pub gamma12: Option<&'a Field3D>,
    /// First-ionization redshift, negative where never ionized
    pub z_reion: Option<&'a Field3D>,
    /// Relative baryon-dark matter velocity (km/s)
    pub vcb: Option<&'a Field3D>,
}

/// Turnover masses of one cell (Msun)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellTurnovers {
    /// Atomic-cooling galaxies
    pub acg: f64,
    /// Molecular-cooling galaxies
    pub mcg: f64,
    /// Photoheating threshold alone
    pub reion: f64,
    /// Lyman-Werner threshold alone
    pub lw: f64,
}

/// Box means of the log10 turnover masses
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TurnoverAverages {
    pub log10_acg: f64,
    pub log10_mcg: f64,
    pub log10_reion: f64,
    pub log10_lw: f64,
}

/// log10 turnover masses on the grid
#[derive(Debug, Clone, PartialEq)]
pub struct TurnoverGrid {
    pub log10_acg: Field3D,
    pub log10_mcg: Field3D,
    pub averages: TurnoverAverages,
}

/// Evaluates [`CellTurnovers`] for one step
#[derive(Debug, Clone, Copy)]
pub struct TurnoverModel<'a> {
    consts: &'a StepConstants,
    feedback: &'a dyn Feedback,
    fields: FeedbackFields<'a>,
    layout: GridLayout,
    use_mini_halos: bool,
}

impl<'a> TurnoverModel<'a> {
    pub fn new(
        ctx: &'a SimulationContext,
        consts: &'a StepConstants,
        fields: FeedbackFields<'a>,
    ) -> Self {
        Self {
            consts,
            feedback: ctx.physics().feedback.as_ref(),
            fields,
            layout: ctx.layout(),
            use_mini_halos: ctx.config().flags.use_mini_halos,
        }
    }

    /// Turnovers without any radiative feedback
    pub fn feedback_free(&self) -> CellTurnovers {
        CellTurnovers {
            acg: self.consts.mturn_a_nofb,
            mcg: self.consts.mturn_m_nofb,
            reion: 0.0,
            lw: self.consts.mturn_m_nofb,
        }
    }

    /// Turnovers of the cell at real-space offset `index`
    ///
    /// # Errors
    ///
    /// A Lyman-Werner threshold of zero or NaN is a [`ReionError::Config`]:
    /// the feedback parameters are outside the fitted domain.
    pub fn at(&self, index: usize) -> Result<CellTurnovers> {
        if !self.use_mini_halos {
            return Ok(self.feedback_free());
        }
        let read = |field: Option<&Field3D>| field.map_or(0.0, |f| f64::from(f.data[index]));
        let vcb = self
            .fields
            .vcb
            .map_or(self.consts.vcb_norel, |f| f64::from(f.data[index]));
        let z = self.consts.redshift;

        let reion = self
            .feedback
            .reionization_threshold(z, read(self.fields.gamma12), read(self.fields.z_reion))
            .max(UNIONIZED_TURNOVER);
        let j21 = read(self.fields.j21_lw);
        let lw = self.feedback.lyman_werner_threshold(z, j21, vcb);
        if lw.is_nan() || lw == 0.0 {
            return Err(ReionError::config(
                self.consts
                    .error_context()
                    .cell(self.layout.real_coords(index)),
                format!("Lyman-Werner threshold is {lw} (J21={j21}, vcb={vcb})"),
            ));
        }
        Ok(CellTurnovers {
            acg: self.consts.mturn_a_nofb.max(reion),
            mcg: lw.max(reion).max(self.consts.mturn_m_nofb),
            reion,
            lw,
        })
    }

    /// Box means of the log10 turnovers without storing the grid
    pub fn averages(&self) -> Result<TurnoverAverages> {
        if !self.use_mini_halos {
            let t = self.feedback_free();
            return Ok(TurnoverAverages {
                log10_acg: t.acg.log10(),
                log10_mcg: t.mcg.log10(),
                log10_reion: 0.0,
                log10_lw: t.lw.log10(),
            });
        }
        let n = self.layout.real_len();
        let sums = (0..n)
            .into_par_iter()
            .map(|i| {
                self.at(i)
                    .map(|t| [t.acg.log10(), t.mcg.log10(), t.reion.log10(), t.lw.log10()])
            })
            .try_reduce(
                || [0.0; 4],
                |a, b| Ok([a[0] + b[0], a[1] + b[1], a[2] + b[2], a[3] + b[3]]),
            )?;
        let n = n as f64;
        Ok(TurnoverAverages {
            log10_acg: sums[0] / n,
            log10_mcg: sums[1] / n,
            log10_reion: sums[2] / n,
            log10_lw: sums[3] / n,
        })
    }

    /// log10 turnovers of every cell plus their box means
    pub fn grid(&self) -> Result<TurnoverGrid> {
        let n = self.layout.real_len();
        let cells: Vec<CellTurnovers> = (0..n)
            .into_par_iter()
            .map(|i| self.at(i))
            .collect::<Result<_>>()?;

        let log10_acg: Vec<f32> = cells.par_iter().map(|t| t.acg.log10() as f32).collect();
        let log10_mcg: Vec<f32> = cells.par_iter().map(|t| t.mcg.log10() as f32).collect();
        let averages = if self.use_mini_halos {
            let mean = |f: fn(&CellTurnovers) -> f64| {
                cells.par_iter().map(|t| f(t).log10()).sum::<f64>() / n as f64
            };
            TurnoverAverages {
                log10_acg: mean(|t| t.acg),
                log10_mcg: mean(|t| t.mcg),
                log10_reion: mean(|t| t.reion),
                log10_lw: mean(|t| t.lw),
            }
        } else {
            self.averages()?
        };
        Ok(TurnoverGrid {
            log10_acg: Field3D::from_vec(self.layout, log10_acg),
            log10_mcg: Field3D::from_vec(self.layout, log10_mcg),
            averages,
        })
    }
}
