//! The integration engine: advances one or many trajectories over a
//! requested time grid under a force-field oracle. Fixed-step symplectic
//! and Runge-Kutta-style schemes step interval by interval; adaptive
//! schemes choose internal steps from a local error estimate and produce
//! grid values by dense-output interpolation, never by forcing a step onto
//! an output time (only the final endpoint of a run clamps the step).

use crate::error::{config_err, OrbitError, Result};
use crate::phase::{OrbitBatch, PhaseClass, TimeGrid};
use crate::solvers::{
    AccelField, DormandPrince54, EmbeddedStep, Extrapolated6, Gbs8, KickDriftKick, Rk4,
    LEAPFROG_WEIGHTS, SYMPLEC4_WEIGHTS, SYMPLEC6_WEIGHTS,
};
use crate::traits::{Potential, VectorField};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Integrator selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Method {
    /// 2nd-order kick-drift-kick leapfrog (symplectic).
    LeapFrog,
    /// 4th-order Forest-Ruth composition of leapfrog (symplectic).
    SymplecFourth,
    /// 6th-order Yoshida composition of leapfrog (symplectic).
    SymplecSixth,
    /// Classic fixed-step RK4.
    Rk4Fixed,
    /// Fixed-cost 6th-order extrapolated midpoint.
    Extrapolated6,
    /// Adaptive Dormand-Prince 5(4) with dense output.
    DormandPrince54,
    /// Adaptive order-8 Gragg-Bulirsch-Stoer extrapolation.
    Gbs8,
}

impl Method {
    pub fn is_symplectic(&self) -> bool {
        matches!(
            self,
            Method::LeapFrog | Method::SymplecFourth | Method::SymplecSixth
        )
    }

    pub fn is_adaptive(&self) -> bool {
        matches!(self, Method::DormandPrince54 | Method::Gbs8)
    }
}

/// Step-control configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StepControl {
    /// Integrator steps per grid interval for fixed-step methods.
    pub fixed_substeps: usize,
    /// Relative tolerance for adaptive methods.
    pub rtol: f64,
    /// Absolute tolerance for adaptive methods.
    pub atol: f64,
    /// Cap on internal adaptive steps per trajectory per call.
    pub max_steps: usize,
    /// State-magnitude bound beyond which the trajectory counts as diverged.
    pub sanity_bound: f64,
}

impl Default for StepControl {
    fn default() -> Self {
        Self {
            fixed_substeps: 1,
            rtol: 1e-8,
            atol: 1e-8,
            max_steps: 1_000_000,
            sanity_bound: 1e8,
        }
    }
}

/// Per-trajectory outcomes of one batch integration. A failed trajectory
/// keeps its partial series; siblings are unaffected.
#[derive(Debug)]
pub struct IntegrationReport {
    pub outcomes: Vec<Result<()>>,
}

impl IntegrationReport {
    pub fn all_ok(&self) -> bool {
        self.outcomes.iter().all(|o| o.is_ok())
    }

    pub fn n_failed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_err()).count()
    }
}

/// Equations of motion in the rectangular integration state, as a
/// first-order field for the RK-family kernels.
pub(crate) struct RectOrbitField<'a> {
    class: PhaseClass,
    pot: &'a dyn Potential,
}

impl<'a> RectOrbitField<'a> {
    pub fn new(class: PhaseClass, pot: &'a dyn Potential) -> Self {
        Self { class, pot }
    }
}

impl VectorField for RectOrbitField<'_> {
    fn dim(&self) -> usize {
        self.class.rect_dim()
    }

    fn eval(&self, t: f64, y: &[f64], out: &mut [f64]) {
        let half = y.len() / 2;
        let (pos, vel) = self.class.rect_pos_vel(y);
        let acc = self.pot.acceleration(&pos, &vel, t);
        out[..half].copy_from_slice(&y[half..]);
        match half {
            1 => out[1] = acc.x,
            2 => {
                out[2] = acc.x;
                out[3] = acc.y;
            }
            _ => {
                out[3] = acc.x;
                out[4] = acc.y;
                out[5] = acc.z;
            }
        }
    }
}

/// Position-only force view for the symplectic kernels. Velocity enters as
/// zero; the engine refuses velocity-dependent oracles for these methods
/// before any stepping.
struct RectAccelField<'a> {
    class: PhaseClass,
    pot: &'a dyn Potential,
}

impl AccelField for RectAccelField<'_> {
    fn half_dim(&self) -> usize {
        self.class.rect_dim() / 2
    }

    fn accel(&self, t: f64, q: &[f64], out: &mut [f64]) {
        let pos = match q.len() {
            1 => nalgebra::Vector3::new(q[0], 0.0, 0.0),
            2 => nalgebra::Vector3::new(q[0], q[1], 0.0),
            _ => nalgebra::Vector3::new(q[0], q[1], q[2]),
        };
        let acc = self.pot.acceleration(&pos, &nalgebra::Vector3::zeros(), t);
        match q.len() {
            1 => out[0] = acc.x,
            2 => {
                out[0] = acc.x;
                out[1] = acc.y;
            }
            _ => {
                out[0] = acc.x;
                out[1] = acc.y;
                out[2] = acc.z;
            }
        }
    }
}

fn state_ok(y: &[f64], bound: f64) -> bool {
    y.iter().all(|v| v.is_finite() && v.abs() < bound)
}

fn divergence(t: f64, y: &[f64], reason: &str) -> OrbitError {
    OrbitError::Divergence {
        last_time: t,
        last_state: y.to_vec(),
        reason: reason.into(),
    }
}

/// Drives a first-order field through `targets` with an RK-family method,
/// invoking `record` once per target in order. `targets` must continue
/// monotonically away from `t0` after its first entry; a displaced first
/// entry is reached by a silent preliminary run.
pub(crate) fn drive_first_order(
    field: &dyn VectorField,
    t0: f64,
    y0: &[f64],
    targets: &[f64],
    method: Method,
    control: &StepControl,
    record: &mut dyn FnMut(usize, f64, &[f64]),
) -> Result<()> {
    if targets.is_empty() {
        return Ok(());
    }
    let mut y = y0.to_vec();
    let mut t = t0;

    // Displaced start: reach the first grid time, then record it.
    if targets[0] != t0 {
        run_segment(field, &mut t, &mut y, &[targets[0]], method, control, &mut |_, _, _| {})?;
        t = targets[0];
    }
    record(0, t, &y);
    if !state_ok(&y, control.sanity_bound) {
        return Err(divergence(t, &y, "state exceeded sanity bound"));
    }
    if targets.len() == 1 {
        return Ok(());
    }
    run_segment(
        field,
        &mut t,
        &mut y,
        &targets[1..],
        method,
        control,
        &mut |i, tt, yy| record(i + 1, tt, yy),
    )
}

/// One monotonic run over `targets` (not including the current time).
fn run_segment(
    field: &dyn VectorField,
    t: &mut f64,
    y: &mut Vec<f64>,
    targets: &[f64],
    method: Method,
    control: &StepControl,
    record: &mut dyn FnMut(usize, f64, &[f64]),
) -> Result<()> {
    match method {
        Method::Rk4Fixed | Method::Extrapolated6 => {
            fixed_run(field, t, y, targets, method, control, record)
        }
        Method::DormandPrince54 => {
            let mut kernel = DormandPrince54::new(y.len());
            adaptive_run(field, &mut kernel, t, y, targets, control, None, record)
        }
        Method::Gbs8 => {
            let mut kernel = Gbs8::new(y.len());
            // Hermite dense output: keep macro steps near the output
            // spacing so interpolation error stays below the tolerance.
            let cap = max_interval(*t, targets);
            adaptive_run(field, &mut kernel, t, y, targets, control, Some(cap), record)
        }
        _ => config_err("symplectic methods cannot drive a generic first-order field"),
    }
}

fn max_interval(t0: f64, targets: &[f64]) -> f64 {
    let mut prev = t0;
    let mut max = 0.0_f64;
    for &tt in targets {
        max = max.max((tt - prev).abs());
        prev = tt;
    }
    max
}

fn fixed_run(
    field: &dyn VectorField,
    t: &mut f64,
    y: &mut Vec<f64>,
    targets: &[f64],
    method: Method,
    control: &StepControl,
    record: &mut dyn FnMut(usize, f64, &[f64]),
) -> Result<()> {
    let n_sub = control.fixed_substeps.max(1);
    let mut rk4 = Rk4::new(y.len());
    for (i, &target) in targets.iter().enumerate() {
        let dt = (target - *t) / n_sub as f64;
        if dt != 0.0 {
            for _ in 0..n_sub {
                match method {
                    Method::Rk4Fixed => rk4.step(field, t, y, dt),
                    _ => Extrapolated6::step(field, t, y, dt),
                }
                if !state_ok(y, control.sanity_bound) {
                    return Err(divergence(*t, y, "state exceeded sanity bound"));
                }
            }
        }
        *t = target;
        record(i, *t, y);
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn adaptive_run(
    field: &dyn VectorField,
    kernel: &mut dyn EmbeddedStep,
    t: &mut f64,
    y: &mut Vec<f64>,
    targets: &[f64],
    control: &StepControl,
    step_cap: Option<f64>,
    record: &mut dyn FnMut(usize, f64, &[f64]),
) -> Result<()> {
    let Some(&t_end) = targets.last() else {
        return Ok(());
    };
    if t_end == *t {
        for (i, &tt) in targets.iter().enumerate() {
            record(i, tt, y);
        }
        return Ok(());
    }
    let dir = (t_end - *t).signum();
    let exponent = kernel.error_exponent();
    let mut h = (targets[0] - *t) * 0.5;
    if h == 0.0 {
        h = (t_end - *t) / targets.len() as f64;
    }
    if let Some(cap) = step_cap {
        if h.abs() > cap {
            h = cap * dir;
        }
    }

    let mut y_new = vec![0.0; y.len()];
    let mut buf = vec![0.0; y.len()];
    let mut next = 0usize;
    let mut n_steps = 0usize;

    loop {
        if n_steps >= control.max_steps {
            return Err(divergence(*t, y, "exceeded maximum internal step count"));
        }
        if h.abs() < f64::EPSILON * t.abs().max(1.0) {
            return Err(divergence(*t, y, "adaptive step size underflow"));
        }
        // Clamp only at the end of the whole run.
        if (*t + h - t_end) * dir > 0.0 {
            h = t_end - *t;
        }

        let err = kernel.attempt(field, *t, y, h, &mut y_new, control.rtol, control.atol);
        n_steps += 1;

        if !err.is_finite() {
            h *= 0.25;
            continue;
        }
        if err > 1.0 {
            let factor = (0.9 * err.powf(-exponent)).max(0.2);
            h *= factor;
            continue;
        }

        if !state_ok(&y_new, control.sanity_bound) {
            return Err(divergence(*t, y, "state exceeded sanity bound"));
        }

        kernel.prepare_dense(field, *t, y, &y_new, h);
        while next < targets.len() {
            let tt = targets[next];
            if (tt - (*t + h)) * dir > 0.0 {
                break;
            }
            let theta = (tt - *t) / h;
            kernel.interpolate(field, theta, &mut buf);
            if !state_ok(&buf, control.sanity_bound) {
                return Err(divergence(*t, y, "interpolated state exceeded sanity bound"));
            }
            record(next, tt, &buf);
            next += 1;
        }

        *t += h;
        y.copy_from_slice(&y_new);
        if next >= targets.len() || (t_end - *t) * dir <= 0.0 {
            // Record any targets numerically tied to the endpoint.
            while next < targets.len() {
                record(next, targets[next], y);
                next += 1;
            }
            return Ok(());
        }

        let mut factor = 0.9 * err.powf(-exponent);
        factor = factor.clamp(0.2, 5.0);
        h *= factor;
        if let Some(cap) = step_cap {
            if h.abs() > cap {
                h = cap * dir;
            }
        }
    }
}

/// Drives the symplectic split kernels over the grid.
fn symplectic_run(
    accel: &RectAccelField<'_>,
    t0: f64,
    y0: &[f64],
    targets: &[f64],
    weights: &[f64],
    control: &StepControl,
    record: &mut dyn FnMut(usize, f64, &[f64]),
) -> Result<()> {
    if targets.is_empty() {
        return Ok(());
    }
    let half = accel.half_dim();
    let mut y = y0.to_vec();
    let mut t = t0;
    let mut kdk = KickDriftKick::new(half);
    let n_sub = control.fixed_substeps.max(1);

    for (i, &target) in targets.iter().enumerate() {
        let dt = (target - t) / n_sub as f64;
        if dt != 0.0 {
            let (q, v) = y.split_at_mut(half);
            for _ in 0..n_sub {
                kdk.step(accel, &mut t, q, v, dt, weights);
            }
        }
        t = target;
        if !state_ok(&y, control.sanity_bound) {
            return Err(divergence(t, &y, "state exceeded sanity bound"));
        }
        record(i, t, &y);
    }
    Ok(())
}

impl OrbitBatch {
    /// Integrates every trajectory in the batch over `grid` under `pot`.
    ///
    /// Configuration problems (a velocity-dependent oracle under a
    /// symplectic splitting, non-positive tolerances) fail fast before any
    /// numerical work. Numerical divergence is collected per trajectory in
    /// the report; the diverged trajectory keeps the partial series up to
    /// its last valid grid time and its siblings are unaffected.
    ///
    /// A zero-length grid is a no-op that still marks the batch integrated.
    /// A grid whose first time differs from a trajectory's epoch is honored
    /// by silently integrating to that first time before recording.
    pub fn integrate(
        &mut self,
        grid: &TimeGrid,
        pot: &dyn Potential,
        method: Method,
        control: &StepControl,
    ) -> Result<IntegrationReport> {
        if method.is_symplectic() && pot.velocity_dependent() {
            return config_err(
                "symplectic kick-drift splittings require velocity-independent forces; \
                 use an RK-family method for this oracle",
            );
        }
        if method.is_adaptive() && (control.rtol <= 0.0 || control.atol <= 0.0) {
            return config_err("adaptive integration needs positive rtol and atol");
        }
        let class = self.class();
        let targets = grid.as_slice().to_vec();
        let ncoord = class.ncoord();

        let outcomes: Vec<Result<()>> = self
            .orbits_mut()
            .par_iter_mut()
            .map(|orbit| {
                let mut times = Vec::with_capacity(targets.len());
                let mut series = Vec::with_capacity(targets.len() * ncoord);
                let rect0 = class.to_rect(orbit.initial());
                let mut record = |_i: usize, tt: f64, rect: &[f64]| {
                    times.push(tt);
                    series.extend_from_slice(&class.from_rect(rect));
                };

                let result = if method.is_symplectic() {
                    let accel = RectAccelField { class, pot };
                    symplectic_run(
                        &accel,
                        orbit.epoch(),
                        &rect0,
                        &targets,
                        match method {
                            Method::LeapFrog => &LEAPFROG_WEIGHTS[..],
                            Method::SymplecFourth => &SYMPLEC4_WEIGHTS[..],
                            _ => &SYMPLEC6_WEIGHTS[..],
                        },
                        control,
                        &mut record,
                    )
                } else {
                    let field = RectOrbitField::new(class, pot);
                    drive_first_order(
                        &field,
                        orbit.epoch(),
                        &rect0,
                        &targets,
                        method,
                        control,
                        &mut record,
                    )
                };

                if let Err(err) = &result {
                    debug!(?err, "trajectory diverged; keeping partial series");
                }
                orbit.store_series(times, series);
                result
            })
            .collect();

        Ok(IntegrationReport { outcomes })
    }
}
