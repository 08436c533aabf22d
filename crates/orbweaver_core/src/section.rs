//! Surface-of-section sampling: records a trajectory exactly where it
//! pierces a chosen phase-space plane in the positive direction.
//!
//! The primary method reparameterizes the section pair (q, pq) through an
//! angle, q = A sin psi, pq = A cos psi, and integrates the remaining state
//! with psi as the independent variable; crossings then sit at exact
//! multiples of 2*pi and need no event detection at all. When the angle
//! flow loses monotonicity (psi-dot dips to zero, which happens for orbits
//! that linger near the section with little conjugate momentum), the engine
//! falls back to plain time integration with sign-change bracketing and
//! Newton refinement, and flags the result.

use crate::error::{config_err, OrbitError, Result};
use crate::integrate::{drive_first_order, Method, RectOrbitField, StepControl};
use crate::phase::PhaseClass;
use crate::solvers::Rk4;
use crate::traits::{Potential, VectorField};
use std::f64::consts::TAU;
use tracing::warn;

/// Which plane the trajectory is sampled on. Crossings are one-sided: only
/// passages with positive conjugate momentum count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionFamily {
    /// z = 0 with vz > 0; needs a spatial state.
    VerticalMidplane,
    /// y = 0 with vy > 0; needs a planar state.
    XAxisPlanar,
    /// x = 0 with vx > 0; needs a planar state.
    YAxisPlanar,
}

impl SectionFamily {
    /// Rectangular indices of the section coordinate and its momentum.
    fn pair(&self, class: PhaseClass) -> Result<(usize, usize)> {
        match (self, class) {
            (SectionFamily::VerticalMidplane, PhaseClass::Spatial { .. }) => Ok((2, 5)),
            (SectionFamily::XAxisPlanar, PhaseClass::Planar { .. }) => Ok((1, 3)),
            (SectionFamily::YAxisPlanar, PhaseClass::Planar { .. }) => Ok((0, 2)),
            (SectionFamily::VerticalMidplane, _) => {
                config_err("the midplane section needs a spatial phase-space state")
            }
            _ => config_err("axis sections need a planar phase-space state"),
        }
    }
}

/// Section crossings of one trajectory, in crossing order.
#[derive(Debug, Clone)]
pub struct SurfaceOfSection {
    class: PhaseClass,
    times: Vec<f64>,
    points: Vec<f64>,
    /// True when the angular reparameterization broke down and the
    /// crossings were located by brute-force time integration instead.
    pub used_fallback: bool,
}

impl SurfaceOfSection {
    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn times(&self) -> &[f64] {
        &self.times
    }

    /// Phase-space point at crossing `i`.
    pub fn point(&self, i: usize) -> &[f64] {
        let n = self.class.ncoord();
        &self.points[i * n..(i + 1) * n]
    }
}

/// The orbit equations with the section angle psi as independent variable.
///
/// State layout: [A, t, remaining rectangular components in order]. The
/// section pair is reconstructed from (A, psi) at every force evaluation.
/// A non-monotonic angle flow is signalled by writing NaN derivatives,
/// which the adaptive driver converts into a divergence.
struct PsiField<'a> {
    rect: RectOrbitField<'a>,
    q_idx: usize,
    pq_idx: usize,
    dim: usize,
}

impl PsiField<'_> {
    fn pack(&self, a: f64, t: f64, rect: &[f64]) -> Vec<f64> {
        let mut u = Vec::with_capacity(self.dim);
        u.push(a);
        u.push(t);
        for (j, &v) in rect.iter().enumerate() {
            if j != self.q_idx && j != self.pq_idx {
                u.push(v);
            }
        }
        u
    }

    fn unpack(&self, u: &[f64], q: f64, pq: f64, rect: &mut [f64]) {
        let mut k = 2;
        for (j, slot) in rect.iter_mut().enumerate() {
            if j == self.q_idx {
                *slot = q;
            } else if j == self.pq_idx {
                *slot = pq;
            } else {
                *slot = u[k];
                k += 1;
            }
        }
    }
}

impl VectorField for PsiField<'_> {
    fn dim(&self) -> usize {
        self.dim
    }

    fn eval(&self, psi: f64, u: &[f64], out: &mut [f64]) {
        let a = u[0];
        let t = u[1];
        let (sin_psi, cos_psi) = psi.sin_cos();

        let mut rect = vec![0.0; self.dim];
        self.unpack(u, a * sin_psi, a * cos_psi, &mut rect);
        let mut ydot = vec![0.0; self.dim];
        self.rect.eval(t, &rect, &mut ydot);

        let f_q = ydot[self.pq_idx];
        let psi_dot = cos_psi * cos_psi - (f_q / a) * sin_psi;
        if !psi_dot.is_finite() || psi_dot <= 0.0 {
            out.fill(f64::NAN);
            return;
        }
        out[0] = (a * sin_psi * cos_psi + f_q * cos_psi) / psi_dot;
        out[1] = 1.0 / psi_dot;
        let mut k = 2;
        for (j, &d) in ydot.iter().enumerate() {
            if j != self.q_idx && j != self.pq_idx {
                out[k] = d / psi_dot;
                k += 1;
            }
        }
    }
}

/// Locates the first `n_crossings` positive-direction passages of the
/// trajectory through the section plane, starting strictly after the epoch.
///
/// Needs an RK-family method; the reparameterized system is a generic
/// first-order field. Fails with a precondition error when the initial
/// state has zero section amplitude (the trajectory lies in the plane and
/// never pierces it).
///
/// `fallback_time` opts into the brute-force mode used when the angle flow
/// is not monotonic: plain time integration bounded by that duration, which
/// may yield fewer crossings than requested. Without it, a non-monotonic
/// angle flow is a precondition error.
#[allow(clippy::too_many_arguments)]
pub fn surface_of_section(
    class: PhaseClass,
    point: &[f64],
    epoch: f64,
    family: SectionFamily,
    n_crossings: usize,
    pot: &dyn Potential,
    method: Method,
    control: &StepControl,
    fallback_time: Option<f64>,
) -> Result<SurfaceOfSection> {
    let (q_idx, pq_idx) = family.pair(class)?;
    if point.len() != class.ncoord() || point.iter().any(|c| !c.is_finite()) {
        return config_err("phase-space point does not match the declared class");
    }
    if method.is_symplectic() {
        return config_err(
            "section sampling drives a generic first-order system; use an RK-family method",
        );
    }

    let rect0 = class.to_rect(point);
    let q0 = rect0[q_idx];
    let pq0 = rect0[pq_idx];
    let a0 = q0.hypot(pq0);
    if a0 < 1e-12 {
        return Err(OrbitError::SectionPrecondition(
            "initial state has zero section amplitude; the trajectory lies in the \
             section plane and never crosses it"
                .into(),
        ));
    }
    if n_crossings == 0 {
        return Ok(SurfaceOfSection {
            class,
            times: Vec::new(),
            points: Vec::new(),
            used_fallback: false,
        });
    }

    let field = PsiField {
        rect: RectOrbitField::new(class, pot),
        q_idx,
        pq_idx,
        dim: class.rect_dim(),
    };
    let psi0 = q0.atan2(pq0);
    // First crossing strictly after the start.
    let first = TAU * (psi0 / TAU).floor() + TAU;
    let targets: Vec<f64> = (0..n_crossings).map(|k| first + TAU * k as f64).collect();
    let u0 = field.pack(a0, epoch, &rect0);

    let mut times = Vec::with_capacity(n_crossings);
    let mut points = Vec::with_capacity(n_crossings * class.ncoord());
    let mut rect = vec![0.0; class.rect_dim()];
    let mut record = |_i: usize, _psi: f64, u: &[f64]| {
        // At a crossing the pair is (q, pq) = (0, A) by construction.
        field.unpack(u, 0.0, u[0], &mut rect);
        times.push(u[1]);
        points.extend_from_slice(&class.from_rect(&rect));
    };

    match drive_first_order(&field, psi0, &u0, &targets, method, control, &mut record) {
        Ok(()) => Ok(SurfaceOfSection {
            class,
            times,
            points,
            used_fallback: false,
        }),
        Err(OrbitError::Divergence { reason, .. }) => {
            let Some(t_max) = fallback_time else {
                return Err(OrbitError::SectionPrecondition(format!(
                    "section angle flow is not monotonic ({reason}) and no brute-force \
                     time bound was supplied"
                )));
            };
            warn!(
                %reason,
                "section angle flow lost monotonicity; brute-force fallback"
            );
            let (times, points) = brute_force_crossings(
                class,
                &rect0,
                epoch,
                q_idx,
                pq_idx,
                n_crossings,
                t_max,
                pot,
            )?;
            Ok(SurfaceOfSection {
                class,
                times,
                points,
                used_fallback: true,
            })
        }
        Err(other) => Err(other),
    }
}

const FALLBACK_SAMPLES_PER_PERIOD: usize = 128;

/// Time-domain fallback: march with fixed RK4 steps over at most `t_max`
/// time units, bracket upward sign changes of the section coordinate, and
/// polish each crossing with Newton iterations on q(t) (q-dot is just pq,
/// available for free). May find fewer than `n_crossings` within the bound.
#[allow(clippy::too_many_arguments)]
fn brute_force_crossings(
    class: PhaseClass,
    rect0: &[f64],
    epoch: f64,
    q_idx: usize,
    pq_idx: usize,
    n_crossings: usize,
    t_max: f64,
    pot: &dyn Potential,
) -> Result<(Vec<f64>, Vec<f64>)> {
    let field = RectOrbitField::new(class, pot);
    let dim = class.rect_dim();

    // Sampling interval from the local dynamical time.
    let (pos, vel) = class.rect_pos_vel(rect0);
    let omega_sq = pot.acceleration(&pos, &vel, epoch).norm() / pos.norm().max(1e-12);
    let t_dyn = if omega_sq > 0.0 && omega_sq.is_finite() {
        TAU / omega_sq.sqrt()
    } else {
        TAU
    };
    let dt = t_dyn / FALLBACK_SAMPLES_PER_PERIOD as f64;

    let mut rk4 = Rk4::new(dim);
    let mut t = epoch;
    let mut y = rect0.to_vec();
    let mut times = Vec::with_capacity(n_crossings);
    let mut points = Vec::with_capacity(n_crossings * class.ncoord());
    let n_samples = (t_max / dt).ceil() as usize;

    for _ in 0..n_samples {
        let t_prev = t;
        let y_prev = y.clone();
        rk4.step(&field, &mut t, &mut y, dt);
        if y.iter().any(|v| !v.is_finite()) {
            return Err(OrbitError::Divergence {
                last_time: t_prev,
                last_state: y_prev,
                reason: "trajectory diverged during section fallback".into(),
            });
        }

        // Upward zero crossing of q within this sample interval.
        if y_prev[q_idx] < 0.0 && y[q_idx] >= 0.0 {
            let frac = y_prev[q_idx] / (y_prev[q_idx] - y[q_idx]);
            let mut tc = t_prev + frac * dt;
            let mut yc = y_prev.clone();
            let mut tt = t_prev;
            rk4.step(&field, &mut tt, &mut yc, tc - t_prev);
            for _ in 0..3 {
                let correction = -yc[q_idx] / yc[pq_idx];
                if !correction.is_finite() || correction.abs() < 1e-15 {
                    break;
                }
                rk4.step(&field, &mut tt, &mut yc, correction);
                tc += correction;
            }
            if yc[pq_idx] > 0.0 {
                yc[q_idx] = 0.0;
                times.push(tc);
                points.extend_from_slice(&class.from_rect(&yc));
                if times.len() == n_crossings {
                    return Ok((times, points));
                }
            }
        }
    }

    // Ran out of time budget: in fallback mode the crossing count is
    // governed by the integration bound, not the request.
    Ok((times, points))
}
