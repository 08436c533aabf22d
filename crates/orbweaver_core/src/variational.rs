//! Variational-equation propagation: advances infinitesimal phase-space
//! displacements alongside a reference trajectory using the local force
//! Jacobian. Restricted to planar motion; the augmented system is
//! integrated in rectangular coordinates, where the flow is canonical and
//! the stacked Jacobian determinant of the flow map is exactly 1 for any
//! volume-preserving dynamics (Liouville).

use crate::error::{config_err, OrbitError, Result};
use crate::integrate::{drive_first_order, Method, StepControl};
use crate::phase::{PhaseClass, TimeGrid};
use crate::traits::{Potential, VectorField};
use nalgebra::{Matrix4, Vector3};

/// Coordinate convention for displacement vectors at entry and exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplacementCoords {
    /// (dR, dvR, dvT, dphi)
    Cylindrical,
    /// (dx, dy, dvx, dvy)
    Rectangular,
}

/// Evolved displacement vectors at each requested time.
#[derive(Debug, Clone)]
pub struct TangentSeries {
    times: Vec<f64>,
    /// Flat, row-major: [time][vector][component; 4].
    data: Vec<f64>,
    n_vectors: usize,
}

impl TangentSeries {
    pub fn times(&self) -> &[f64] {
        &self.times
    }

    pub fn n_vectors(&self) -> usize {
        self.n_vectors
    }

    pub fn tangent(&self, time_idx: usize, vec_idx: usize) -> &[f64] {
        let start = (time_idx * self.n_vectors + vec_idx) * 4;
        &self.data[start..start + 4]
    }

    /// Determinant of the flow-map Jacobian at `time_idx`, formed by
    /// stacking the four evolved images of a displacement basis as columns.
    /// Equals 1 to numerical tolerance for volume-preserving dynamics when
    /// the initial vectors were the standard basis.
    pub fn jacobian_det(&self, time_idx: usize) -> Result<f64> {
        if self.n_vectors != 4 {
            return config_err("the Jacobian determinant needs exactly 4 tangent vectors");
        }
        let mut m = Matrix4::zeros();
        for col in 0..4 {
            let v = self.tangent(time_idx, col);
            for row in 0..4 {
                m[(row, col)] = v[row];
            }
        }
        Ok(m.determinant())
    }
}

/// Linearized planar dynamics: base orbit plus m displacement 4-vectors.
/// Layout: [x, y, vx, vy, d1.., d2.., ...].
struct VariationalField<'a> {
    pot: &'a dyn Potential,
    n_vectors: usize,
}

impl VectorField for VariationalField<'_> {
    fn dim(&self) -> usize {
        4 + 4 * self.n_vectors
    }

    fn eval(&self, t: f64, y: &[f64], out: &mut [f64]) {
        let pos = Vector3::new(y[0], y[1], 0.0);
        let vel = Vector3::new(y[2], y[3], 0.0);
        let acc = self.pot.acceleration(&pos, &vel, t);
        out[0] = y[2];
        out[1] = y[3];
        out[2] = acc.x;
        out[3] = acc.y;

        // Acceleration Jacobian = -hessian; availability was checked before
        // integration started, a mid-flight None surfaces as divergence.
        let (jxx, jxy, jyx, jyy) = match self.pot.hessian(&pos, t) {
            Some(h) => (-h[(0, 0)], -h[(0, 1)], -h[(1, 0)], -h[(1, 1)]),
            None => (f64::NAN, f64::NAN, f64::NAN, f64::NAN),
        };
        for k in 0..self.n_vectors {
            let d = &y[4 + 4 * k..8 + 4 * k];
            let o = 4 + 4 * k;
            out[o] = d[2];
            out[o + 1] = d[3];
            out[o + 2] = jxx * d[0] + jxy * d[1];
            out[o + 3] = jyx * d[0] + jyy * d[1];
        }
    }
}

/// Maps a cylindrical displacement to rectangular at the given rectangular
/// planar state.
fn tangent_to_rect(rect: &[f64], d: &[f64]) -> [f64; 4] {
    let (x, y, vx, vy) = (rect[0], rect[1], rect[2], rect[3]);
    let r = x.hypot(y);
    let (cos_phi, sin_phi) = (x / r, y / r);
    let vr = vx * cos_phi + vy * sin_phi;
    let vt = -vx * sin_phi + vy * cos_phi;
    let (dr, dvr, dvt, dphi) = (d[0], d[1], d[2], d[3]);
    [
        cos_phi * dr - r * sin_phi * dphi,
        sin_phi * dr + r * cos_phi * dphi,
        cos_phi * dvr - sin_phi * dvt - (vr * sin_phi + vt * cos_phi) * dphi,
        sin_phi * dvr + cos_phi * dvt + (vr * cos_phi - vt * sin_phi) * dphi,
    ]
}

/// Inverse of [`tangent_to_rect`] at the same state.
fn tangent_to_cyl(rect: &[f64], d: &[f64]) -> [f64; 4] {
    let (x, y, vx, vy) = (rect[0], rect[1], rect[2], rect[3]);
    let r = x.hypot(y);
    let (cos_phi, sin_phi) = (x / r, y / r);
    let vr = vx * cos_phi + vy * sin_phi;
    let vt = -vx * sin_phi + vy * cos_phi;
    let (dx, dy, dvx, dvy) = (d[0], d[1], d[2], d[3]);
    let dphi = (cos_phi * dy - sin_phi * dx) / r;
    [
        cos_phi * dx + sin_phi * dy,
        cos_phi * dvx + sin_phi * dvy + vt * dphi,
        -sin_phi * dvx + cos_phi * dvy - vr * dphi,
        dphi,
    ]
}

/// Integrates a planar state together with one or more displacement
/// vectors, returning the evolved displacements at every grid time.
///
/// Requires an oracle that supplies second derivatives and one of the
/// Runge-Kutta-family methods; both are checked before any stepping.
#[allow(clippy::too_many_arguments)]
pub fn integrate_dxdv(
    class: PhaseClass,
    point: &[f64],
    tangents: &[Vec<f64>],
    grid: &TimeGrid,
    pot: &dyn Potential,
    method: Method,
    control: &StepControl,
    coords_in: DisplacementCoords,
    coords_out: DisplacementCoords,
) -> Result<TangentSeries> {
    if !matches!(class, PhaseClass::Planar { .. }) {
        return config_err("variational propagation is restricted to planar phase-space states");
    }
    if point.len() != class.ncoord() {
        return config_err("phase-space point does not match the declared class");
    }
    if tangents.is_empty() {
        return config_err("variational propagation needs at least one tangent vector");
    }
    for d in tangents {
        if d.len() != 4 || d.iter().any(|c| !c.is_finite()) {
            return config_err("tangent vectors must have 4 finite components");
        }
    }
    if method.is_symplectic() {
        return config_err(
            "variational propagation supports the Runge-Kutta-family methods only",
        );
    }

    let rect0 = class.to_rect(point);
    let epoch = grid.as_slice().first().copied().unwrap_or(0.0);
    let (pos0, _) = class.rect_pos_vel(&rect0);
    if pot.hessian(&pos0, epoch).is_none() {
        return Err(OrbitError::Config(
            "variational propagation requires an oracle with second derivatives".into(),
        ));
    }

    let n_vectors = tangents.len();
    let mut y0 = Vec::with_capacity(4 + 4 * n_vectors);
    y0.extend_from_slice(&rect0);
    for d in tangents {
        match coords_in {
            DisplacementCoords::Rectangular => y0.extend_from_slice(d),
            DisplacementCoords::Cylindrical => y0.extend_from_slice(&tangent_to_rect(&rect0, d)),
        }
    }

    let field = VariationalField { pot, n_vectors };
    let targets = grid.as_slice();
    let mut times = Vec::with_capacity(targets.len());
    let mut data = Vec::with_capacity(targets.len() * n_vectors * 4);
    let mut record = |_i: usize, tt: f64, y: &[f64]| {
        times.push(tt);
        for k in 0..n_vectors {
            let d = &y[4 + 4 * k..8 + 4 * k];
            match coords_out {
                DisplacementCoords::Rectangular => data.extend_from_slice(d),
                DisplacementCoords::Cylindrical => {
                    data.extend_from_slice(&tangent_to_cyl(&y[..4], d))
                }
            }
        }
    };
    drive_first_order(&field, epoch, &y0, targets, method, control, &mut record)?;

    Ok(TangentSeries {
        times,
        data,
        n_vectors,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::OrbitBatch;
    use crate::testutil::SphericalLogPotential;

    const PLANAR: PhaseClass = PhaseClass::Planar { track_phi: true };
    const POINT: [f64; 4] = [1.0, 0.1, 1.1, 0.0];

    fn basis() -> Vec<Vec<f64>> {
        (0..4)
            .map(|i| {
                let mut v = vec![0.0; 4];
                v[i] = 1.0;
                v
            })
            .collect()
    }

    fn tight() -> StepControl {
        StepControl {
            rtol: 1e-11,
            atol: 1e-11,
            ..StepControl::default()
        }
    }

    #[test]
    fn jacobian_determinant_is_unity_for_hamiltonian_flow() {
        // End-to-end: planar orbit, four unit tangent vectors, t in [0, 28].
        let pot = SphericalLogPotential::new(1.0, 0.0);
        let grid = TimeGrid::linspace(0.0, 28.0, 29).expect("grid");
        let series = integrate_dxdv(
            PLANAR,
            &POINT,
            &basis(),
            &grid,
            &pot,
            Method::DormandPrince54,
            &tight(),
            DisplacementCoords::Rectangular,
            DisplacementCoords::Rectangular,
        )
        .expect("variational integration");

        let det = series.jacobian_det(28).expect("det");
        assert!((det - 1.0).abs() < 1e-6, "det = {det}");
    }

    #[test]
    fn evolved_tangent_matches_finite_differences() {
        let pot = SphericalLogPotential::new(1.0, 0.0);
        let grid = TimeGrid::linspace(0.0, 5.0, 6).expect("grid");
        let d0 = vec![1e-5, 0.0, -3e-6, 2e-6];
        let series = integrate_dxdv(
            PLANAR,
            &POINT,
            &[d0.clone()],
            &grid,
            &pot,
            Method::DormandPrince54,
            &tight(),
            DisplacementCoords::Rectangular,
            DisplacementCoords::Rectangular,
        )
        .expect("variational integration");

        // Reference: central difference of two orbits displaced by +-d0 in
        // rectangular coordinates, which cancels the quadratic term of the
        // flow map and leaves the truncation well below the tolerance.
        let rect0 = PLANAR.to_rect(&POINT);
        let plus: Vec<f64> = rect0.iter().zip(&d0).map(|(a, b)| a + b).collect();
        let minus: Vec<f64> = rect0.iter().zip(&d0).map(|(a, b)| a - b).collect();

        let mut ahead = OrbitBatch::single(PLANAR, &PLANAR.from_rect(&plus), 0.0).expect("batch");
        let mut behind = OrbitBatch::single(PLANAR, &PLANAR.from_rect(&minus), 0.0).expect("batch");
        ahead
            .integrate(&grid, &pot, Method::DormandPrince54, &tight())
            .expect("plus");
        behind
            .integrate(&grid, &pot, Method::DormandPrince54, &tight())
            .expect("minus");

        let rect_a = PLANAR.to_rect(ahead.get(0).point(5));
        let rect_b = PLANAR.to_rect(behind.get(0).point(5));
        let fd: Vec<f64> = (0..4).map(|i| 0.5 * (rect_a[i] - rect_b[i])).collect();
        let scale = fd.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
        let evolved = series.tangent(5, 0);
        for i in 0..4 {
            assert!(
                (evolved[i] - fd[i]).abs() < 1e-4 * scale,
                "component {i}: tangent {} vs finite difference {}",
                evolved[i],
                fd[i]
            );
        }
    }

    #[test]
    fn harmonic_tangent_flow_is_closed_form() {
        // In the isotropic harmonic well every rectangular component obeys
        // x'' = -x, so a unit position displacement evolves to
        // (cos t, 0, -sin t, 0) exactly.
        let pot = crate::testutil::HarmonicPotential::new(1.0);
        let grid = TimeGrid::new(vec![0.0, 1.0]).expect("grid");
        let series = integrate_dxdv(
            PLANAR,
            &[1.0, 0.0, 1.0, 0.0],
            &[vec![1.0, 0.0, 0.0, 0.0]],
            &grid,
            &pot,
            Method::DormandPrince54,
            &tight(),
            DisplacementCoords::Rectangular,
            DisplacementCoords::Rectangular,
        )
        .expect("variational integration");

        let d = series.tangent(1, 0);
        let expected = [1.0_f64.cos(), 0.0, -1.0_f64.sin(), 0.0];
        for i in 0..4 {
            assert!(
                (d[i] - expected[i]).abs() < 1e-9,
                "component {i}: {} vs {}",
                d[i],
                expected[i]
            );
        }
    }

    #[test]
    fn cylindrical_transforms_invert_each_other() {
        let pot = SphericalLogPotential::new(1.0, 0.0);
        // Single-time grid at the epoch: entry and exit transforms are the
        // only operations applied.
        let grid = TimeGrid::new(vec![0.0]).expect("grid");
        let d0 = vec![0.1, -0.2, 0.3, 0.05];
        let series = integrate_dxdv(
            PLANAR,
            &[1.3, -0.2, 0.9, 0.4],
            &[d0.clone()],
            &grid,
            &pot,
            Method::Rk4Fixed,
            &StepControl::default(),
            DisplacementCoords::Cylindrical,
            DisplacementCoords::Cylindrical,
        )
        .expect("variational integration");
        let out = series.tangent(0, 0);
        for (a, b) in d0.iter().zip(out.iter()) {
            assert!((a - b).abs() < 1e-12, "{a} vs {b}");
        }
    }

    #[test]
    fn missing_second_derivatives_are_a_config_error() {
        struct ForceOnly;
        impl Potential for ForceOnly {
            fn acceleration(
                &self,
                pos: &nalgebra::Vector3<f64>,
                _vel: &nalgebra::Vector3<f64>,
                _t: f64,
            ) -> nalgebra::Vector3<f64> {
                -pos
            }
        }
        let grid = TimeGrid::linspace(0.0, 1.0, 2).expect("grid");
        let result = integrate_dxdv(
            PLANAR,
            &POINT,
            &basis(),
            &grid,
            &ForceOnly,
            Method::Rk4Fixed,
            &StepControl::default(),
            DisplacementCoords::Rectangular,
            DisplacementCoords::Rectangular,
        );
        assert!(matches!(result, Err(OrbitError::Config(_))));
    }

    #[test]
    fn spatial_states_are_rejected() {
        let pot = SphericalLogPotential::new(1.0, 0.0);
        let grid = TimeGrid::linspace(0.0, 1.0, 2).expect("grid");
        let result = integrate_dxdv(
            PhaseClass::Spatial { track_phi: true },
            &[1.0, 0.0, 1.0, 0.0, 0.0, 0.0],
            &basis(),
            &grid,
            &pot,
            Method::Rk4Fixed,
            &StepControl::default(),
            DisplacementCoords::Rectangular,
            DisplacementCoords::Rectangular,
        );
        assert!(matches!(result, Err(OrbitError::Config(_))));
    }
}
