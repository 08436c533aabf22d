//! Analytic orbit characterization without long integrations.
//!
//! The orbit is mapped into prolate spheroidal coordinates (u, v) with
//! focal distance delta, where R = delta sinh(u) sin(v) and
//! z = delta cosh(u) cos(v). Treating the potential as if it separated in
//! these coordinates decouples the u and v motions up to a third integral
//! that is fixed from the input phase-space point; the radial and vertical
//! turning points then follow from one-dimensional root-finding on the
//! effective momentum functions instead of from an orbit integration. Exact
//! for true Staeckel potentials and for midplane orbits in any
//! axisymmetric potential; a controlled approximation elsewhere.

use crate::error::{config_err, OrbitError, Result};
use crate::phase::{energy, OrbitBatch, PhaseClass};
use crate::traits::Potential;
use nalgebra::Vector3;
use rayon::prelude::*;
use std::f64::consts::FRAC_PI_2;
use tracing::warn;

/// Focal distance of the prolate spheroidal coordinate system.
#[derive(Debug, Clone, PartialEq)]
pub enum DeltaSpec {
    /// Estimate from the local second derivatives of the potential.
    Auto,
    /// Caller-supplied value, must be positive.
    Fixed(f64),
    /// One caller-supplied value per trajectory of a batch.
    PerPoint(Vec<f64>),
}

impl DeltaSpec {
    /// Resolves the focal-distance choice for trajectory `i` of `n`.
    fn for_point(&self, i: usize, n: usize) -> Result<ResolvedDelta> {
        match self {
            DeltaSpec::Auto => Ok(ResolvedDelta::Auto),
            DeltaSpec::Fixed(d) => Ok(ResolvedDelta::Fixed(*d)),
            DeltaSpec::PerPoint(values) => {
                if values.len() != n {
                    return config_err(format!(
                        "per-point focal distances have {} entries for {} trajectories",
                        values.len(),
                        n
                    ));
                }
                Ok(ResolvedDelta::Fixed(values[i]))
            }
        }
    }
}

/// Focal distance after per-point resolution.
enum ResolvedDelta {
    Auto,
    Fixed(f64),
}

/// Orbit extents from the Staeckel characterization.
#[derive(Debug, Clone, PartialEq)]
pub struct OrbitExtents {
    /// Pericenter cylindrical radius.
    pub rperi: f64,
    /// Apocenter cylindrical radius.
    pub rap: f64,
    /// Maximum excursion from the midplane.
    pub zmax: f64,
    /// Radial eccentricity, (rap - rperi) / (rap + rperi).
    pub ecc: f64,
    /// Focal distance actually used.
    pub delta: f64,
    /// True when the automatic focal-distance estimate was degenerate and
    /// the documented default of 0.45 R was used instead.
    pub delta_defaulted: bool,
}

/// Characterizes a spatial phase-space point: pericenter and apocenter
/// radius, maximum midplane excursion, and eccentricity.
///
/// Needs an oracle with a potential value; the automatic focal-distance
/// estimate additionally needs second derivatives. An orbit without an
/// outer radial turning point (unbound in this potential) is an
/// [`OrbitError::Analysis`] failure.
pub fn ecc_zmax_rperi_rap(
    class: PhaseClass,
    point: &[f64],
    t: f64,
    pot: &dyn Potential,
    delta_spec: DeltaSpec,
) -> Result<OrbitExtents> {
    characterize(class, point, t, pot, delta_spec.for_point(0, 1)?)
}

fn characterize(
    class: PhaseClass,
    point: &[f64],
    t: f64,
    pot: &dyn Potential,
    delta_spec: ResolvedDelta,
) -> Result<OrbitExtents> {
    if !matches!(class, PhaseClass::Spatial { .. }) {
        return config_err("orbit characterization needs a spatial phase-space state");
    }
    if point.len() != class.ncoord() || point.iter().any(|c| !c.is_finite()) {
        return config_err("phase-space point does not match the declared class");
    }
    let r = point[0];
    if r <= 0.0 {
        return config_err("orbit characterization needs a positive cylindrical radius");
    }
    let (vr, _vt) = (point[1], point[2]);
    let (mut z, mut vz) = (point[3], point[4]);
    // Midplane symmetry: fold to z >= 0.
    if z < 0.0 {
        z = -z;
        vz = -vz;
    }

    let e = energy(class, point, pot, t)?;
    let lz = point[0] * point[2];

    let (delta, delta_defaulted) = match delta_spec {
        ResolvedDelta::Fixed(d) => {
            if !d.is_finite() || d <= 0.0 {
                return config_err("the fixed focal distance must be positive and finite");
            }
            (d, false)
        }
        ResolvedDelta::Auto => estimate_delta(pot, r, z, t)?,
    };

    // Prolate spheroidal position from the focal distances.
    let d_near = (r * r + (z - delta) * (z - delta)).sqrt();
    let d_far = (r * r + (z + delta) * (z + delta)).sqrt();
    let u0 = (((d_near + d_far) / (2.0 * delta)).max(1.0)).acosh();
    let v0 = (((d_far - d_near) / (2.0 * delta)).clamp(-1.0, 1.0)).acos();

    let (sinh_u0, cosh_u0) = (u0.sinh(), u0.cosh());
    let (sin_v0, cos_v0) = v0.sin_cos();
    let pu0 = delta * (vr * cosh_u0 * sin_v0 + vz * sinh_u0 * cos_v0);
    let pv0 = delta * (vr * sinh_u0 * cos_v0 - vz * cosh_u0 * sin_v0);

    let two_delta_sq = 2.0 * delta * delta;
    let pot_uv = |u: f64, v: f64| -> f64 {
        let rr = delta * u.sinh() * v.sin();
        let zz = delta * u.cosh() * v.cos();
        pot.value(&Vector3::new(rr, 0.0, zz), t).unwrap_or(f64::NAN)
    };

    // Effective radial momentum squared over 2 delta^2, with the third
    // integral fixed so the input point is exactly on the curve.
    let sin2_v0 = sin_v0 * sin_v0;
    let raw_u = |u: f64| {
        let sh2 = u.sinh() * u.sinh();
        e * sh2 - (sh2 + sin2_v0) * pot_uv(u, v0) - lz * lz / (two_delta_sq * sh2)
    };
    let i3_u = pu0 * pu0 / two_delta_sq - raw_u(u0);
    let f_u = |u: f64| raw_u(u) + i3_u;

    let u_min = match bracket_down(&f_u, u0, 1e-10) {
        Some((lo, hi)) => brent(&f_u, lo, hi),
        // Reached the axis with momentum to spare: the orbit plunges
        // through the center.
        None => 0.0,
    };
    let u_max = match bracket_up(&f_u, u0, u0 + 20.0) {
        Some((lo, hi)) => brent(&f_u, lo, hi),
        None => {
            return Err(OrbitError::Analysis(
                "no outer radial turning point found; the orbit appears unbound".into(),
            ));
        }
    };

    // Effective vertical momentum squared over 2 delta^2 along v at u = u0.
    let sinh2_u0 = sinh_u0 * sinh_u0;
    let raw_v = |v: f64| {
        let s2 = v.sin() * v.sin();
        e * s2 - (sinh2_u0 + s2) * pot_uv(u0, v) - lz * lz / (two_delta_sq * s2)
    };
    let i3_v = pv0 * pv0 / two_delta_sq - raw_v(v0);
    let f_v = |v: f64| raw_v(v) + i3_v;

    let v_min = match bracket_down(&f_v, v0.min(FRAC_PI_2), 1e-10) {
        Some((lo, hi)) => brent(&f_v, lo, hi),
        // Polar orbit: no vertical turning point short of the axis.
        None => 0.0,
    };

    let rperi = delta * u_min.sinh();
    let rap = delta * u_max.sinh();
    // The maximum height is reached at the radial apocenter.
    let zmax = delta * u_max.cosh() * v_min.cos();
    let ecc = if rap + rperi > 0.0 {
        ((rap - rperi) / (rap + rperi)).max(0.0)
    } else {
        0.0
    };

    Ok(OrbitExtents {
        rperi,
        rap,
        zmax,
        ecc,
        delta,
        delta_defaulted,
    })
}

/// Characterizes every trajectory of a batch from its initial condition.
///
/// The per-trajectory work is independent and runs on the rayon pool;
/// failures are collected per trajectory without affecting siblings, except
/// for a malformed `DeltaSpec::PerPoint` length, which fails the whole call
/// before any work starts.
pub fn ecc_zmax_rperi_rap_batch(
    batch: &OrbitBatch,
    t: f64,
    pot: &dyn Potential,
    delta_spec: &DeltaSpec,
) -> Result<Vec<Result<OrbitExtents>>> {
    if let DeltaSpec::PerPoint(values) = delta_spec {
        if values.len() != batch.len() {
            return config_err(format!(
                "per-point focal distances have {} entries for {} trajectories",
                values.len(),
                batch.len()
            ));
        }
    }
    let class = batch.class();
    let n = batch.len();
    Ok((0..n)
        .into_par_iter()
        .map(|i| characterize(class, batch.get(i).initial(), t, pot, delta_spec.for_point(i, n)?))
        .collect())
}

/// Focal-distance estimate from the local shape of the potential,
/// delta^2 = z^2 - R^2 + (3R F_z - 3z F_R + Rz(Phi_RR - Phi_zz)) / Phi_Rz,
/// evaluated on the phi = 0 meridional slice. Exact for separable fields;
/// degenerate for spherical potentials and on the midplane, where it falls
/// back to 0.45 R.
fn estimate_delta(pot: &dyn Potential, r: f64, z: f64, t: f64) -> Result<(f64, bool)> {
    let pos = Vector3::new(r, 0.0, z);
    let hess = pot.hessian(&pos, t).ok_or_else(|| {
        OrbitError::Config(
            "automatic focal-distance estimation requires an oracle with second derivatives"
                .into(),
        )
    })?;
    let acc = pot.acceleration(&pos, &Vector3::zeros(), t);
    // F_R = acc.x, F_z = acc.z on this slice.
    let num = 3.0 * r * acc.z - 3.0 * z * acc.x + r * z * (hess[(0, 0)] - hess[(2, 2)]);
    let delta_sq = z * z - r * r + num / hess[(0, 2)];

    if delta_sq.is_finite() && delta_sq > 1e-12 * (r * r + z * z) {
        Ok((delta_sq.sqrt(), false))
    } else {
        warn!(delta_sq, "degenerate focal-distance estimate, using 0.45 R");
        Ok((0.45 * r, true))
    }
}

/// Walks down from `hi` (where f >= 0, the orbit side) in doubling steps
/// until f goes negative. Returns None when the floor is reached first.
fn bracket_down(f: &dyn Fn(f64) -> f64, start: f64, floor: f64) -> Option<(f64, f64)> {
    let mut hi = start;
    let mut h = 0.05 * start.clamp(1e-3, 1.0);
    loop {
        let lo = (hi - h).max(floor);
        if f(lo) < 0.0 {
            return Some((lo, hi));
        }
        if lo <= floor {
            return None;
        }
        hi = lo;
        h *= 2.0;
    }
}

/// Walks up from `lo` (where f >= 0) in doubling steps until f goes
/// negative. Returns None when `cap` is reached first.
fn bracket_up(f: &dyn Fn(f64) -> f64, start: f64, cap: f64) -> Option<(f64, f64)> {
    let mut lo = start;
    let mut h = 0.05 * start.clamp(1e-3, 1.0);
    loop {
        let hi = (lo + h).min(cap);
        if f(hi) < 0.0 {
            return Some((lo, hi));
        }
        if hi >= cap {
            return None;
        }
        lo = hi;
        h *= 2.0;
    }
}

/// Brent root-finding on a bracketing interval. If the endpoints turn out
/// not to straddle zero (possible through rounding at a grazing turning
/// point), the endpoint with the smaller magnitude is returned.
fn brent(f: &dyn Fn(f64) -> f64, mut a: f64, mut b: f64) -> f64 {
    let mut fa = f(a);
    let mut fb = f(b);
    if fa == 0.0 {
        return a;
    }
    if fb == 0.0 {
        return b;
    }
    if fa.signum() == fb.signum() {
        return if fa.abs() < fb.abs() { a } else { b };
    }
    let mut c = a;
    let mut fc = fa;
    let mut d = b - a;
    let mut e = d;
    for _ in 0..100 {
        if fb.abs() > fc.abs() {
            a = b;
            b = c;
            c = a;
            fa = fb;
            fb = fc;
            fc = fa;
        }
        let tol = 2.0 * f64::EPSILON * b.abs() + 1e-14;
        let m = 0.5 * (c - b);
        if m.abs() <= tol || fb == 0.0 {
            return b;
        }
        if e.abs() < tol || fa.abs() <= fb.abs() {
            d = m;
            e = m;
        } else {
            let s = fb / fa;
            let (mut p, mut q) = if a == c {
                // secant
                (2.0 * m * s, 1.0 - s)
            } else {
                // inverse quadratic interpolation
                let q = fa / fc;
                let rr = fb / fc;
                (
                    s * (2.0 * m * q * (q - rr) - (b - a) * (rr - 1.0)),
                    (q - 1.0) * (rr - 1.0) * (s - 1.0),
                )
            };
            if p > 0.0 {
                q = -q;
            } else {
                p = -p;
            }
            if 2.0 * p < (3.0 * m * q - (tol * q).abs()).min((e * q).abs()) {
                e = d;
                d = p / q;
            } else {
                d = m;
                e = m;
            }
        }
        a = b;
        fa = fb;
        b += if d.abs() > tol { d } else { tol * m.signum() };
        fb = f(b);
        if (fb > 0.0) == (fc > 0.0) {
            c = a;
            fc = fa;
            d = b - a;
            e = d;
        }
    }
    b
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrate::{Method, StepControl};
    use crate::phase::{OrbitBatch, TimeGrid};
    use crate::testutil::{PlummerPotential, SphericalLogPotential};
    use nalgebra::Matrix3;

    const SPATIAL: PhaseClass = PhaseClass::Spatial { track_phi: true };

    fn log_pot() -> SphericalLogPotential {
        SphericalLogPotential::new(1.0, 0.0)
    }

    fn measured_extents(point: &[f64], pot: &dyn Potential, t_end: f64, n: usize) -> (f64, f64, f64) {
        let mut batch = OrbitBatch::single(SPATIAL, point, 0.0).expect("batch");
        let grid = TimeGrid::linspace(0.0, t_end, n).expect("grid");
        let control = StepControl {
            rtol: 1e-10,
            atol: 1e-10,
            ..StepControl::default()
        };
        batch
            .integrate(&grid, pot, Method::DormandPrince54, &control)
            .expect("integrate");
        let orbit = batch.get(0);
        let mut rmin = f64::INFINITY;
        let mut rmax = 0.0_f64;
        let mut zmax = 0.0_f64;
        for i in 0..orbit.n_recorded() {
            let p = orbit.point(i);
            rmin = rmin.min(p[0]);
            rmax = rmax.max(p[0]);
            zmax = zmax.max(p[3].abs());
        }
        (rmin, rmax, zmax)
    }

    #[test]
    fn midplane_orbit_turning_points_are_exact() {
        // For z = vz = 0 the radial effective momentum is exact for any
        // focal distance; only root-finding and grid sampling limit the
        // comparison.
        let pot = log_pot();
        let point = [1.0, 0.1, 1.1, 0.0, 0.0, 0.0];
        let extents =
            ecc_zmax_rperi_rap(SPATIAL, &point, 0.0, &pot, DeltaSpec::Fixed(0.45)).expect("extents");
        let (rmin, rmax, _) = measured_extents(&point, &pot, 100.0, 4001);

        assert!((extents.rperi - rmin).abs() < 1e-3, "rperi {} vs {rmin}", extents.rperi);
        assert!((extents.rap - rmax).abs() < 1e-3, "rap {} vs {rmax}", extents.rap);
        let ecc_meas = (rmax - rmin) / (rmax + rmin);
        assert!((extents.ecc - ecc_meas).abs() < 1e-3);
        assert!(extents.zmax.abs() < 1e-6, "zmax = {}", extents.zmax);
        assert!(!extents.delta_defaulted);
    }

    #[test]
    fn circular_orbit_has_zero_eccentricity() {
        tracing_subscriber::fmt().with_test_writer().try_init().ok();
        // R = 1, vT = vc = v0: exactly circular in the log halo.
        let pot = log_pot();
        let extents = ecc_zmax_rperi_rap(
            SPATIAL,
            &[1.0, 0.0, 1.0, 0.0, 0.0, 0.0],
            0.0,
            &pot,
            DeltaSpec::Auto,
        )
        .expect("extents");

        assert!(extents.ecc < 1e-9, "ecc = {}", extents.ecc);
        assert!((extents.rap - extents.rperi).abs() < 1e-9);
        assert!(extents.zmax.abs() < 1e-6);
        // The spherical potential makes the automatic estimate degenerate.
        assert!(extents.delta_defaulted);
        assert!((extents.delta - 0.45).abs() < 1e-12);
    }

    #[test]
    fn three_dimensional_extents_track_the_integrated_orbit() {
        let pot = log_pot();
        let point = [1.0, 0.1, 1.1, 0.0, 0.1, 0.0];
        let extents =
            ecc_zmax_rperi_rap(SPATIAL, &point, 0.0, &pot, DeltaSpec::Auto).expect("extents");
        let (rmin, rmax, zmax) = measured_extents(&point, &pot, 200.0, 8001);

        assert!(
            (extents.rperi - rmin).abs() / rmin < 0.01,
            "rperi {} vs measured {rmin}",
            extents.rperi
        );
        assert!(
            (extents.rap - rmax).abs() / rmax < 0.01,
            "rap {} vs measured {rmax}",
            extents.rap
        );
        let ecc_meas = (rmax - rmin) / (rmax + rmin);
        assert!(
            (extents.ecc - ecc_meas).abs() < 0.01,
            "ecc {} vs measured {ecc_meas}",
            extents.ecc
        );
        assert!(
            (extents.zmax - zmax).abs() / zmax < 0.05,
            "zmax {} vs measured {zmax}",
            extents.zmax
        );
    }

    #[test]
    fn batch_characterization_collects_per_point_results() {
        let pot = log_pot();
        let points = vec![
            vec![1.0, 0.1, 1.1, 0.0, 0.1, 0.0],
            vec![1.0, 0.0, 1.0, 0.0, 0.0, 0.0],
        ];
        let batch = OrbitBatch::from_points(SPATIAL, &points, 0.0).expect("batch");
        let results = ecc_zmax_rperi_rap_batch(
            &batch,
            0.0,
            &pot,
            &DeltaSpec::PerPoint(vec![0.45, 0.45]),
        )
        .expect("batch characterization");
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(results[1].as_ref().expect("circular").ecc < 1e-9);

        // A malformed per-point length fails the whole call up front.
        let bad = ecc_zmax_rperi_rap_batch(&batch, 0.0, &pot, &DeltaSpec::PerPoint(vec![0.45]));
        assert!(matches!(bad, Err(OrbitError::Config(_))));
    }

    /// Point mass at the lower focus (0, 0, -1). Its potential separates in
    /// prolate spheroidal coordinates with foci at z = +-1, so the automatic
    /// estimate must recover delta = 1 without hitting the fallback.
    struct OffsetPointMass {
        gm: f64,
        focus_z: f64,
    }

    impl Potential for OffsetPointMass {
        fn acceleration(&self, pos: &Vector3<f64>, _vel: &Vector3<f64>, _t: f64) -> Vector3<f64> {
            let d = pos - Vector3::new(0.0, 0.0, self.focus_z);
            -d * (self.gm / d.norm_squared().powf(1.5))
        }

        fn value(&self, pos: &Vector3<f64>, _t: f64) -> Option<f64> {
            let d = pos - Vector3::new(0.0, 0.0, self.focus_z);
            Some(-self.gm / d.norm())
        }

        fn hessian(&self, pos: &Vector3<f64>, _t: f64) -> Option<Matrix3<f64>> {
            let d = pos - Vector3::new(0.0, 0.0, self.focus_z);
            let s = d.norm_squared();
            let mut h = Matrix3::identity() * (self.gm / s.powf(1.5));
            h -= d * d.transpose() * (3.0 * self.gm / s.powf(2.5));
            Some(h)
        }
    }

    #[test]
    fn auto_delta_recovers_the_focal_distance_of_a_separable_field() {
        let pot = OffsetPointMass {
            gm: 1.0,
            focus_z: -1.0,
        };
        let extents = ecc_zmax_rperi_rap(
            SPATIAL,
            &[1.0, 0.1, 0.6, 0.5, 0.1, 0.0],
            0.0,
            &pot,
            DeltaSpec::Auto,
        )
        .expect("extents");
        assert!(!extents.delta_defaulted);
        assert!(
            (extents.delta - 1.0).abs() < 1e-6,
            "delta = {}",
            extents.delta
        );
    }

    #[test]
    fn per_point_delta_resolves_for_a_single_point() {
        let pot = log_pot();
        let point = [1.0, 0.1, 1.1, 0.0, 0.0, 0.0];
        let per_point =
            ecc_zmax_rperi_rap(SPATIAL, &point, 0.0, &pot, DeltaSpec::PerPoint(vec![0.45]))
                .expect("extents");
        let fixed =
            ecc_zmax_rperi_rap(SPATIAL, &point, 0.0, &pot, DeltaSpec::Fixed(0.45)).expect("extents");
        assert_eq!(per_point, fixed);

        let bad = ecc_zmax_rperi_rap(
            SPATIAL,
            &point,
            0.0,
            &pot,
            DeltaSpec::PerPoint(vec![0.45, 0.45]),
        );
        assert!(matches!(bad, Err(OrbitError::Config(_))));
    }

    #[test]
    fn unbound_orbit_is_an_analysis_error() {
        let pot = PlummerPotential::new(1.0, 0.3);
        // E > 0 in a potential that vanishes at infinity.
        let result = ecc_zmax_rperi_rap(
            SPATIAL,
            &[1.0, 1.5, 0.8, 0.0, 0.2, 0.0],
            0.0,
            &pot,
            DeltaSpec::Fixed(0.45),
        );
        assert!(matches!(result, Err(OrbitError::Analysis(_))));
    }

    #[test]
    fn auto_delta_without_second_derivatives_is_a_config_error() {
        struct NoHessian;
        impl Potential for NoHessian {
            fn acceleration(
                &self,
                pos: &Vector3<f64>,
                _vel: &Vector3<f64>,
                _t: f64,
            ) -> Vector3<f64> {
                -pos
            }
            fn value(&self, pos: &Vector3<f64>, _t: f64) -> Option<f64> {
                Some(0.5 * pos.norm_squared())
            }
        }
        let result = ecc_zmax_rperi_rap(
            SPATIAL,
            &[1.0, 0.1, 1.1, 0.0, 0.1, 0.0],
            0.0,
            &NoHessian,
            DeltaSpec::Auto,
        );
        assert!(matches!(result, Err(OrbitError::Config(_))));
    }

    #[test]
    fn force_only_oracle_is_a_config_error() {
        struct ForceOnly;
        impl Potential for ForceOnly {
            fn acceleration(
                &self,
                pos: &Vector3<f64>,
                _vel: &Vector3<f64>,
                _t: f64,
            ) -> Vector3<f64> {
                -pos
            }
        }
        let result = ecc_zmax_rperi_rap(
            SPATIAL,
            &[1.0, 0.1, 1.1, 0.0, 0.1, 0.0],
            0.0,
            &ForceOnly,
            DeltaSpec::Fixed(0.45),
        );
        assert!(matches!(result, Err(OrbitError::Config(_))));
    }

    #[test]
    fn fixed_delta_must_be_positive() {
        let result = ecc_zmax_rperi_rap(
            SPATIAL,
            &[1.0, 0.1, 1.1, 0.0, 0.1, 0.0],
            0.0,
            &log_pot(),
            DeltaSpec::Fixed(-1.0),
        );
        assert!(matches!(result, Err(OrbitError::Config(_))));
    }
}
