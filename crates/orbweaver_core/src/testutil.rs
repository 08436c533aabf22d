//! Concrete force fields used by the test suites. Force-field models are
//! external collaborators in the public API; these live here only so every
//! module can exercise the core against known dynamics.

use crate::traits::Potential;
use nalgebra::{Matrix3, Vector3};

/// Spherical logarithmic halo: Phi = (v0^2 / 2) ln(rc^2 + r^2).
/// Flat rotation curve, bound orbits at all energies.
pub struct SphericalLogPotential {
    v0_sq: f64,
    rc_sq: f64,
}

impl SphericalLogPotential {
    pub fn new(v0: f64, rc: f64) -> Self {
        Self {
            v0_sq: v0 * v0,
            rc_sq: rc * rc,
        }
    }
}

impl Potential for SphericalLogPotential {
    fn acceleration(&self, pos: &Vector3<f64>, _vel: &Vector3<f64>, _t: f64) -> Vector3<f64> {
        let s = self.rc_sq + pos.norm_squared();
        -pos * (self.v0_sq / s)
    }

    fn value(&self, pos: &Vector3<f64>, _t: f64) -> Option<f64> {
        Some(0.5 * self.v0_sq * (self.rc_sq + pos.norm_squared()).ln())
    }

    fn hessian(&self, pos: &Vector3<f64>, _t: f64) -> Option<Matrix3<f64>> {
        let s = self.rc_sq + pos.norm_squared();
        let mut h = Matrix3::identity() * (self.v0_sq / s);
        h -= pos * pos.transpose() * (2.0 * self.v0_sq / (s * s));
        Some(h)
    }
}

/// Plummer sphere: Phi = -GM / sqrt(r^2 + b^2).
pub struct PlummerPotential {
    gm: f64,
    b_sq: f64,
}

impl PlummerPotential {
    pub fn new(gm: f64, b: f64) -> Self {
        Self { gm, b_sq: b * b }
    }
}

impl Potential for PlummerPotential {
    fn acceleration(&self, pos: &Vector3<f64>, _vel: &Vector3<f64>, _t: f64) -> Vector3<f64> {
        let s = self.b_sq + pos.norm_squared();
        -pos * (self.gm / s.powf(1.5))
    }

    fn value(&self, pos: &Vector3<f64>, _t: f64) -> Option<f64> {
        Some(-self.gm / (self.b_sq + pos.norm_squared()).sqrt())
    }

    fn hessian(&self, pos: &Vector3<f64>, _t: f64) -> Option<Matrix3<f64>> {
        let s = self.b_sq + pos.norm_squared();
        let mut h = Matrix3::identity() * (self.gm / s.powf(1.5));
        h -= pos * pos.transpose() * (3.0 * self.gm / s.powf(2.5));
        Some(h)
    }
}

/// Isotropic harmonic well: Phi = omega^2 r^2 / 2. Closed-form orbits,
/// handy for exact checks.
pub struct HarmonicPotential {
    omega_sq: f64,
}

impl HarmonicPotential {
    pub fn new(omega: f64) -> Self {
        Self {
            omega_sq: omega * omega,
        }
    }
}

impl Potential for HarmonicPotential {
    fn acceleration(&self, pos: &Vector3<f64>, _vel: &Vector3<f64>, _t: f64) -> Vector3<f64> {
        -pos * self.omega_sq
    }

    fn value(&self, pos: &Vector3<f64>, _t: f64) -> Option<f64> {
        Some(0.5 * self.omega_sq * pos.norm_squared())
    }

    fn hessian(&self, _pos: &Vector3<f64>, _t: f64) -> Option<Matrix3<f64>> {
        Some(Matrix3::identity() * self.omega_sq)
    }
}
