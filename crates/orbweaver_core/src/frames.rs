use crate::error::{config_err, Result};
use crate::traits::Potential;
use nalgebra::{Matrix3, Vector3};

/// Rotation frequency of the integration frame: constant, or a function of
/// time returning both the frequency and its time derivative.
pub enum Rotation {
    Constant(Vector3<f64>),
    TimeDependent(Box<dyn Fn(f64) -> (Vector3<f64>, Vector3<f64>) + Sync + Send>),
}

impl Rotation {
    fn at(&self, t: f64) -> (Vector3<f64>, Vector3<f64>) {
        match self {
            Rotation::Constant(omega) => (*omega, Vector3::zeros()),
            Rotation::TimeDependent(f) => f(t),
        }
    }
}

/// Acceleration of the frame origin: constant, or a function of time.
pub enum OriginAcceleration {
    Constant(Vector3<f64>),
    TimeDependent(Box<dyn Fn(f64) -> Vector3<f64> + Sync + Send>),
}

impl OriginAcceleration {
    fn at(&self, t: f64) -> Vector3<f64> {
        match self {
            OriginAcceleration::Constant(a) => *a,
            OriginAcceleration::TimeDependent(f) => f(t),
        }
    }
}

/// Wraps a base oracle with the fictitious forces of a rotating and/or
/// accelerating frame. The wrapped oracle is queried in the frame's own
/// coordinates; the integration engine stays frame-agnostic.
///
/// Time-dependent rotation and acceleration functions are invoked once per
/// force evaluation, which for an adaptive integrator can mean thousands of
/// calls per time unit. Pre-tabulate expensive functions and wrap a cheap
/// interpolant instead.
pub struct NonInertialFrame<P> {
    base: P,
    rotation: Option<Rotation>,
    origin_acceleration: Option<OriginAcceleration>,
}

impl<P: Potential> NonInertialFrame<P> {
    /// Fails if neither rotation nor origin acceleration is supplied: the
    /// adapter would be a no-op, which signals a caller mistake.
    pub fn new(
        base: P,
        rotation: Option<Rotation>,
        origin_acceleration: Option<OriginAcceleration>,
    ) -> Result<Self> {
        if rotation.is_none() && origin_acceleration.is_none() {
            return config_err(
                "non-inertial frame needs a rotation or an origin acceleration; \
                 for an inertial frame use the base oracle directly",
            );
        }
        Ok(Self {
            base,
            rotation,
            origin_acceleration,
        })
    }

    pub fn rotating(base: P, omega: Vector3<f64>) -> Result<Self> {
        Self::new(base, Some(Rotation::Constant(omega)), None)
    }

    pub fn base(&self) -> &P {
        &self.base
    }
}

impl<P: Potential> Potential for NonInertialFrame<P> {
    fn acceleration(&self, pos: &Vector3<f64>, vel: &Vector3<f64>, t: f64) -> Vector3<f64> {
        let mut accel = self.base.acceleration(pos, vel, t);
        if let Some(rotation) = &self.rotation {
            let (omega, omega_dot) = rotation.at(t);
            // centrifugal, Coriolis, Euler
            accel -= omega.cross(&omega.cross(pos));
            accel -= omega.cross(vel) * 2.0;
            accel -= omega_dot.cross(pos);
        }
        if let Some(origin) = &self.origin_acceleration {
            accel -= origin.at(t);
        }
        accel
    }

    fn value(&self, pos: &Vector3<f64>, t: f64) -> Option<f64> {
        // The Jacobi-style effective potential in a rotating frame depends
        // on velocity through the Coriolis term and is not a plain scalar
        // field; only the pure linearly-accelerating case keeps one.
        if self.rotation.is_some() {
            return None;
        }
        let base = self.base.value(pos, t)?;
        match &self.origin_acceleration {
            Some(origin) => Some(base + origin.at(t).dot(pos)),
            None => Some(base),
        }
    }

    fn hessian(&self, pos: &Vector3<f64>, t: f64) -> Option<Matrix3<f64>> {
        // The Coriolis force is velocity-dependent; the positional
        // variational equations do not apply in a rotating frame.
        if self.rotation.is_some() {
            return None;
        }
        // The linear term is position-independent.
        self.base.hessian(pos, t)
    }

    fn velocity_dependent(&self) -> bool {
        // The Coriolis term reads the velocity.
        self.rotation.is_some() || self.base.velocity_dependent()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::SphericalLogPotential;

    #[test]
    fn degenerate_frame_is_a_config_error() {
        let result = NonInertialFrame::new(SphericalLogPotential::new(1.0, 0.0), None, None);
        assert!(result.is_err());
    }

    #[test]
    fn rotating_frame_adds_centrifugal_and_coriolis_terms() {
        let omega = Vector3::new(0.0, 0.0, 0.5);
        let frame =
            NonInertialFrame::rotating(SphericalLogPotential::new(1.0, 0.0), omega).expect("frame");

        let pos = Vector3::new(1.0, 0.0, 0.0);
        let vel = Vector3::new(0.0, 1.0, 0.0);
        let base = frame.base().acceleration(&pos, &vel, 0.0);
        let total = frame.acceleration(&pos, &vel, 0.0);
        let fict = total - base;

        // centrifugal: -Omega x (Omega x r) = omega^2 * r (outward)
        // Coriolis: -2 Omega x v = -2*0.5*(z_hat x y_hat*1) = +1.0 x_hat
        let expected = Vector3::new(0.25 + 1.0, 0.0, 0.0);
        assert!((fict - expected).norm() < 1e-14, "fictitious = {fict:?}");
    }

    #[test]
    fn euler_term_uses_the_frequency_derivative() {
        let rotation = Rotation::TimeDependent(Box::new(|t| {
            (
                Vector3::new(0.0, 0.0, 0.1 * t),
                Vector3::new(0.0, 0.0, 0.1),
            )
        }));
        let frame =
            NonInertialFrame::new(SphericalLogPotential::new(1.0, 0.0), Some(rotation), None)
                .expect("frame");

        // At t = 0 the frequency vanishes; only the Euler term survives.
        let pos = Vector3::new(1.0, 0.0, 0.0);
        let vel = Vector3::zeros();
        let base = frame.base().acceleration(&pos, &vel, 0.0);
        let fict = frame.acceleration(&pos, &vel, 0.0) - base;
        // -dOmega/dt x r = -0.1 z_hat x x_hat = -0.1 y_hat
        assert!((fict - Vector3::new(0.0, -0.1, 0.0)).norm() < 1e-14);
    }

    #[test]
    fn linear_acceleration_shifts_the_force_uniformly() {
        let a0 = Vector3::new(0.0, 0.0, 0.02);
        let frame = NonInertialFrame::new(
            SphericalLogPotential::new(1.0, 0.0),
            None,
            Some(OriginAcceleration::Constant(a0)),
        )
        .expect("frame");
        let pos = Vector3::new(0.3, -0.4, 1.2);
        let vel = Vector3::zeros();
        let fict = frame.acceleration(&pos, &vel, 0.0) - frame.base().acceleration(&pos, &vel, 0.0);
        assert!((fict + a0).norm() < 1e-15);
    }

    #[test]
    fn rotating_frame_reports_no_hessian() {
        let frame =
            NonInertialFrame::rotating(SphericalLogPotential::new(1.0, 0.0), Vector3::z() * 0.3)
                .expect("frame");
        assert!(frame.hessian(&Vector3::new(1.0, 0.0, 0.0), 0.0).is_none());
    }
}
