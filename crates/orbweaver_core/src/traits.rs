use nalgebra::{Matrix3, Vector3};

/// The gravitational force-field oracle.
///
/// A `Potential` answers force queries in rectangular Galactocentric
/// coordinates and natural units. The velocity is passed to every query so
/// that velocity-dependent forces (fictitious frame forces, drag-like terms)
/// compose through the same interface; conservative fields ignore it.
///
/// `value` and `hessian` are optional capabilities. Energy diagnostics need
/// `value`; the variational propagator and the automatic focal-length
/// estimate need `hessian`. Callers that require a capability must check for
/// `None` *before* starting any numerical work.
///
/// Implementations must be `Sync`: a batch integration queries one shared
/// oracle from many worker threads, and no query may mutate shared state.
pub trait Potential: Sync {
    /// Acceleration at `pos` moving with `vel` at time `t`.
    fn acceleration(&self, pos: &Vector3<f64>, vel: &Vector3<f64>, t: f64) -> Vector3<f64>;

    /// Scalar potential value, if the model supplies one.
    fn value(&self, _pos: &Vector3<f64>, _t: f64) -> Option<f64> {
        None
    }

    /// Second derivatives d2Phi/dxi dxj of the scalar potential, if the
    /// model supplies them. The acceleration Jacobian is the negation.
    fn hessian(&self, _pos: &Vector3<f64>, _t: f64) -> Option<Matrix3<f64>> {
        None
    }

    /// Whether the force depends on the queried velocity. Symplectic
    /// kick-drift splittings evaluate forces at positions only and refuse
    /// velocity-dependent oracles up front.
    fn velocity_dependent(&self) -> bool {
        false
    }

    /// Vectorized query. The default loops; models backed by tabulated data
    /// may override with something better.
    fn acceleration_many(
        &self,
        pos: &[Vector3<f64>],
        vel: &[Vector3<f64>],
        t: f64,
    ) -> Vec<Vector3<f64>> {
        pos.iter()
            .zip(vel.iter())
            .map(|(p, v)| self.acceleration(p, v, t))
            .collect()
    }
}

impl<P: Potential + ?Sized> Potential for &P {
    fn acceleration(&self, pos: &Vector3<f64>, vel: &Vector3<f64>, t: f64) -> Vector3<f64> {
        (**self).acceleration(pos, vel, t)
    }

    fn value(&self, pos: &Vector3<f64>, t: f64) -> Option<f64> {
        (**self).value(pos, t)
    }

    fn hessian(&self, pos: &Vector3<f64>, t: f64) -> Option<Matrix3<f64>> {
        (**self).hessian(pos, t)
    }

    fn velocity_dependent(&self) -> bool {
        (**self).velocity_dependent()
    }
}

/// A first-order ODE right-hand side, y' = f(t, y).
///
/// This is the seam between the step kernels and everything built on top of
/// them: the orbit equations of motion, the variational (tangent) system,
/// and the angle-reparameterized surface-of-section system all present
/// themselves to the solvers through this trait.
pub trait VectorField {
    /// Dimension of the state vector.
    fn dim(&self) -> usize;

    /// Evaluates the right-hand side at (`t`, `y`) into `out`.
    fn eval(&self, t: f64, y: &[f64], out: &mut [f64]);
}
