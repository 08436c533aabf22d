use crate::traits::Potential;
use nalgebra::{Matrix3, Vector3};

/// An ordered sum of force contributors, itself a valid oracle.
///
/// Accelerations always sum. The scalar value and the second-derivative
/// matrix are only reported when *every* part supplies them; a single
/// force-only contributor makes the whole sum force-only, which downstream
/// capability checks then catch up front.
///
/// Composition is recursive: a `Composite` can contain other composites,
/// scaled wrappers, or a frame-force adapter.
pub struct Composite {
    parts: Vec<Box<dyn Potential + Send>>,
}

impl Composite {
    pub fn new(parts: Vec<Box<dyn Potential + Send>>) -> Self {
        Self { parts }
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn push(&mut self, part: Box<dyn Potential + Send>) {
        self.parts.push(part);
    }
}

impl Potential for Composite {
    fn acceleration(&self, pos: &Vector3<f64>, vel: &Vector3<f64>, t: f64) -> Vector3<f64> {
        let mut total = Vector3::zeros();
        for part in &self.parts {
            total += part.acceleration(pos, vel, t);
        }
        total
    }

    fn value(&self, pos: &Vector3<f64>, t: f64) -> Option<f64> {
        let mut total = 0.0;
        for part in &self.parts {
            total += part.value(pos, t)?;
        }
        Some(total)
    }

    fn hessian(&self, pos: &Vector3<f64>, t: f64) -> Option<Matrix3<f64>> {
        let mut total = Matrix3::zeros();
        for part in &self.parts {
            total += part.hessian(pos, t)?;
        }
        Some(total)
    }

    fn velocity_dependent(&self) -> bool {
        self.parts.iter().any(|p| p.velocity_dependent())
    }
}

/// A base oracle with a mutable amplitude scalar.
///
/// The amplitude multiplies the acceleration, value, and hessian uniformly.
/// Changing it requires `&mut`, while force queries take `&self`, so a batch
/// integration can never observe a mid-flight amplitude change from another
/// worker; to vary the amplitude across concurrent batches, clone the
/// wrapper (copy-on-write by construction).
#[derive(Clone)]
pub struct Scaled<P> {
    base: P,
    amplitude: f64,
}

impl<P: Potential> Scaled<P> {
    pub fn new(base: P, amplitude: f64) -> Self {
        Self { base, amplitude }
    }

    pub fn amplitude(&self) -> f64 {
        self.amplitude
    }

    pub fn set_amplitude(&mut self, amplitude: f64) {
        self.amplitude = amplitude;
    }

    pub fn base(&self) -> &P {
        &self.base
    }
}

impl<P: Potential> Potential for Scaled<P> {
    fn acceleration(&self, pos: &Vector3<f64>, vel: &Vector3<f64>, t: f64) -> Vector3<f64> {
        self.base.acceleration(pos, vel, t) * self.amplitude
    }

    fn value(&self, pos: &Vector3<f64>, t: f64) -> Option<f64> {
        self.base.value(pos, t).map(|v| v * self.amplitude)
    }

    fn hessian(&self, pos: &Vector3<f64>, t: f64) -> Option<Matrix3<f64>> {
        self.base.hessian(pos, t).map(|h| h * self.amplitude)
    }

    fn velocity_dependent(&self) -> bool {
        self.base.velocity_dependent()
    }
}
