//! The `orbweaver_core` crate is a trajectory propagation and analysis
//! engine for motion in externally supplied force fields.
//!
//! Key components:
//! - **Traits**: `Potential` (the force-field oracle) and `VectorField`
//!   (generic first-order dynamics for the RK-family kernels).
//! - **Phase**: phase-space dimensionality classes, time grids, and
//!   trajectory batches with shape semantics.
//! - **Integrate**: the batch integration engine with fixed-step
//!   symplectic, fixed-step Runge-Kutta, and adaptive dense-output
//!   methods.
//! - **Frames**: fictitious-force adapter for rotating and linearly
//!   accelerating reference frames.
//! - **Variational**: tangent-map propagation of phase-space
//!   displacements alongside a reference trajectory.
//! - **Section**: surface-of-section sampling through an angular
//!   reparameterization, with a brute-force fallback.
//! - **Staeckel**: analytic pericenter/apocenter/eccentricity estimates
//!   from a single phase-space point.

pub mod error;
pub mod frames;
pub mod integrate;
pub mod phase;
pub mod potential;
pub mod section;
pub mod staeckel;
pub(crate) mod solvers;
#[cfg(test)]
mod testutil;
pub mod traits;
pub mod variational;

pub use error::{OrbitError, Result};
