use crate::error::{config_err, OrbitError, Result};
use crate::traits::Potential;
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

/// Dimensionality class of a phase-space state.
///
/// The azimuth component is optional for the planar and spatial classes;
/// tracking it changes the coordinate count and which diagnostics are
/// defined downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PhaseClass {
    /// (x, vx)
    Linear,
    /// (R, vR, vT[, phi])
    Planar { track_phi: bool },
    /// (R, vR, vT, z, vz[, phi])
    Spatial { track_phi: bool },
}

impl PhaseClass {
    /// Number of phase-space coordinates.
    pub fn ncoord(&self) -> usize {
        match self {
            PhaseClass::Linear => 2,
            PhaseClass::Planar { track_phi } => 3 + usize::from(*track_phi),
            PhaseClass::Spatial { track_phi } => 5 + usize::from(*track_phi),
        }
    }

    pub fn tracks_phi(&self) -> bool {
        matches!(
            self,
            PhaseClass::Planar { track_phi: true } | PhaseClass::Spatial { track_phi: true }
        )
    }

    /// Dimension of the rectangular state the integrator works in.
    pub fn rect_dim(&self) -> usize {
        match self {
            PhaseClass::Linear => 2,
            PhaseClass::Planar { .. } => 4,
            PhaseClass::Spatial { .. } => 6,
        }
    }

    /// Converts one phase-space point to the rectangular integration state.
    /// Untracked azimuth enters as zero.
    pub fn to_rect(&self, coords: &[f64]) -> Vec<f64> {
        match self {
            PhaseClass::Linear => vec![coords[0], coords[1]],
            PhaseClass::Planar { track_phi } => {
                let (r, vr, vt) = (coords[0], coords[1], coords[2]);
                let phi = if *track_phi { coords[3] } else { 0.0 };
                let (sin_phi, cos_phi) = phi.sin_cos();
                vec![
                    r * cos_phi,
                    r * sin_phi,
                    vr * cos_phi - vt * sin_phi,
                    vr * sin_phi + vt * cos_phi,
                ]
            }
            PhaseClass::Spatial { track_phi } => {
                let (r, vr, vt, z, vz) = (coords[0], coords[1], coords[2], coords[3], coords[4]);
                let phi = if *track_phi { coords[5] } else { 0.0 };
                let (sin_phi, cos_phi) = phi.sin_cos();
                vec![
                    r * cos_phi,
                    r * sin_phi,
                    z,
                    vr * cos_phi - vt * sin_phi,
                    vr * sin_phi + vt * cos_phi,
                    vz,
                ]
            }
        }
    }

    /// Converts a rectangular integration state back to phase-space
    /// coordinates. Untracked azimuth is dropped.
    pub fn from_rect(&self, rect: &[f64]) -> Vec<f64> {
        match self {
            PhaseClass::Linear => vec![rect[0], rect[1]],
            PhaseClass::Planar { track_phi } => {
                let (x, y, vx, vy) = (rect[0], rect[1], rect[2], rect[3]);
                let r = x.hypot(y);
                let vr = (x * vx + y * vy) / r;
                let vt = (x * vy - y * vx) / r;
                let mut out = vec![r, vr, vt];
                if *track_phi {
                    out.push(y.atan2(x));
                }
                out
            }
            PhaseClass::Spatial { track_phi } => {
                let (x, y, z, vx, vy, vz) =
                    (rect[0], rect[1], rect[2], rect[3], rect[4], rect[5]);
                let r = x.hypot(y);
                let vr = (x * vx + y * vy) / r;
                let vt = (x * vy - y * vx) / r;
                let mut out = vec![r, vr, vt, z, vz];
                if *track_phi {
                    out.push(y.atan2(x));
                }
                out
            }
        }
    }

    /// Splits a rectangular state into the 3-vectors the oracle consumes,
    /// padding unused components with zero.
    pub fn rect_pos_vel(&self, rect: &[f64]) -> (Vector3<f64>, Vector3<f64>) {
        match self {
            PhaseClass::Linear => (
                Vector3::new(rect[0], 0.0, 0.0),
                Vector3::new(rect[1], 0.0, 0.0),
            ),
            PhaseClass::Planar { .. } => (
                Vector3::new(rect[0], rect[1], 0.0),
                Vector3::new(rect[2], rect[3], 0.0),
            ),
            PhaseClass::Spatial { .. } => (
                Vector3::new(rect[0], rect[1], rect[2]),
                Vector3::new(rect[3], rect[4], rect[5]),
            ),
        }
    }
}

/// A strictly monotonic sequence of times at which state is recorded.
/// Descending grids request backward integration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeGrid {
    times: Vec<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

impl TimeGrid {
    pub fn new(times: Vec<f64>) -> Result<Self> {
        if times.iter().any(|t| !t.is_finite()) {
            return config_err("time grid contains a non-finite value");
        }
        if times.len() >= 2 {
            let ascending = times[1] > times[0];
            for pair in times.windows(2) {
                let ok = if ascending {
                    pair[1] > pair[0]
                } else {
                    pair[1] < pair[0]
                };
                if !ok {
                    return config_err("time grid must be strictly monotonic");
                }
            }
        }
        Ok(Self { times })
    }

    /// Uniform grid of `n` points over [start, end] inclusive. `end < start`
    /// produces a descending grid.
    pub fn linspace(start: f64, end: f64, n: usize) -> Result<Self> {
        if n == 0 {
            return Self::new(Vec::new());
        }
        if n == 1 {
            return Self::new(vec![start]);
        }
        let step = (end - start) / (n - 1) as f64;
        Self::new((0..n).map(|i| start + step * i as f64).collect())
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.times
    }

    /// Forward unless the grid is descending; single-point and empty grids
    /// count as forward.
    pub fn direction(&self) -> Direction {
        if self.times.len() >= 2 && self.times[1] < self.times[0] {
            Direction::Backward
        } else {
            Direction::Forward
        }
    }
}

/// One trajectory: an initial condition at an epoch, plus the recorded time
/// series once integrated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Orbit {
    class: PhaseClass,
    initial: Vec<f64>,
    epoch: f64,
    times: Vec<f64>,
    series: Vec<f64>,
    integrated: bool,
}

impl Orbit {
    fn new(class: PhaseClass, initial: Vec<f64>, epoch: f64) -> Self {
        Self {
            class,
            initial,
            epoch,
            times: Vec::new(),
            series: Vec::new(),
            integrated: false,
        }
    }

    pub fn class(&self) -> PhaseClass {
        self.class
    }

    pub fn initial(&self) -> &[f64] {
        &self.initial
    }

    pub fn epoch(&self) -> f64 {
        self.epoch
    }

    pub fn is_integrated(&self) -> bool {
        self.integrated
    }

    pub fn times(&self) -> &[f64] {
        &self.times
    }

    pub fn n_recorded(&self) -> usize {
        self.times.len()
    }

    /// Recorded phase-space point at grid index `i`.
    pub fn point(&self, i: usize) -> &[f64] {
        let n = self.class.ncoord();
        &self.series[i * n..(i + 1) * n]
    }

    /// Replaces the stored series. Used by the integration engine; a partial
    /// series (shorter than the grid) is what a diverged trajectory leaves
    /// behind.
    pub(crate) fn store_series(&mut self, times: Vec<f64>, series: Vec<f64>) {
        debug_assert_eq!(times.len() * self.class.ncoord(), series.len());
        self.times = times;
        self.series = series;
        self.integrated = true;
    }
}

/// A batch of independent trajectories sharing one dimensionality class.
///
/// The logical shape is separate from the flat storage order: `reshape`
/// touches only the shape descriptor, and `slice` copies the selected
/// trajectories together with any already-integrated history. A shape of
/// `[]` is a single trajectory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrbitBatch {
    class: PhaseClass,
    shape: Vec<usize>,
    orbits: Vec<Orbit>,
}

fn shape_len(shape: &[usize]) -> usize {
    shape.iter().product()
}

impl OrbitBatch {
    /// A single trajectory (shape `[]`).
    pub fn single(class: PhaseClass, point: &[f64], epoch: f64) -> Result<Self> {
        check_point(class, point)?;
        Ok(Self {
            class,
            shape: Vec::new(),
            orbits: vec![Orbit::new(class, point.to_vec(), epoch)],
        })
    }

    /// A rank-1 batch from a list of initial conditions.
    pub fn from_points(class: PhaseClass, points: &[Vec<f64>], epoch: f64) -> Result<Self> {
        for point in points {
            check_point(class, point)?;
        }
        Ok(Self {
            class,
            shape: vec![points.len()],
            orbits: points
                .iter()
                .map(|p| Orbit::new(class, p.clone(), epoch))
                .collect(),
        })
    }

    /// Broadcasts one initial condition into an arbitrary batch shape.
    pub fn broadcast(class: PhaseClass, point: &[f64], shape: &[usize], epoch: f64) -> Result<Self> {
        check_point(class, point)?;
        let n = shape_len(shape);
        Ok(Self {
            class,
            shape: shape.to_vec(),
            orbits: (0..n)
                .map(|_| Orbit::new(class, point.to_vec(), epoch))
                .collect(),
        })
    }

    pub fn class(&self) -> PhaseClass {
        self.class
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of trajectories in flat order.
    pub fn len(&self) -> usize {
        self.orbits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orbits.is_empty()
    }

    pub fn get(&self, flat_index: usize) -> &Orbit {
        &self.orbits[flat_index]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Orbit> {
        self.orbits.iter()
    }

    pub(crate) fn orbits_mut(&mut self) -> &mut [Orbit] {
        &mut self.orbits
    }

    /// Changes the logical shape without touching storage. The element count
    /// must be preserved; flat row-major ordering is.
    pub fn reshape(&mut self, shape: &[usize]) -> Result<()> {
        if shape_len(shape) != self.orbits.len() {
            return config_err(format!(
                "cannot reshape {} trajectories into shape {:?}",
                self.orbits.len(),
                shape
            ));
        }
        self.shape = shape.to_vec();
        Ok(())
    }

    /// A new rank-1 batch holding copies of the selected trajectories,
    /// history included.
    pub fn slice(&self, range: std::ops::Range<usize>) -> Result<Self> {
        if range.end > self.orbits.len() || range.start > range.end {
            return config_err(format!(
                "slice {:?} out of bounds for {} trajectories",
                range,
                self.orbits.len()
            ));
        }
        let orbits: Vec<Orbit> = self.orbits[range].to_vec();
        Ok(Self {
            class: self.class,
            shape: vec![orbits.len()],
            orbits,
        })
    }
}

fn check_point(class: PhaseClass, point: &[f64]) -> Result<()> {
    if point.len() != class.ncoord() {
        return config_err(format!(
            "phase-space point has {} coordinates, class {:?} needs {}",
            point.len(),
            class,
            class.ncoord()
        ));
    }
    if point.iter().any(|c| !c.is_finite()) {
        return config_err("phase-space point contains a non-finite coordinate");
    }
    Ok(())
}

/// Specific energy of a phase-space point. Requires the oracle to supply a
/// potential value.
pub fn energy(class: PhaseClass, point: &[f64], pot: &dyn Potential, t: f64) -> Result<f64> {
    let rect = class.to_rect(point);
    let (pos, vel) = class.rect_pos_vel(&rect);
    let phi = pot.value(&pos, t).ok_or_else(|| {
        OrbitError::Config("energy requires an oracle with a potential value".into())
    })?;
    Ok(0.5 * vel.norm_squared() + phi)
}

/// z component of the specific angular momentum, `R * vT`. Defined for the
/// planar and spatial classes.
pub fn angular_momentum_z(class: PhaseClass, point: &[f64]) -> Result<f64> {
    match class {
        PhaseClass::Linear => {
            config_err("angular momentum is undefined for the linear phase class")
        }
        PhaseClass::Planar { .. } | PhaseClass::Spatial { .. } => Ok(point[0] * point[2]),
    }
}
