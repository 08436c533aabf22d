//! Step kernels. Everything here advances a state by exactly one step (or
//! attempts to); step-size selection, output grids, and divergence policy
//! live in the integration driver.

use crate::traits::VectorField;

/// A second-order system split into positions and velocities, as the
/// symplectic kernels need it: the kick only ever queries the force at a
/// position, so these kernels require velocity-independent forces.
pub(crate) trait AccelField {
    fn half_dim(&self) -> usize;
    fn accel(&self, t: f64, q: &[f64], out: &mut [f64]);
}

/// Velocity-Verlet / leapfrog in kick-drift-kick form, plus the Yoshida
/// compositions built from it. Volume-preserving to floating-point
/// precision; energy error stays bounded instead of drifting.
pub(crate) struct KickDriftKick {
    acc: Vec<f64>,
}

/// Forest-Ruth 4th-order composition coefficient: 1 / (2 - 2^(1/3)).
const FR_THETA: f64 = 1.351_207_191_959_657_8;

/// Yoshida (1990) 6th-order solution-A coefficients.
const Y6_W1: f64 = -1.177_679_984_178_87;
const Y6_W2: f64 = 0.235_573_213_359_357;
const Y6_W3: f64 = 0.784_513_610_477_560;
const Y6_W0: f64 = 1.0 - 2.0 * (Y6_W1 + Y6_W2 + Y6_W3);

pub(crate) const LEAPFROG_WEIGHTS: [f64; 1] = [1.0];
pub(crate) const SYMPLEC4_WEIGHTS: [f64; 3] = [FR_THETA, 1.0 - 2.0 * FR_THETA, FR_THETA];
pub(crate) const SYMPLEC6_WEIGHTS: [f64; 7] =
    [Y6_W3, Y6_W2, Y6_W1, Y6_W0, Y6_W1, Y6_W2, Y6_W3];

impl KickDriftKick {
    pub fn new(half_dim: usize) -> Self {
        Self {
            acc: vec![0.0; half_dim],
        }
    }

    /// One 2nd-order leapfrog sub-step of size dt.
    fn step2(&mut self, field: &dyn AccelField, t: &mut f64, q: &mut [f64], v: &mut [f64], dt: f64) {
        let half = 0.5 * dt;
        field.accel(*t, q, &mut self.acc);
        for i in 0..v.len() {
            v[i] += half * self.acc[i];
        }
        for i in 0..q.len() {
            q[i] += dt * v[i];
        }
        field.accel(*t + dt, q, &mut self.acc);
        for i in 0..v.len() {
            v[i] += half * self.acc[i];
        }
        *t += dt;
    }

    /// One full step as a weighted composition of leapfrog sub-steps.
    /// `[1.0]` is plain leapfrog; the Forest-Ruth and Yoshida weight tables
    /// give the 4th- and 6th-order schemes.
    pub fn step(
        &mut self,
        field: &dyn AccelField,
        t: &mut f64,
        q: &mut [f64],
        v: &mut [f64],
        dt: f64,
        weights: &[f64],
    ) {
        for &w in weights {
            self.step2(field, t, q, v, w * dt);
        }
    }
}

/// Classic Runge-Kutta 4th order.
pub(crate) struct Rk4 {
    k1: Vec<f64>,
    k2: Vec<f64>,
    k3: Vec<f64>,
    k4: Vec<f64>,
    tmp: Vec<f64>,
}

impl Rk4 {
    pub fn new(dim: usize) -> Self {
        Self {
            k1: vec![0.0; dim],
            k2: vec![0.0; dim],
            k3: vec![0.0; dim],
            k4: vec![0.0; dim],
            tmp: vec![0.0; dim],
        }
    }

    pub fn step(&mut self, field: &dyn VectorField, t: &mut f64, y: &mut [f64], dt: f64) {
        let t0 = *t;
        let n = y.len();

        field.eval(t0, y, &mut self.k1);
        for i in 0..n {
            self.tmp[i] = y[i] + 0.5 * dt * self.k1[i];
        }
        field.eval(t0 + 0.5 * dt, &self.tmp, &mut self.k2);
        for i in 0..n {
            self.tmp[i] = y[i] + 0.5 * dt * self.k2[i];
        }
        field.eval(t0 + 0.5 * dt, &self.tmp, &mut self.k3);
        for i in 0..n {
            self.tmp[i] = y[i] + dt * self.k3[i];
        }
        field.eval(t0 + dt, &self.tmp, &mut self.k4);

        for i in 0..n {
            y[i] += dt / 6.0 * (self.k1[i] + 2.0 * self.k2[i] + 2.0 * self.k3[i] + self.k4[i]);
        }
        *t = t0 + dt;
    }
}

/// Gragg's modified midpoint rule with `n` sub-steps over one interval of
/// size `h`. Even error expansion, so Richardson extrapolation gains two
/// orders per level.
fn modified_midpoint(
    field: &dyn VectorField,
    t: f64,
    y: &[f64],
    h: f64,
    n: usize,
    out: &mut [f64],
) {
    let dim = y.len();
    let hs = h / n as f64;
    let mut z_prev = y.to_vec();
    let mut z_cur = vec![0.0; dim];
    let mut deriv = vec![0.0; dim];

    field.eval(t, y, &mut deriv);
    for i in 0..dim {
        z_cur[i] = y[i] + hs * deriv[i];
    }
    for m in 1..n {
        field.eval(t + m as f64 * hs, &z_cur, &mut deriv);
        for i in 0..dim {
            let next = z_prev[i] + 2.0 * hs * deriv[i];
            z_prev[i] = z_cur[i];
            z_cur[i] = next;
        }
    }
    field.eval(t + h, &z_cur, &mut deriv);
    for i in 0..dim {
        out[i] = 0.5 * (z_cur[i] + z_prev[i] + hs * deriv[i]);
    }
}

/// Richardson-extrapolated midpoint over the sub-step sequence `seq`.
/// Returns the top-level extrapolant in `out` and, when `err` is given, the
/// difference between the last two extrapolation columns as an error
/// estimate.
fn extrapolated_midpoint(
    field: &dyn VectorField,
    t: f64,
    y: &[f64],
    h: f64,
    seq: &[usize],
    out: &mut [f64],
    mut err: Option<&mut [f64]>,
) {
    let dim = y.len();
    let levels = seq.len();
    // table[j] holds T[i][j] for the current row i (Neville in h^2).
    let mut table: Vec<Vec<f64>> = vec![vec![0.0; dim]; levels];
    let mut row = vec![0.0; dim];

    for i in 0..levels {
        modified_midpoint(field, t, y, h, seq[i], &mut row);
        for j in 1..=i {
            let ratio = (seq[i] as f64 / seq[i - j] as f64).powi(2) - 1.0;
            for k in 0..dim {
                let diff = row[k] - table[j - 1][k];
                table[j - 1][k] = row[k];
                row[k] += diff / ratio;
            }
        }
        table[i].copy_from_slice(&row);
        if i == levels - 1 {
            if let Some(err) = err.as_deref_mut() {
                // row = T[last][last], table[levels-2] = T[last][last-1]
                for k in 0..dim {
                    err[k] = row[k] - table[levels - 2][k];
                }
            }
            out.copy_from_slice(&row);
        }
    }
}

/// Fixed-cost 6th-order scheme: extrapolated midpoint over {2, 4, 6}.
pub(crate) struct Extrapolated6;

impl Extrapolated6 {
    pub fn step(field: &dyn VectorField, t: &mut f64, y: &mut [f64], dt: f64) {
        let mut out = vec![0.0; y.len()];
        extrapolated_midpoint(field, *t, y, dt, &[2, 4, 6], &mut out, None);
        y.copy_from_slice(&out);
        *t += dt;
    }
}

/// Weighted RMS error norm used by both adaptive kernels.
fn error_norm(err: &[f64], y0: &[f64], y1: &[f64], rtol: f64, atol: f64) -> f64 {
    let mut sum = 0.0;
    for i in 0..err.len() {
        let sc = atol + rtol * y0[i].abs().max(y1[i].abs());
        let e = err[i] / sc;
        sum += e * e;
    }
    (sum / err.len() as f64).sqrt()
}

/// An embedded / error-estimating kernel the adaptive driver can run.
///
/// Protocol: `attempt` proposes a step and returns the scaled error norm
/// (accept when <= 1). After accepting, the driver calls `prepare_dense`
/// once and may then call `interpolate` for any fraction of that step.
pub(crate) trait EmbeddedStep {
    /// 1 / (q + 1) where q is the order used for step-size control.
    fn error_exponent(&self) -> f64;

    fn attempt(
        &mut self,
        field: &dyn VectorField,
        t: f64,
        y: &[f64],
        h: f64,
        out: &mut [f64],
        rtol: f64,
        atol: f64,
    ) -> f64;

    fn prepare_dense(&mut self, field: &dyn VectorField, t: f64, y0: &[f64], y1: &[f64], h: f64);

    /// State at `t + theta * h` of the last prepared step, `theta` in [0, 1].
    fn interpolate(&self, field: &dyn VectorField, theta: f64, out: &mut [f64]);
}

/// Dormand-Prince 5(4) embedded pair with the Hairer-Norsett-Wanner
/// 4th-order continuous extension.
pub(crate) struct DormandPrince54 {
    k: [Vec<f64>; 7],
    tmp: Vec<f64>,
    rcont: [Vec<f64>; 5],
}

// Butcher tableau.
const DP_C: [f64; 6] = [0.2, 0.3, 0.8, 8.0 / 9.0, 1.0, 1.0];
const DP_A2: [f64; 1] = [0.2];
const DP_A3: [f64; 2] = [3.0 / 40.0, 9.0 / 40.0];
const DP_A4: [f64; 3] = [44.0 / 45.0, -56.0 / 15.0, 32.0 / 9.0];
const DP_A5: [f64; 4] = [
    19372.0 / 6561.0,
    -25360.0 / 2187.0,
    64448.0 / 6561.0,
    -212.0 / 729.0,
];
const DP_A6: [f64; 5] = [
    9017.0 / 3168.0,
    -355.0 / 33.0,
    46732.0 / 5247.0,
    49.0 / 176.0,
    -5103.0 / 18656.0,
];
const DP_A7: [f64; 6] = [
    35.0 / 384.0,
    0.0,
    500.0 / 1113.0,
    125.0 / 192.0,
    -2187.0 / 6784.0,
    11.0 / 84.0,
];
// 4th-order weights of the embedded solution.
const DP_B4: [f64; 7] = [
    5179.0 / 57600.0,
    0.0,
    7571.0 / 16695.0,
    393.0 / 640.0,
    -92097.0 / 339200.0,
    187.0 / 2100.0,
    1.0 / 40.0,
];
// Dense-output coefficients.
const DP_D: [f64; 7] = [
    -12715105075.0 / 11282082432.0,
    0.0,
    87487479700.0 / 32700410799.0,
    -10690763975.0 / 1880347072.0,
    701980252875.0 / 199316789632.0,
    -1453857185.0 / 822651844.0,
    69997945.0 / 29380423.0,
];

impl DormandPrince54 {
    pub fn new(dim: usize) -> Self {
        Self {
            k: std::array::from_fn(|_| vec![0.0; dim]),
            tmp: vec![0.0; dim],
            rcont: std::array::from_fn(|_| vec![0.0; dim]),
        }
    }

    fn stage(&mut self, field: &dyn VectorField, t: f64, y: &[f64], h: f64, s: usize, a: &[f64]) {
        for i in 0..y.len() {
            let mut acc = 0.0;
            for (j, &aj) in a.iter().enumerate() {
                acc += aj * self.k[j][i];
            }
            self.tmp[i] = y[i] + h * acc;
        }
        field.eval(t + DP_C[s - 1] * h, &self.tmp, &mut self.k[s]);
    }
}

impl EmbeddedStep for DormandPrince54 {
    fn error_exponent(&self) -> f64 {
        0.2
    }

    fn attempt(
        &mut self,
        field: &dyn VectorField,
        t: f64,
        y: &[f64],
        h: f64,
        out: &mut [f64],
        rtol: f64,
        atol: f64,
    ) -> f64 {
        let n = y.len();
        field.eval(t, y, &mut self.k[0]);
        self.stage(field, t, y, h, 1, &DP_A2);
        self.stage(field, t, y, h, 2, &DP_A3);
        self.stage(field, t, y, h, 3, &DP_A4);
        self.stage(field, t, y, h, 4, &DP_A5);
        self.stage(field, t, y, h, 5, &DP_A6);

        // 5th-order solution (the a7 row doubles as b).
        for i in 0..n {
            let mut acc = 0.0;
            for (j, &bj) in DP_A7.iter().enumerate() {
                acc += bj * self.k[j][i];
            }
            out[i] = y[i] + h * acc;
        }
        field.eval(t + h, out, &mut self.k[6]);

        // Error = difference against the embedded 4th-order weights.
        let mut err = vec![0.0; n];
        for i in 0..n {
            let mut acc = 0.0;
            for j in 0..6 {
                acc += (DP_A7[j] - DP_B4[j]) * self.k[j][i];
            }
            acc -= DP_B4[6] * self.k[6][i];
            err[i] = h * acc;
        }
        error_norm(&err, y, out, rtol, atol)
    }

    fn prepare_dense(&mut self, _field: &dyn VectorField, _t: f64, y0: &[f64], y1: &[f64], h: f64) {
        let n = y0.len();
        for i in 0..n {
            let ydiff = y1[i] - y0[i];
            let bspl = h * self.k[0][i] - ydiff;
            self.rcont[0][i] = y0[i];
            self.rcont[1][i] = ydiff;
            self.rcont[2][i] = bspl;
            self.rcont[3][i] = ydiff - h * self.k[6][i] - bspl;
            let mut acc = 0.0;
            for (j, &dj) in DP_D.iter().enumerate() {
                acc += dj * self.k[j][i];
            }
            self.rcont[4][i] = h * acc;
        }
    }

    fn interpolate(&self, _field: &dyn VectorField, theta: f64, out: &mut [f64]) {
        let theta1 = 1.0 - theta;
        for i in 0..out.len() {
            out[i] = self.rcont[0][i]
                + theta
                    * (self.rcont[1][i]
                        + theta1
                            * (self.rcont[2][i]
                                + theta * (self.rcont[3][i] + theta1 * self.rcont[4][i])));
        }
    }
}

/// Gragg-Bulirsch-Stoer extrapolation run at fixed order 8 (sub-step
/// sequence {2, 4, 6, 8}) with the last extrapolation-column difference as
/// the error estimate. Dense output re-integrates the partial step with a
/// few fixed 6th-order sub-steps from the stored step start, which keeps
/// in-step values near the step tolerance without ever forcing the adaptive
/// step onto an output time; the driver additionally caps the macro step
/// near the output spacing so the sub-steps stay short.
pub(crate) struct Gbs8 {
    t0: f64,
    y0: Vec<f64>,
    y1: Vec<f64>,
    h: f64,
}

const GBS_DENSE_SUBSTEPS: usize = 4;

impl Gbs8 {
    pub fn new(dim: usize) -> Self {
        Self {
            t0: 0.0,
            y0: vec![0.0; dim],
            y1: vec![0.0; dim],
            h: 0.0,
        }
    }
}

impl EmbeddedStep for Gbs8 {
    fn error_exponent(&self) -> f64 {
        0.125
    }

    fn attempt(
        &mut self,
        field: &dyn VectorField,
        t: f64,
        y: &[f64],
        h: f64,
        out: &mut [f64],
        rtol: f64,
        atol: f64,
    ) -> f64 {
        let mut err = vec![0.0; y.len()];
        extrapolated_midpoint(field, t, y, h, &[2, 4, 6, 8], out, Some(&mut err));
        error_norm(&err, y, out, rtol, atol)
    }

    fn prepare_dense(&mut self, _field: &dyn VectorField, t: f64, y0: &[f64], y1: &[f64], h: f64) {
        self.t0 = t;
        self.y0.copy_from_slice(y0);
        self.y1.copy_from_slice(y1);
        self.h = h;
    }

    fn interpolate(&self, field: &dyn VectorField, theta: f64, out: &mut [f64]) {
        if theta <= 0.0 {
            out.copy_from_slice(&self.y0);
            return;
        }
        if theta >= 1.0 {
            out.copy_from_slice(&self.y1);
            return;
        }
        out.copy_from_slice(&self.y0);
        let mut t = self.t0;
        let dt = theta * self.h / GBS_DENSE_SUBSTEPS as f64;
        for _ in 0..GBS_DENSE_SUBSTEPS {
            Extrapolated6::step(field, &mut t, out, dt);
        }
    }
}
