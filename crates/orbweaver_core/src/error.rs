use thiserror::Error;

/// Library-wide error type.
///
/// Configuration errors are detected before any numerical work starts and
/// always surface to the caller. Divergence is detected mid-integration and
/// is reported per trajectory, carrying the last valid time and state so the
/// caller can inspect how far the integration got. Approximation-validity
/// conditions that have a documented fallback never appear here; they
/// downgrade to the fallback with an observable flag on the result.
#[derive(Debug, Error)]
pub enum OrbitError {
    /// Inconsistent or insufficient inputs; nothing was executed.
    #[error("configuration error: {0}")]
    Config(String),

    /// The integration blew up or the adaptive step size underflowed.
    #[error("numerical divergence at t = {last_time}: {reason}")]
    Divergence {
        last_time: f64,
        last_state: Vec<f64>,
        reason: String,
    },

    /// A surface-of-section precondition failed and no fallback was allowed.
    #[error("section precondition failed: {0}")]
    SectionPrecondition(String),

    /// An analytic characterization could not be completed for this orbit,
    /// e.g. a turning point does not exist because the orbit is unbound.
    #[error("orbit characterization failed: {0}")]
    Analysis(String),
}

pub type Result<T> = std::result::Result<T, OrbitError>;

pub(crate) fn config_err<T>(msg: impl Into<String>) -> Result<T> {
    Err(OrbitError::Config(msg.into()))
}
