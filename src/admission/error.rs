use std::time::Duration;

use snafu::Snafu;

/// Errors a caller can observe from a [`Controller`](super::Controller).
///
/// A policy rejection ([`AdmissionError::Inadmissible`]) is never reported as a
/// cancellation or as shutdown.
#[derive(Debug, Clone, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AdmissionError {
    /// At least one bucket touched by the claim has no room in the current frame.
    #[snafu(display("claim is inadmissible"))]
    Inadmissible,

    /// The controller is closed or closing and no longer admits claims.
    #[snafu(display("admission controller is closed"))]
    Closed,

    /// The caller's cancellation future resolved before a decision was observed.
    #[snafu(display("claim was cancelled before a decision was made"))]
    Cancelled,

    /// The caller's deadline elapsed before a decision was observed.
    #[snafu(display("claim timed out after {:?}", timeout))]
    TimedOut { timeout: Duration },
}

impl AdmissionError {
    /// Cancellation or deadline, i.e. the caller gave up.
    pub const fn is_cancellation(&self) -> bool {
        matches!(self, AdmissionError::Cancelled | AdmissionError::TimedOut { .. })
    }

    pub const fn is_inadmissible(&self) -> bool {
        matches!(self, AdmissionError::Inadmissible)
    }

    pub const fn is_closed(&self) -> bool {
        matches!(self, AdmissionError::Closed)
    }
}

/// Rejected configuration values.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("invalid setting `{}`: {}", field, reason))]
    InvalidSetting {
        field: &'static str,
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_variants() {
        assert!(AdmissionError::Cancelled.is_cancellation());
        assert!(
            AdmissionError::TimedOut {
                timeout: Duration::from_millis(5)
            }
            .is_cancellation()
        );
        assert!(!AdmissionError::Inadmissible.is_cancellation());
        assert!(AdmissionError::Inadmissible.is_inadmissible());
        assert!(AdmissionError::Closed.is_closed());
        assert!(!AdmissionError::Closed.is_inadmissible());
    }

    #[test]
    fn display_messages() {
        assert_eq!(AdmissionError::Inadmissible.to_string(), "claim is inadmissible");
        assert_eq!(
            AdmissionError::Closed.to_string(),
            "admission controller is closed"
        );
        let err = SettingsError::InvalidSetting {
            field: "probe_slots",
            reason: "must be at least 1".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "invalid setting `probe_slots`: must be at least 1"
        );
    }
}
