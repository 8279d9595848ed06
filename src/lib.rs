//! Fairness-aware admission control with per-attribute circuit breaking.
//!
//! Callers ask a [`Controller`] for permission to run an operation tagged with
//! fairness attributes (source ip, user id, tenant, ...). Every distinct
//! `(name, value)` pair owns a bucket that tracks attempts, failures and
//! latency per time frame. At each frame boundary the bucket's limit is
//! recomputed from the frame that just closed:
//!
//! 1. **Unrestricted**: everything is admitted.
//! 2. **Blocked**: the last frame failed at or above the configured threshold;
//!    nothing is admitted for one frame.
//! 3. **Probe**: a single trial claim is admitted. Success reopens the bucket,
//!    failure closes it again.
//!
//! A claim touches one bucket per attribute and is admitted only if every
//! touched bucket has room, so one poisoned value is isolated without
//! throttling unrelated traffic.
//!
//! # Concurrency
//! All bucket state is owned by a single engine task. Claims, completion
//! reports and frame ticks are serialized through channels, so there are no
//! locks around bucket data.
//!
//! # Basic Usage
//! ```no_run
//! use fair_admission::{AdmissionSettings, Controller};
//!
//! # async fn run() -> Result<(), fair_admission::Error> {
//! let controller = Controller::new(AdmissionSettings::default())?;
//!
//! let permit = controller.claim([("ip", "10.0.0.1"), ("user", "jdoe")]).await?;
//! // ... run the guarded operation ...
//! permit.succeed();
//!
//! controller.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration
//! See [`admission::AdmissionSettings`] for tuning parameters.
//!
//! # Metrics
//! Emits metrics via the `metrics` facade, see [`admission::internal_event`].
pub mod admission;
#[cfg(test)]
pub mod test_utils;

#[macro_use]
extern crate tracing;

pub use admission::{
    AdmissionError, AdmissionSettings, Attributes, BucketSnapshot, ClaimRetry, Controller,
    FairnessKey, FairnessLayer, FairnessService, Frame, FrameClock, FrameTrigger, LimitState,
    Permit, SettingsError,
};

pub type Error = Box<dyn std::error::Error + Send + Sync + 'static>;
