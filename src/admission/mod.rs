//! Admit or reject claims per fairness attribute, driven by recent failures.

mod backoff;
mod bucket;
mod clock;
mod controller;
mod engine;
mod error;
pub mod internal_event;
pub mod layer;
pub mod service;
mod store;


use std::{collections::BTreeMap, time::Duration};

use bon::Builder;
use serde::Deserialize;

pub use backoff::{ClaimRetry, ExponentialBackoff, JitterMode};
pub use bucket::{BucketSnapshot, FairnessKey, Frame, LimitState};
pub use clock::{FrameClock, FrameTrigger};
pub use controller::{Controller, Permit};
pub use error::{AdmissionError, SettingsError};
pub use layer::FairnessLayer;
pub use service::FairnessService;

use error::InvalidSettingSnafu;

/// Fairness attributes of a single claim, sorted by name.
pub type Attributes = BTreeMap<String, String>;

fn instant_now() -> std::time::Instant {
    tokio::time::Instant::now().into()
}

/// Policy knobs for the admission engine.
///
/// None of the thresholds has an authoritative value; the defaults block a
/// bucket after one frame in which at least half of its claims failed, keep it
/// closed for one frame and then offer a single probing claim per frame.
///
/// | Parameter | Default | Description |
/// |-----------|---------|-------------|
/// | `frame_interval_ms` | 1000 | Period of the default interval clock |
/// | `failure_threshold` | 0.5 | Failure ratio at or above which a bucket blocks |
/// | `min_samples` | 1 | Attempts needed before a frame's ratio counts |
/// | `probe_slots` | 1 | Claims admitted per frame while probing |
/// | `mailbox_capacity` | 1024 | Depth of the claim queue feeding the engine |
/// | `max_idle_frames` | unset | Evict idle unrestricted buckets after this many frames |
///
/// # Example
///
/// ```rust
/// use fair_admission::AdmissionSettings;
///
/// let settings = AdmissionSettings::builder()
///     .failure_threshold(0.25)
///     .min_samples(10)
///     .max_idle_frames(60)
///     .build();
/// assert!(settings.validate().is_ok());
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Builder, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdmissionSettings {
    /// Length of one statistics frame for the default interval clock.
    ///
    /// Ignored when a clock is injected with [`Controller::with_clock`].
    #[builder(default = default_frame_interval_ms())]
    #[serde(default = "default_frame_interval_ms")]
    pub(super) frame_interval_ms: u64,

    /// Failure ratio of the closed frame at or above which an unrestricted
    /// bucket becomes blocked.
    ///
    /// **Range**: 0 < failure_threshold <= 1
    #[builder(default = default_failure_threshold())]
    #[serde(default = "default_failure_threshold")]
    pub(super) failure_threshold: f64,

    /// Minimum number of attempts a frame needs before its failure ratio is
    /// trusted. Smaller frames are treated as insufficient evidence.
    #[builder(default = default_min_samples())]
    #[serde(default = "default_min_samples")]
    pub(super) min_samples: u64,

    /// Number of claims admitted per frame while a bucket is probing.
    #[builder(default = default_probe_slots())]
    #[serde(default = "default_probe_slots")]
    pub(super) probe_slots: u32,

    /// Bounded depth of the claim queue. Claimers wait (cancellably) when it is full.
    #[builder(default = default_mailbox_capacity())]
    #[serde(default = "default_mailbox_capacity")]
    pub(super) mailbox_capacity: usize,

    /// When set, an unrestricted bucket with no traffic and no outstanding
    /// claims for this many consecutive rotations is dropped.
    #[serde(default)]
    pub(super) max_idle_frames: Option<u32>,
}

const fn default_frame_interval_ms() -> u64 {
    1000
}

const fn default_failure_threshold() -> f64 {
    0.5
}

const fn default_min_samples() -> u64 {
    1
}

const fn default_probe_slots() -> u32 {
    1
}

const fn default_mailbox_capacity() -> usize {
    1024
}

impl Default for AdmissionSettings {
    fn default() -> Self {
        Self {
            frame_interval_ms: default_frame_interval_ms(),
            failure_threshold: default_failure_threshold(),
            min_samples: default_min_samples(),
            probe_slots: default_probe_slots(),
            mailbox_capacity: default_mailbox_capacity(),
            max_idle_frames: None,
        }
    }
}

impl AdmissionSettings {
    pub const fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }

    pub const fn failure_threshold(&self) -> f64 {
        self.failure_threshold
    }

    pub const fn min_samples(&self) -> u64 {
        self.min_samples
    }

    pub const fn probe_slots(&self) -> u32 {
        self.probe_slots
    }

    pub const fn mailbox_capacity(&self) -> usize {
        self.mailbox_capacity
    }

    pub const fn max_idle_frames(&self) -> Option<u32> {
        self.max_idle_frames
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.frame_interval_ms == 0 {
            return InvalidSettingSnafu {
                field: "frame_interval_ms",
                reason: "must be greater than zero",
            }
            .fail();
        }
        if !(self.failure_threshold > 0.0 && self.failure_threshold <= 1.0) {
            return InvalidSettingSnafu {
                field: "failure_threshold",
                reason: format!("must be in (0, 1], got {}", self.failure_threshold),
            }
            .fail();
        }
        if self.min_samples == 0 {
            return InvalidSettingSnafu {
                field: "min_samples",
                reason: "must be at least 1",
            }
            .fail();
        }
        if self.probe_slots == 0 {
            return InvalidSettingSnafu {
                field: "probe_slots",
                reason: "must be at least 1",
            }
            .fail();
        }
        if self.mailbox_capacity == 0 {
            return InvalidSettingSnafu {
                field: "mailbox_capacity",
                reason: "must be at least 1",
            }
            .fail();
        }
        Ok(())
    }
}
