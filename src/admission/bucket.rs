use std::{fmt, mem, time::Duration};

use super::AdmissionSettings;

/// One `(attribute name, attribute value)` pair. Each key owns exactly one bucket.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FairnessKey {
    pub name: String,
    pub value: String,
}

impl FairnessKey {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for FairnessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.value)
    }
}

/// Activity observed for one bucket during one time window.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Frame {
    pub attempts: u64,
    pub failures: u64,
    pub latency: Duration,
}

impl Frame {
    fn absorb(&mut self, other: &Frame) {
        self.attempts += other.attempts;
        self.failures += other.failures;
        self.latency += other.latency;
    }

    /// `None` when the frame has fewer than `min_samples` attempts.
    pub fn failure_ratio(&self, min_samples: u64) -> Option<f64> {
        if self.attempts == 0 || self.attempts < min_samples {
            return None;
        }
        Some(self.failures as f64 / self.attempts as f64)
    }
}

/// How a bucket compares its in-frame admissions against a limit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LimitState {
    #[default]
    Unrestricted,
    Blocked,
    Probe,
}

impl LimitState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            LimitState::Unrestricted => "unrestricted",
            LimitState::Blocked => "blocked",
            LimitState::Probe => "probe",
        }
    }
}

impl fmt::Display for LimitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which frame a completion report is charged to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Attribution {
    Current,
    Last,
}

/// Read-only copy of a bucket's state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BucketSnapshot {
    pub state: LimitState,
    pub current_frame: Frame,
    pub last_frame: Frame,
    pub baseline: Frame,
    pub admitted_in_frame: u64,
}

/// Per-key admission state. Only ever touched by the engine task.
#[derive(Clone, Debug, Default)]
pub(crate) struct Bucket {
    current_frame: Frame,
    last_frame: Frame,
    // Every closed frame, never reset.
    baseline: Frame,
    admitted_in_frame: u64,
    state: LimitState,
    // Outstanding claims referencing this bucket, across frames.
    in_flight: u64,
    idle_frames: u32,
    // Outcomes of this frame's probes seen so far.
    probe_reported: bool,
    probe_failed: bool,
}

impl Bucket {
    pub(crate) fn state(&self) -> LimitState {
        self.state
    }

    pub(crate) fn effective_limit(&self, settings: &AdmissionSettings) -> u64 {
        match self.state {
            LimitState::Unrestricted => u64::MAX,
            LimitState::Blocked => 0,
            LimitState::Probe => u64::from(settings.probe_slots),
        }
    }

    pub(crate) fn has_room(&self, settings: &AdmissionSettings) -> bool {
        self.admitted_in_frame < self.effective_limit(settings)
    }

    pub(crate) fn admit(&mut self) {
        self.current_frame.attempts += 1;
        self.admitted_in_frame += 1;
        self.in_flight += 1;
    }

    /// Charges a completed claim. Returns the new state when a probe resolved.
    pub(crate) fn complete(
        &mut self,
        attribution: Attribution,
        failed: bool,
        latency: Duration,
    ) -> Option<LimitState> {
        self.in_flight = self.in_flight.saturating_sub(1);
        match attribution {
            Attribution::Current => {
                self.admitted_in_frame = self.admitted_in_frame.saturating_sub(1);
                self.current_frame.latency += latency;
                if failed {
                    self.current_frame.failures += 1;
                }
            }
            Attribution::Last => {
                self.last_frame.latency += latency;
                self.baseline.latency += latency;
                if failed {
                    self.last_frame.failures += 1;
                    self.baseline.failures += 1;
                }
            }
        }

        // A probe outcome only counts inside the frame that offered it.
        if attribution == Attribution::Current && self.state == LimitState::Probe {
            self.probe_reported = true;
            self.probe_failed |= failed;
            return self.settle_probe();
        }
        None
    }

    /// Resolves probing once every probe admitted in this frame reported back.
    fn settle_probe(&mut self) -> Option<LimitState> {
        if self.state != LimitState::Probe || self.admitted_in_frame > 0 || !self.probe_reported {
            return None;
        }
        self.state = if self.probe_failed {
            LimitState::Blocked
        } else {
            LimitState::Unrestricted
        };
        self.probe_reported = false;
        self.probe_failed = false;
        Some(self.state)
    }

    /// Drops the claim's reference without charging any frame.
    pub(crate) fn release_stale(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
    }

    /// Undoes an admission whose outcome will never be known. Returns the new
    /// state when this was the last outstanding probe of the frame.
    pub(crate) fn abandon(&mut self, attribution: Attribution) -> Option<LimitState> {
        self.in_flight = self.in_flight.saturating_sub(1);
        match attribution {
            Attribution::Current => {
                self.admitted_in_frame = self.admitted_in_frame.saturating_sub(1);
                self.current_frame.attempts = self
                    .current_frame
                    .attempts
                    .saturating_sub(1)
                    .max(self.current_frame.failures);
            }
            Attribution::Last => {
                self.last_frame.attempts = self
                    .last_frame
                    .attempts
                    .saturating_sub(1)
                    .max(self.last_frame.failures);
                self.baseline.attempts = self
                    .baseline
                    .attempts
                    .saturating_sub(1)
                    .max(self.baseline.failures);
                return None;
            }
        }
        self.settle_probe()
    }

    /// Closes the current frame and recomputes the limit state from it.
    pub(crate) fn rotate(&mut self, settings: &AdmissionSettings) -> LimitState {
        let closed = mem::take(&mut self.current_frame);
        self.baseline.absorb(&closed);

        self.state = match self.state {
            LimitState::Unrestricted => match closed.failure_ratio(settings.min_samples) {
                Some(ratio) if ratio >= settings.failure_threshold => LimitState::Blocked,
                _ => LimitState::Unrestricted,
            },
            LimitState::Blocked => LimitState::Probe,
            // A failed probe blocks even if another one never reported back.
            LimitState::Probe if self.probe_failed => LimitState::Blocked,
            // Unexercised or unresolved probes are offered again.
            LimitState::Probe => LimitState::Probe,
        };
        self.probe_reported = false;
        self.probe_failed = false;

        if closed.attempts == 0 && self.in_flight == 0 && self.state == LimitState::Unrestricted
        {
            self.idle_frames = self.idle_frames.saturating_add(1);
        } else {
            self.idle_frames = 0;
        }

        self.last_frame = closed;
        self.admitted_in_frame = 0;
        self.state
    }

    pub(crate) fn is_evictable(&self, max_idle_frames: u32) -> bool {
        self.in_flight == 0
            && self.state == LimitState::Unrestricted
            && self.idle_frames >= max_idle_frames
    }

    pub(crate) fn snapshot(&self) -> BucketSnapshot {
        BucketSnapshot {
            state: self.state,
            current_frame: self.current_frame,
            last_frame: self.last_frame,
            baseline: self.baseline,
            admitted_in_frame: self.admitted_in_frame,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> AdmissionSettings {
        AdmissionSettings::default()
    }

    fn failing_bucket(attempts: u64, failures: u64) -> Bucket {
        let mut bucket = Bucket::default();
        for i in 0..attempts {
            bucket.admit();
            bucket.complete(Attribution::Current, i < failures, Duration::from_millis(1));
        }
        bucket
    }

    #[test]
    fn unrestricted_admits_without_limit() {
        let mut bucket = Bucket::default();
        for _ in 0..10_000 {
            assert!(bucket.has_room(&settings()));
            bucket.admit();
        }
        assert_eq!(bucket.snapshot().admitted_in_frame, 10_000);
    }

    #[test]
    fn blocks_at_failure_threshold() {
        let mut bucket = failing_bucket(2, 1);
        assert_eq!(bucket.rotate(&settings()), LimitState::Blocked);
        assert!(!bucket.has_room(&settings()));
    }

    #[test]
    fn stays_open_below_threshold() {
        let mut bucket = failing_bucket(3, 1);
        assert_eq!(bucket.rotate(&settings()), LimitState::Unrestricted);
    }

    #[test]
    fn insufficient_samples_do_not_block() {
        let settings = AdmissionSettings::builder().min_samples(5).build();
        let mut bucket = failing_bucket(4, 4);
        assert_eq!(bucket.rotate(&settings), LimitState::Unrestricted);
    }

    #[test]
    fn blocked_becomes_probe_and_probe_waits() {
        let mut bucket = failing_bucket(1, 1);
        assert_eq!(bucket.rotate(&settings()), LimitState::Blocked);
        assert_eq!(bucket.rotate(&settings()), LimitState::Probe);
        assert_eq!(bucket.rotate(&settings()), LimitState::Probe);
        assert_eq!(bucket.effective_limit(&settings()), 1);
    }

    #[test]
    fn probe_admits_single_claim() {
        let mut bucket = failing_bucket(1, 1);
        bucket.rotate(&settings());
        bucket.rotate(&settings());

        assert!(bucket.has_room(&settings()));
        bucket.admit();
        assert!(!bucket.has_room(&settings()));
    }

    #[test]
    fn probe_success_reopens() {
        let mut bucket = failing_bucket(1, 1);
        bucket.rotate(&settings());
        bucket.rotate(&settings());

        bucket.admit();
        let resolved = bucket.complete(Attribution::Current, false, Duration::ZERO);
        assert_eq!(resolved, Some(LimitState::Unrestricted));
    }

    #[test]
    fn probe_failure_closes_again() {
        let mut bucket = failing_bucket(1, 1);
        bucket.rotate(&settings());
        bucket.rotate(&settings());

        bucket.admit();
        let resolved = bucket.complete(Attribution::Current, true, Duration::ZERO);
        assert_eq!(resolved, Some(LimitState::Blocked));
        assert_eq!(bucket.rotate(&settings()), LimitState::Probe);
    }

    fn probing_bucket(settings: &AdmissionSettings) -> Bucket {
        let mut bucket = failing_bucket(1, 1);
        bucket.rotate(settings);
        bucket.rotate(settings);
        bucket
    }

    #[test]
    fn probes_resolve_after_the_last_one_reports() {
        let settings = AdmissionSettings::builder().probe_slots(2).build();
        let mut bucket = probing_bucket(&settings);

        bucket.admit();
        bucket.admit();
        assert!(!bucket.has_room(&settings));

        assert_eq!(bucket.complete(Attribution::Current, false, Duration::ZERO), None);
        assert_eq!(bucket.state(), LimitState::Probe);
        assert_eq!(
            bucket.complete(Attribution::Current, false, Duration::ZERO),
            Some(LimitState::Unrestricted)
        );
    }

    #[test]
    fn any_failed_probe_blocks() {
        let settings = AdmissionSettings::builder().probe_slots(2).build();
        let mut bucket = probing_bucket(&settings);

        bucket.admit();
        bucket.admit();
        assert_eq!(bucket.complete(Attribution::Current, true, Duration::ZERO), None);
        let snapshot = bucket.snapshot();
        assert_eq!(snapshot.state, LimitState::Probe);
        assert_eq!(snapshot.admitted_in_frame, 1);

        assert_eq!(
            bucket.complete(Attribution::Current, false, Duration::ZERO),
            Some(LimitState::Blocked)
        );
        assert_eq!(bucket.snapshot().admitted_in_frame, 0);
    }

    #[test]
    fn abandoned_last_probe_settles_reported_outcomes() {
        let settings = AdmissionSettings::builder().probe_slots(2).build();
        let mut bucket = probing_bucket(&settings);

        bucket.admit();
        bucket.admit();
        assert_eq!(bucket.complete(Attribution::Current, false, Duration::ZERO), None);
        assert_eq!(
            bucket.abandon(Attribution::Current),
            Some(LimitState::Unrestricted)
        );
    }

    #[test]
    fn abandoned_probe_alone_settles_nothing() {
        let mut bucket = probing_bucket(&settings());

        bucket.admit();
        assert_eq!(bucket.abandon(Attribution::Current), None);
        assert_eq!(bucket.state(), LimitState::Probe);
        assert!(bucket.has_room(&settings()));
    }

    #[test]
    fn failed_probe_blocks_at_rotation_while_another_is_outstanding() {
        let settings = AdmissionSettings::builder().probe_slots(2).build();
        let mut bucket = probing_bucket(&settings);

        bucket.admit();
        bucket.admit();
        bucket.complete(Attribution::Current, true, Duration::ZERO);

        assert_eq!(bucket.rotate(&settings), LimitState::Blocked);
        // The straggler lands in the last frame and changes nothing.
        assert_eq!(bucket.complete(Attribution::Last, false, Duration::ZERO), None);
        assert_eq!(bucket.rotate(&settings), LimitState::Probe);
    }

    #[test]
    fn late_probe_outcome_does_not_resolve() {
        let mut bucket = failing_bucket(1, 1);
        bucket.rotate(&settings());
        bucket.rotate(&settings());

        bucket.admit();
        assert_eq!(bucket.rotate(&settings()), LimitState::Probe);
        assert_eq!(
            bucket.complete(Attribution::Last, false, Duration::ZERO),
            None
        );
        assert_eq!(bucket.state(), LimitState::Probe);
        assert!(bucket.has_room(&settings()));
    }

    #[test]
    fn rotation_folds_into_baseline() {
        let mut bucket = failing_bucket(3, 1);
        bucket.rotate(&settings());
        bucket.admit();
        bucket.complete(Attribution::Current, false, Duration::from_millis(1));
        bucket.rotate(&settings());

        let snapshot = bucket.snapshot();
        assert_eq!(snapshot.baseline.attempts, 4);
        assert_eq!(snapshot.baseline.failures, 1);
        assert_eq!(snapshot.baseline.latency, Duration::from_millis(4));
        assert_eq!(snapshot.last_frame.attempts, 1);
        assert_eq!(snapshot.current_frame, Frame::default());
    }

    #[test]
    fn late_completion_charges_last_frame() {
        let mut bucket = Bucket::default();
        bucket.admit();
        bucket.rotate(&settings());
        bucket.complete(Attribution::Last, true, Duration::from_millis(3));

        let snapshot = bucket.snapshot();
        assert_eq!(snapshot.last_frame.failures, 1);
        assert_eq!(snapshot.last_frame.latency, Duration::from_millis(3));
        assert_eq!(snapshot.current_frame, Frame::default());
        assert_eq!(snapshot.admitted_in_frame, 0);
    }

    #[test]
    fn abandon_rolls_back_admission() {
        let mut bucket = Bucket::default();
        bucket.admit();
        bucket.abandon(Attribution::Current);

        let snapshot = bucket.snapshot();
        assert_eq!(snapshot.current_frame.attempts, 0);
        assert_eq!(snapshot.admitted_in_frame, 0);
        assert!(bucket.is_evictable(0));
    }

    #[test]
    fn idle_buckets_become_evictable() {
        let mut bucket = Bucket::default();
        bucket.admit();
        bucket.complete(Attribution::Current, false, Duration::ZERO);
        bucket.rotate(&settings());
        assert!(!bucket.is_evictable(2));

        bucket.rotate(&settings());
        bucket.rotate(&settings());
        assert!(bucket.is_evictable(2));
    }

    #[test]
    fn failure_ratio_requires_evidence() {
        let frame = Frame {
            attempts: 0,
            failures: 0,
            latency: Duration::ZERO,
        };
        assert_eq!(frame.failure_ratio(0), None);

        let frame = Frame {
            attempts: 4,
            failures: 1,
            latency: Duration::ZERO,
        };
        assert_eq!(frame.failure_ratio(1), Some(0.25));
        assert_eq!(frame.failure_ratio(5), None);
    }
}
