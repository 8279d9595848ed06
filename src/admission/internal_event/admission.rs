use std::time::Duration;

use metrics::{Counter, Gauge, Histogram, counter, gauge, histogram};

use crate::admission::{FairnessKey, LimitState};
use crate::registered_event;

/// Result of a single claim attempt as seen by the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    Admitted,
    Rejected,
    Closed,
}

/// How a pending claim left the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompletionKind {
    Success,
    Failure,
    Abandoned,
    /// Arrived after its frame was rotated out twice; nothing was charged.
    Stale,
}

#[derive(Clone, Copy, Debug)]
pub struct CompletionData {
    pub kind: CompletionKind,
    pub latency: Duration,
}

#[derive(Clone, Debug)]
pub struct TransitionData {
    pub key: FairnessKey,
    pub from: LimitState,
    pub to: LimitState,
}

#[derive(Clone, Copy, Debug)]
pub struct RotationData {
    pub frame: u64,
    pub buckets: usize,
    pub blocked: usize,
    pub probing: usize,
    pub evicted: usize,
    pub outstanding: u64,
}

registered_event! {
    AdmissionDecision => {
        admitted: Counter = counter!("admission_claims_admitted_total"),
        rejected: Counter = counter!("admission_claims_rejected_total"),
        closed: Counter = counter!("admission_claims_closed_total"),
    }

    fn emit(&self, decision: Decision) {
        match decision {
            Decision::Admitted => self.admitted.increment(1),
            Decision::Rejected => self.rejected.increment(1),
            Decision::Closed => self.closed.increment(1),
        }
    }
}

registered_event! {
    ClaimCompleted => {
        latency: Histogram = histogram!("admission_completion_latency_seconds"),
        failures: Counter = counter!("admission_completion_failures_total"),
        stale: Counter = counter!("admission_completion_stale_total"),
        abandoned: Counter = counter!("admission_completion_abandoned_total"),
    }

    fn emit(&self, data: CompletionData) {
        match data.kind {
            CompletionKind::Success => self.latency.record(data.latency),
            CompletionKind::Failure => {
                self.latency.record(data.latency);
                self.failures.increment(1);
            }
            CompletionKind::Abandoned => self.abandoned.increment(1),
            CompletionKind::Stale => {
                self.stale.increment(1);
                tracing::debug!(
                    target: "fair_admission::stats",
                    latency_ms = data.latency.as_millis(),
                    "Stale completion dropped"
                );
            }
        }
    }
}

registered_event! {
    BucketTransition => {}

    fn emit(&self, data: TransitionData) {
        counter!(
            "admission_state_transitions_total",
            "from" => data.from.as_str(),
            "to" => data.to.as_str()
        )
        .increment(1);
        tracing::info!(
            target: "fair_admission::stats",
            key = %data.key,
            from = %data.from,
            to = %data.to,
            "Bucket limit changed"
        );
    }
}

registered_event! {
    FrameRotated => {
        buckets: Gauge = gauge!("admission_buckets"),
        blocked: Gauge = gauge!("admission_blocked_buckets"),
        probing: Gauge = gauge!("admission_probing_buckets"),
        outstanding: Gauge = gauge!("admission_outstanding_claims"),
        evicted: Counter = counter!("admission_buckets_evicted_total"),
    }

    fn emit(&self, data: RotationData) {
        self.buckets.set(data.buckets as f64);
        self.blocked.set(data.blocked as f64);
        self.probing.set(data.probing as f64);
        self.outstanding.set(data.outstanding as f64);
        self.evicted.increment(data.evicted as u64);
        tracing::debug!(
            target: "fair_admission::stats",
            frame = data.frame,
            buckets = data.buckets,
            blocked = data.blocked,
            probing = data.probing,
            evicted = data.evicted,
            outstanding = data.outstanding,
            "Frame rotated"
        );
    }
}
