use std::{collections::HashMap, time::Duration};

use tokio::sync::{mpsc, oneshot};

use super::{
    AdmissionSettings, Attributes,
    bucket::{Attribution, Bucket, BucketSnapshot, FairnessKey, LimitState},
    clock::{FrameClock, FrameTick},
    controller::Permit,
    internal_event::{
        AdmissionDecision, AdmissionDecisionHandle, BucketTransition, BucketTransitionHandle,
        ClaimCompleted, ClaimCompletedHandle, CompletionData, CompletionKind, Decision,
        FrameRotated, FrameRotatedHandle, InternalEventHandle, RegisterInternalEvent,
        RotationData, TransitionData,
    },
    store::BucketStore,
};

pub(crate) type ClaimId = u64;

/// A request for admission, answered exactly once.
#[derive(Debug)]
pub(crate) struct ClaimAttempt {
    pub(crate) attributes: Attributes,
    pub(crate) answer: oneshot::Sender<Answer>,
}

#[derive(Debug)]
pub(crate) enum Answer {
    Admitted(Permit),
    Rejected,
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Outcome {
    Success,
    Failure,
    /// The permit was dropped unreleased, or never reached the claimer.
    Abandoned,
}

/// Reported by a [`Permit`] when the guarded operation finished.
#[derive(Debug)]
pub(crate) struct Completion {
    pub(crate) id: ClaimId,
    pub(crate) outcome: Outcome,
    pub(crate) latency: Duration,
}

#[derive(Debug)]
pub(crate) enum Control {
    Close {
        drained: oneshot::Sender<()>,
    },
    Inspect {
        key: FairnessKey,
        reply: oneshot::Sender<Option<BucketSnapshot>>,
    },
}

/// Keys touched by an admitted claim and the frame it was admitted in.
#[derive(Debug)]
struct PendingClaim {
    keys: Vec<FairnessKey>,
    frame: u64,
}

/// Sole owner of all bucket state.
///
/// Completions, control messages, frame ticks and claims are consumed one at a
/// time, in that priority, so every bucket sees a single total order of
/// admissions, completions and rotations.
pub(crate) struct Engine {
    settings: AdmissionSettings,
    store: BucketStore,
    pending: HashMap<ClaimId, PendingClaim>,
    next_claim: ClaimId,
    frame: u64,

    clock: FrameClock,
    claims: mpsc::Receiver<ClaimAttempt>,
    completions: mpsc::UnboundedReceiver<Completion>,
    // Handed to every permit.
    completion_tx: mpsc::UnboundedSender<Completion>,
    control: mpsc::UnboundedReceiver<Control>,

    closing: bool,
    detached: bool,
    drain_waiters: Vec<oneshot::Sender<()>>,

    decisions: AdmissionDecisionHandle,
    completed: ClaimCompletedHandle,
    transitions: BucketTransitionHandle,
    rotations: FrameRotatedHandle,
}

impl Engine {
    pub(crate) fn new(
        settings: AdmissionSettings,
        clock: FrameClock,
        claims: mpsc::Receiver<ClaimAttempt>,
        completion_tx: mpsc::UnboundedSender<Completion>,
        completions: mpsc::UnboundedReceiver<Completion>,
        control: mpsc::UnboundedReceiver<Control>,
    ) -> Self {
        Self {
            settings,
            store: BucketStore::default(),
            pending: HashMap::new(),
            next_claim: 0,
            frame: 0,
            clock,
            claims,
            completions,
            completion_tx,
            control,
            closing: false,
            detached: false,
            drain_waiters: Vec::new(),
            decisions: AdmissionDecision.register(),
            completed: ClaimCompleted.register(),
            transitions: BucketTransition.register(),
            rotations: FrameRotated.register(),
        }
    }

    pub(crate) async fn run(mut self) {
        debug!(message = "Admission engine started.");

        loop {
            tokio::select! {
                biased;

                Some(completion) = self.completions.recv() => self.complete(completion),
                Some(control) = self.control.recv() => self.handle_control(control),
                Some(tick) = self.clock.next() => self.rotate(tick),
                claim = self.claims.recv(), if !self.detached => match claim {
                    Some(attempt) => self.claim(attempt),
                    None => {
                        debug!(message = "All controller handles dropped; finishing once drained.");
                        self.detached = true;
                    }
                },
                else => break,
            }

            if (self.closing || self.detached) && self.pending.is_empty() {
                break;
            }
        }

        for waiter in self.drain_waiters.drain(..) {
            let _ = waiter.send(());
        }
        info!(message = "Admission engine stopped.", frame = self.frame, buckets = self.store.len());
    }

    fn claim(&mut self, attempt: ClaimAttempt) {
        let ClaimAttempt { attributes, answer } = attempt;

        if self.closing {
            self.decisions.emit(Decision::Closed);
            let _ = answer.send(Answer::Closed);
            return;
        }

        if answer.is_closed() {
            trace!(message = "Claimer left before a decision; skipping.");
            return;
        }

        let keys = BucketStore::keys_for(&attributes);
        let settings = self.settings;
        // Resolve every bucket, even after the first one without room.
        let admissible = keys
            .iter()
            .fold(true, |ok, key| self.store.bucket_for(key).has_room(&settings) && ok);

        if !admissible {
            debug!(message = "Claim rejected.", ?attributes, frame = self.frame);
            self.decisions.emit(Decision::Rejected);
            let _ = answer.send(Answer::Rejected);
            return;
        }

        for key in &keys {
            self.store.bucket_for(key).admit();
        }

        let id = self.next_claim;
        self.next_claim += 1;
        self.pending.insert(
            id,
            PendingClaim {
                keys,
                frame: self.frame,
            },
        );
        self.decisions.emit(Decision::Admitted);

        let permit = Permit::new(id, self.completion_tx.clone());
        if let Err(Answer::Admitted(permit)) = answer.send(Answer::Admitted(permit)) {
            // Cancellation won the race against delivery.
            permit.disarm();
            debug!(message = "Admission not delivered; rolling back.", claim = id);
            self.finish(id, Outcome::Abandoned, Duration::ZERO);
        }
    }

    fn complete(&mut self, completion: Completion) {
        let Completion {
            id,
            outcome,
            latency,
        } = completion;
        self.finish(id, outcome, latency);
    }

    fn finish(&mut self, id: ClaimId, outcome: Outcome, latency: Duration) {
        let Some(pending) = self.pending.remove(&id) else {
            debug!(message = "Ignoring completion for unknown claim.", claim = id);
            return;
        };

        let attribution = if pending.frame == self.frame {
            Some(Attribution::Current)
        } else if pending.frame + 1 == self.frame {
            Some(Attribution::Last)
        } else {
            None
        };

        let Some(attribution) = attribution else {
            for key in &pending.keys {
                if let Some(bucket) = self.store.get_mut(key) {
                    bucket.release_stale();
                }
            }
            self.completed.emit(CompletionData {
                kind: CompletionKind::Stale,
                latency,
            });
            return;
        };

        for key in &pending.keys {
            let Some(bucket) = self.store.get_mut(key) else {
                continue;
            };
            let settled = match outcome {
                Outcome::Abandoned => bucket.abandon(attribution),
                Outcome::Success => bucket.complete(attribution, false, latency),
                Outcome::Failure => bucket.complete(attribution, true, latency),
            };
            if let Some(to) = settled {
                self.transitions.emit(TransitionData {
                    key: key.clone(),
                    from: LimitState::Probe,
                    to,
                });
            }
        }

        let kind = match outcome {
            Outcome::Success => CompletionKind::Success,
            Outcome::Failure => CompletionKind::Failure,
            Outcome::Abandoned => CompletionKind::Abandoned,
        };
        self.completed.emit(CompletionData { kind, latency });
        trace!(message = "Claim completed.", claim = id, ?outcome, ?attribution, outstanding = self.pending.len());
    }

    fn rotate(&mut self, tick: FrameTick) {
        self.frame += 1;

        let transitions = &self.transitions;
        let summary = self.store.rotate_all(&self.settings, |key, from, to| {
            transitions.emit(TransitionData { key, from, to })
        });

        self.rotations.emit(RotationData {
            frame: self.frame,
            buckets: summary.buckets,
            blocked: summary.blocked,
            probing: summary.probing,
            evicted: summary.evicted,
            outstanding: self.pending.len() as u64,
        });
        trace!(message = "Frame boundary.", frame = self.frame, at = ?tick.at);
        tick.acknowledge();
    }

    fn handle_control(&mut self, control: Control) {
        match control {
            Control::Close { drained } => {
                if !self.closing {
                    info!(
                        message = "Closing admission controller; draining outstanding claims.",
                        outstanding = self.pending.len()
                    );
                    self.closing = true;
                }
                self.drain_waiters.push(drained);
            }
            Control::Inspect { key, reply } => {
                let _ = reply.send(self.store.get(&key).map(Bucket::snapshot));
            }
        }
    }
}
