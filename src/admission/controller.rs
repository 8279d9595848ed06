use std::{
    fmt,
    future::{self, Future},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use snafu::ensure;
use tokio::sync::{mpsc, oneshot};

use super::{
    AdmissionError, AdmissionSettings, Attributes, ClaimRetry, SettingsError,
    bucket::{BucketSnapshot, FairnessKey},
    clock::FrameClock,
    engine::{Answer, ClaimAttempt, ClaimId, Completion, Control, Engine, Outcome},
    error::{CancelledSnafu, ClosedSnafu, InadmissibleSnafu, TimedOutSnafu},
    instant_now,
};

/// Handle to a running admission engine.
///
/// Cloning is cheap; every clone talks to the same engine. Must be created
/// inside a tokio runtime.
#[derive(Clone, Debug)]
pub struct Controller {
    claims: mpsc::Sender<ClaimAttempt>,
    control: mpsc::UnboundedSender<Control>,
    closed: Arc<AtomicBool>,
}

impl Controller {
    /// Starts an engine whose frames are driven by `settings.frame_interval()`.
    pub fn new(settings: AdmissionSettings) -> Result<Self, SettingsError> {
        Self::with_clock(settings, FrameClock::interval(settings.frame_interval()))
    }

    /// Starts an engine whose frames are driven by `clock`.
    pub fn with_clock(settings: AdmissionSettings, clock: FrameClock) -> Result<Self, SettingsError> {
        settings.validate()?;

        let (claims, claims_rx) = mpsc::channel(settings.mailbox_capacity);
        let (completion_tx, completions) = mpsc::unbounded_channel();
        let (control, control_rx) = mpsc::unbounded_channel();

        let engine = Engine::new(settings, clock, claims_rx, completion_tx, completions, control_rx);
        tokio::spawn(engine.run());
        debug!(message = "Admission controller started.", ?settings);

        Ok(Self {
            claims,
            control,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Waits for a decision without a deadline.
    pub async fn claim<A, K, V>(&self, attributes: A) -> Result<Permit, AdmissionError>
    where
        A: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.submit(collect(attributes), future::pending::<()>())
            .await
    }

    /// Waits for a decision until `cancel` resolves.
    ///
    /// Cancellation before the engine accepted the claim leaves no trace. If the
    /// engine admitted the claim but `cancel` won the race, the admission is
    /// rolled back by the engine.
    pub async fn claim_until<A, K, V, C>(
        &self,
        attributes: A,
        cancel: C,
    ) -> Result<Permit, AdmissionError>
    where
        A: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
        C: Future,
    {
        self.submit(collect(attributes), cancel).await
    }

    /// Waits for a decision for at most `timeout`.
    pub async fn claim_timeout<A, K, V>(
        &self,
        attributes: A,
        timeout: Duration,
    ) -> Result<Permit, AdmissionError>
    where
        A: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        match self
            .submit(collect(attributes), tokio::time::sleep(timeout))
            .await
        {
            Err(AdmissionError::Cancelled) => TimedOutSnafu { timeout }.fail(),
            other => other,
        }
    }

    /// Retries inadmissible claims with the given backoff. Any other error is
    /// returned immediately.
    pub async fn claim_retrying<A, K, V>(
        &self,
        attributes: A,
        retry: &ClaimRetry,
    ) -> Result<Permit, AdmissionError>
    where
        A: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let attributes = collect(attributes);
        let mut delays = retry.delays();
        let mut attempt = 1;

        loop {
            match self
                .submit(attributes.clone(), future::pending::<()>())
                .await
            {
                Err(AdmissionError::Inadmissible) if attempt < retry.max_attempts() => {
                    let Some(delay) = delays.next() else {
                        return InadmissibleSnafu.fail();
                    };
                    debug!(
                        message = "Claim inadmissible; backing off.",
                        attempt,
                        delay_ms = delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn submit<C: Future>(
        &self,
        attributes: Attributes,
        cancel: C,
    ) -> Result<Permit, AdmissionError> {
        ensure!(!self.closed.load(Ordering::Acquire), ClosedSnafu);

        let (answer, decision) = oneshot::channel();
        let attempt = ClaimAttempt { attributes, answer };
        tokio::pin!(cancel);

        tokio::select! {
            biased;

            _ = &mut cancel => return CancelledSnafu.fail(),
            sent = self.claims.send(attempt) => sent.map_err(|_| ClosedSnafu.build())?,
        }

        // Decision and cancellation race on the same rendezvous. A decision
        // that loses is dropped and the engine rolls it back.
        tokio::select! {
            biased;

            answer = decision => match answer {
                Ok(Answer::Admitted(permit)) => Ok(permit),
                Ok(Answer::Rejected) => InadmissibleSnafu.fail(),
                Ok(Answer::Closed) | Err(_) => ClosedSnafu.fail(),
            },
            _ = &mut cancel => CancelledSnafu.fail(),
        }
    }

    /// Stops admitting, waits for every admitted claim to be released, then
    /// stops the engine and its clock.
    ///
    /// Only the first call drains; later calls fail with [`AdmissionError::Closed`].
    pub async fn close(&self) -> Result<(), AdmissionError> {
        ensure!(!self.closed.swap(true, Ordering::AcqRel), ClosedSnafu);

        let (drained, done) = oneshot::channel();
        self.control
            .send(Control::Close { drained })
            .map_err(|_| ClosedSnafu.build())?;
        done.await.map_err(|_| ClosedSnafu.build())?;

        info!(message = "Admission controller closed.");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Current state of the bucket for `name=value`, if it exists.
    pub async fn snapshot(
        &self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<Option<BucketSnapshot>, AdmissionError> {
        let (reply, snapshot) = oneshot::channel();
        self.control
            .send(Control::Inspect {
                key: FairnessKey::new(name, value),
                reply,
            })
            .map_err(|_| ClosedSnafu.build())?;
        snapshot.await.map_err(|_| ClosedSnafu.build())
    }
}

fn collect<A, K, V>(attributes: A) -> Attributes
where
    A: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    attributes
        .into_iter()
        .map(|(name, value)| (name.into(), value.into()))
        .collect()
}

/// Proof of admission. Report the guarded operation's outcome with
/// [`Permit::succeed`], [`Permit::fail`] or [`Permit::release`].
///
/// Dropping a permit without releasing it gives the slot back without
/// charging a success or failure.
#[must_use = "an unreleased permit reports nothing about the guarded operation"]
#[derive(Debug)]
pub struct Permit {
    id: ClaimId,
    admitted_at: Instant,
    completions: Option<mpsc::UnboundedSender<Completion>>,
}

impl Permit {
    pub(crate) fn new(id: ClaimId, completions: mpsc::UnboundedSender<Completion>) -> Self {
        Self {
            id,
            admitted_at: instant_now(),
            completions: Some(completions),
        }
    }

    /// Forgets the engine so dropping reports nothing.
    pub(crate) fn disarm(mut self) {
        self.completions = None;
    }

    /// Time since admission.
    pub fn elapsed(&self) -> Duration {
        instant_now().saturating_duration_since(self.admitted_at)
    }

    /// `Ok` counts as success, `Err` as failure.
    pub fn release<E: fmt::Display>(self, outcome: Result<(), E>) {
        match outcome {
            Ok(()) => self.succeed(),
            Err(error) => self.fail(&error),
        }
    }

    pub fn succeed(mut self) {
        self.report(Outcome::Success);
    }

    pub fn fail<E: fmt::Display + ?Sized>(mut self, error: &E) {
        trace!(message = "Guarded operation failed.", claim = self.id, %error);
        self.report(Outcome::Failure);
    }

    fn report(&mut self, outcome: Outcome) {
        if let Some(completions) = self.completions.take() {
            // Fails only once the engine is gone, and then there is nothing to update.
            let _ = completions.send(Completion {
                id: self.id,
                outcome,
                latency: self.elapsed(),
            });
        }
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if self.completions.is_some() {
            trace!(message = "Permit dropped without release.", claim = self.id);
            self.report(Outcome::Abandoned);
        }
    }
}
