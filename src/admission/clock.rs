use std::time::Duration;

use tokio::{
    sync::{mpsc, oneshot},
    time::{Instant, Interval, MissedTickBehavior},
};

use super::{AdmissionError, error::ClosedSnafu};

/// Source of frame boundaries for the admission engine.
///
/// The clock is owned by the engine and stops, exactly once, when the engine
/// finishes.
#[derive(Debug)]
pub struct FrameClock {
    source: Source,
}

#[derive(Debug)]
enum Source {
    Interval(Duration),
    Running(Interval),
    Manual(mpsc::Receiver<oneshot::Sender<()>>),
}

/// Fires frame ticks for a clock created with [`FrameClock::manual`].
#[derive(Clone, Debug)]
pub struct FrameTrigger {
    ticks: mpsc::Sender<oneshot::Sender<()>>,
}

/// A frame boundary delivered to the engine.
#[derive(Debug)]
pub(crate) struct FrameTick {
    pub(crate) at: Instant,
    rotated: Option<oneshot::Sender<()>>,
}

impl FrameTick {
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        Self {
            at: Instant::now(),
            rotated: None,
        }
    }

    /// Tells a manual trigger that the rotation finished.
    pub(crate) fn acknowledge(self) {
        if let Some(rotated) = self.rotated {
            let _ = rotated.send(());
        }
    }
}

impl FrameClock {
    /// A fixed-period clock. The first tick fires one period after the engine starts.
    pub fn interval(period: Duration) -> Self {
        Self {
            source: Source::Interval(period),
        }
    }

    /// A clock that only ticks when the returned trigger says so.
    pub fn manual() -> (Self, FrameTrigger) {
        let (ticks, rx) = mpsc::channel(1);
        (
            Self {
                source: Source::Manual(rx),
            },
            FrameTrigger { ticks },
        )
    }

    /// Resolves with the next tick, or `None` once a manual clock lost all triggers.
    pub(crate) async fn next(&mut self) -> Option<FrameTick> {
        if let Source::Interval(period) = self.source {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            self.source = Source::Running(interval);
        }

        match &mut self.source {
            Source::Running(interval) => Some(FrameTick {
                at: interval.tick().await,
                rotated: None,
            }),
            Source::Manual(rx) => rx.recv().await.map(|rotated| FrameTick {
                at: Instant::now(),
                rotated: Some(rotated),
            }),
            Source::Interval(_) => None,
        }
    }
}

impl FrameTrigger {
    /// Ends the current frame and waits until the engine has rotated every bucket.
    ///
    /// Claims submitted after this returns are charged to the new frame.
    pub async fn tick(&self) -> Result<(), AdmissionError> {
        let (rotated, done) = oneshot::channel();
        self.ticks
            .send(rotated)
            .await
            .map_err(|_| ClosedSnafu.build())?;
        done.await.map_err(|_| ClosedSnafu.build())
    }
}
