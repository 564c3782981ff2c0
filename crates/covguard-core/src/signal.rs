//! Signal channel: a background task that owns the stop-signal queue.
//!
//! Sources push `finish-testing` events into the queue through a
//! [`SignalSender`]; the background task turns each one into exactly one
//! [`StopTarget::on_stop_signal`] call. `TerminateNow` ends the task, after
//! which the source is unregistered.

use crate::error::SignalError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Name of the external stop event.
pub const FINISH_TESTING_ACTION: &str = "finish-testing";
/// Optional boolean field of the stop event requesting cancellation.
pub const KEY_CANCEL_ANALYSIS: &str = "cancelAnalysis";

/// An external request to end the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopSignal {
    /// `None` when the sender did not set the flag.
    pub cancel_analysis: Option<bool>,

    /// When the signal entered the channel.
    pub received_at: DateTime<Utc>,
}

impl StopSignal {
    pub fn new(cancel_analysis: Option<bool>) -> Self {
        Self {
            cancel_analysis,
            received_at: Utc::now(),
        }
    }

    /// An absent flag means a normal stop.
    pub fn cancel(&self) -> bool {
        self.cancel_analysis.unwrap_or(false)
    }
}

/// Events consumed by the background task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelEvent {
    FinishTesting(StopSignal),
    TerminateNow,
}

/// Write side of the channel queue.
#[derive(Debug, Clone)]
pub struct SignalSender {
    tx: mpsc::UnboundedSender<ChannelEvent>,
}

impl SignalSender {
    /// Deliver a `finish-testing` event, stamped with its arrival time.
    pub fn finish_testing(&self, cancel_analysis: Option<bool>) -> Result<(), SignalError> {
        self.tx
            .send(ChannelEvent::FinishTesting(StopSignal::new(cancel_analysis)))
            .map_err(|_| SignalError::Closed)
    }

    /// Ask the background task to exit. No-op once it is gone.
    pub fn terminate_now(&self) {
        if self.tx.send(ChannelEvent::TerminateNow).is_err() {
            debug!("signal channel already terminated");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Whoever decides what a stop signal means.
pub trait StopTarget: Send + Sync {
    fn on_stop_signal(&self, signal: StopSignal);
}

/// Environment-specific delivery mechanism for the external stop event.
#[async_trait]
pub trait SignalSource: Send {
    /// Short label used in logs.
    fn name(&self) -> &str;

    /// Start delivering events into `sender`. Failure is fatal for the run.
    async fn register(&mut self, sender: SignalSender) -> Result<(), SignalError>;

    /// Undo the registration. Must be safe to call more than once.
    async fn unregister(&mut self);
}

/// In-process source: the embedding application triggers the stop itself.
#[derive(Debug, Clone, Default)]
pub struct LocalSource {
    slot: Arc<Mutex<Option<SignalSender>>>,
}

impl LocalSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire a `finish-testing` event. Fails if the source is not registered.
    pub fn finish_testing(&self, cancel_analysis: Option<bool>) -> Result<(), SignalError> {
        let slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.as_ref() {
            Some(sender) => sender.finish_testing(cancel_analysis),
            None => Err(SignalError::Closed),
        }
    }

    pub fn is_registered(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

#[async_trait]
impl SignalSource for LocalSource {
    fn name(&self) -> &str {
        "local"
    }

    async fn register(&mut self, sender: SignalSender) -> Result<(), SignalError> {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(sender);
        Ok(())
    }

    async fn unregister(&mut self) {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}

/// The running background listener.
pub struct SignalChannel {
    sender: SignalSender,
    task: JoinHandle<()>,
}

impl SignalChannel {
    /// Register `source` and spawn the background task feeding `target`.
    pub async fn start(
        mut source: Box<dyn SignalSource>,
        target: Arc<dyn StopTarget>,
    ) -> Result<Self, SignalError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let sender = SignalSender { tx };

        source.register(sender.clone()).await?;
        info!(source = source.name(), "stop-signal listener registered");

        let task = tokio::spawn(listen(source, rx, target));
        Ok(Self { sender, task })
    }

    pub fn sender(&self) -> SignalSender {
        self.sender.clone()
    }

    pub fn terminate_now(&self) {
        self.sender.terminate_now();
    }

    /// Wait for the background task to exit and the source to unregister.
    pub async fn join(self) {
        if let Err(err) = self.task.await {
            warn!(error = %err, "signal listener task panicked");
        }
    }
}

async fn listen(
    mut source: Box<dyn SignalSource>,
    mut rx: mpsc::UnboundedReceiver<ChannelEvent>,
    target: Arc<dyn StopTarget>,
) {
    while let Some(event) = rx.recv().await {
        match event {
            ChannelEvent::FinishTesting(signal) => {
                debug!(cancel = ?signal.cancel_analysis, "finish-testing received");
                target.on_stop_signal(signal);
            }
            ChannelEvent::TerminateNow => {
                debug!("terminate-now received");
                break;
            }
        }
    }

    rx.close();
    source.unregister().await;
    info!(source = source.name(), "stop-signal listener released");
}
