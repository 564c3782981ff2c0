//! Session: controller plus signal channel, started and torn down together.

use crate::config::{RunArguments, RunConfig};
use crate::controller::{ControllerEnv, Ready, RunController, RunHandle, RunState};
use crate::error::{CovguardError, InitError, Result};
use crate::host::ResultCode;
use crate::obs;
use crate::signal::{SignalChannel, SignalSource};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

/// A running controller with its stop-signal listener attached.
pub struct Session {
    ready: Ready,
    channel: SignalChannel,
}

impl Session {
    /// Initialize the controller, then register `source` and start listening.
    ///
    /// A registration failure finishes the run with `CANCELED` and removes a
    /// report directory created by this run before the error is returned.
    pub async fn start(
        arguments: Option<RunArguments>,
        env: ControllerEnv,
        source: Box<dyn SignalSource>,
    ) -> std::result::Result<Self, InitError> {
        let ready = RunController::initialize(arguments, env)?;
        let handle = ready.handle();

        let channel = match SignalChannel::start(source, Arc::new(handle.clone())).await {
            Ok(channel) => channel,
            Err(err) => {
                let err = InitError::SignalRegistration(err);
                obs::emit_run_init_failed(&err);
                handle.finish(ResultCode::Canceled, BTreeMap::new());
                if tokio::task::spawn_blocking(move || ready.discard())
                    .await
                    .is_err()
                {
                    warn!("controller shutdown task panicked");
                }
                return Err(err);
            }
        };

        handle.attach_signal_channel(channel.sender());
        info!(run_id = handle.run_id(), "session started");
        Ok(Self { ready, channel })
    }

    pub fn handle(&self) -> RunHandle {
        self.ready.handle()
    }

    pub fn config(&self) -> &RunConfig {
        self.ready.config()
    }

    /// Wait for the run to finish, then stop the worker.
    ///
    /// The signal channel exits once the controller finishes the run, so this
    /// returns after the first stop signal has been handled.
    pub async fn wait(self) -> Result<RunState> {
        self.channel.join().await;
        Self::stop_worker(self.ready).await
    }

    /// Tear down without waiting for a stop signal. The run is left
    /// unfinished unless something already finished it.
    pub async fn shutdown(self) -> Result<RunState> {
        let state = Self::stop_worker(self.ready).await;
        self.channel.join().await;
        state
    }

    async fn stop_worker(ready: Ready) -> Result<RunState> {
        tokio::task::spawn_blocking(move || ready.shutdown())
            .await
            .map_err(|_| CovguardError::ControllerGone)?
    }
}
