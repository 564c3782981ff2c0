//! Unix-socket delivery of the stop signal.
//!
//! The harness connects and writes one JSON object per line:
//! `{"action":"finish-testing","cancelAnalysis":true}`.

use crate::error::SignalError;
use crate::signal::{SignalSender, SignalSource, FINISH_TESTING_ACTION};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Wire form of a signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalMessage {
    pub action: String,

    #[serde(
        rename = "cancelAnalysis",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub cancel_analysis: Option<bool>,
}

impl SignalMessage {
    pub fn finish_testing(cancel_analysis: Option<bool>) -> Self {
        Self {
            action: FINISH_TESTING_ACTION.to_string(),
            cancel_analysis,
        }
    }
}

/// Listens on a Unix domain socket for `finish-testing` messages.
pub struct UnixSocketSource {
    path: PathBuf,
    accept_task: Option<JoinHandle<()>>,
}

impl UnixSocketSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            accept_task: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SignalSource for UnixSocketSource {
    fn name(&self) -> &str {
        "unix-socket"
    }

    async fn register(&mut self, sender: SignalSender) -> Result<(), SignalError> {
        if self.path.exists() {
            // Stale socket from an earlier run.
            if let Err(err) = std::fs::remove_file(&self.path) {
                warn!(path = %self.path.display(), error = %err, "cannot remove stale socket");
            }
        }

        let listener = UnixListener::bind(&self.path).map_err(|source| SignalError::Bind {
            path: self.path.clone(),
            source,
        })?;
        info!(path = %self.path.display(), "listening for stop signals");

        self.accept_task = Some(tokio::spawn(accept_loop(listener, sender)));
        Ok(())
    }

    async fn unregister(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
            let _ = task.await;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "socket removed"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %self.path.display(), error = %err, "cannot remove socket"),
        }
    }
}

async fn accept_loop(listener: UnixListener, sender: SignalSender) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                tokio::spawn(read_messages(stream, sender.clone()));
            }
            Err(err) => warn!(error = %err, "failed to accept signal connection"),
        }
    }
}

async fn read_messages(stream: UnixStream, sender: SignalSender) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                warn!(error = %err, "signal connection read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<SignalMessage>(&line) {
            Ok(message) if message.action == FINISH_TESTING_ACTION => {
                if sender.finish_testing(message.cancel_analysis).is_err() {
                    debug!("signal channel closed; dropping connection");
                    break;
                }
            }
            Ok(message) => warn!(action = %message.action, "ignoring unknown signal action"),
            Err(err) => warn!(error = %err, "ignoring malformed signal message"),
        }
    }
}

/// Harness side: deliver one `finish-testing` message to `path`.
pub async fn send_finish_testing(
    path: &Path,
    cancel_analysis: Option<bool>,
) -> Result<(), SignalError> {
    let mut stream = UnixStream::connect(path).await?;
    let mut line = serde_json::to_string(&SignalMessage::finish_testing(cancel_analysis))?;
    line.push('\n');
    stream.write_all(line.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}
