//! Stdio channel to the trading-engine subprocess.
//!
//! Owns the child process and its three pipes. Commands are written one per
//! line to stdin behind a mutex (single logical writer, no interleaved
//! partial writes). Stdout is decoded as one JSON object per line on a
//! dedicated task; lines that fail to parse are dropped with a debug trace.
//! Stderr is continuously drained on its own task so the child never blocks
//! on a full pipe buffer.

use std::process::Stdio;
use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::{debug, info, warn};

use crate::error::BridgeError;

pub struct ProcessChannel {
    stdin: tokio::sync::Mutex<ChildStdin>,
    child: parking_lot::Mutex<Child>,
}

impl ProcessChannel {
    /// Spawn the engine and wire up its pipes. Returns the channel handle and
    /// the lazy, infinite, non-restartable sequence of decoded output lines.
    pub fn start(
        command: &str,
        args: &[String],
    ) -> Result<(Arc<Self>, UnboundedReceiver<Value>), BridgeError> {
        let mut child = Command::new(command)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| BridgeError::Spawn {
                command: command.to_string(),
                source,
            })?;

        // Pipes are always present with Stdio::piped; a missing one means the
        // spawn itself was malformed.
        let stdin = child.stdin.take().ok_or_else(|| BridgeError::Spawn {
            command: command.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::BrokenPipe, "no stdin pipe"),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| BridgeError::Spawn {
            command: command.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::BrokenPipe, "no stdout pipe"),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| BridgeError::Spawn {
            command: command.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::BrokenPipe, "no stderr pipe"),
        })?;

        info!(command, "engine process started");

        // Unbounded so the reader never applies backpressure to the child;
        // the event log downstream is what bounds retention.
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => match serde_json::from_str::<Value>(&line) {
                        Ok(value) if value.is_object() => {
                            if tx.send(value).is_err() {
                                return;
                            }
                        }
                        _ => debug!(line = %line, "dropped unparseable engine line"),
                    },
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "engine stdout read failed");
                        break;
                    }
                }
            }
            warn!("engine stdout closed");
        });

        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "engine_stderr", line = %line, "engine stderr");
            }
        });

        let channel = Arc::new(Self {
            stdin: tokio::sync::Mutex::new(stdin),
            child: parking_lot::Mutex::new(child),
        });

        Ok((channel, rx))
    }

    /// Write one command line to the engine. Fails with `ChannelClosed` once
    /// the child's stdin is no longer writable.
    pub async fn send_line(&self, line: &str) -> Result<(), BridgeError> {
        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|_| BridgeError::ChannelClosed)?;
        stdin
            .write_all(b"\n")
            .await
            .map_err(|_| BridgeError::ChannelClosed)?;
        stdin.flush().await.map_err(|_| BridgeError::ChannelClosed)?;
        Ok(())
    }

    /// Request termination. Advisory only: the signal is sent without waiting,
    /// so the process may outlive this call briefly.
    pub fn stop(&self) {
        if let Err(e) = self.child.lock().start_kill() {
            debug!(error = %e, "engine stop signal failed (already dead?)");
        }
    }
}
