//! Poll-driven message delivery
//!
//! Some hosts can only hand messages over when asked. `PollAdapter` asks a
//! `PollSource` at a bounded interval and feeds whatever it gets into the
//! bridge as raw wire messages, the same path push delivery takes.

use super::BridgeCommand;
use crate::config::{MAX_POLL_INTERVAL_MS, MIN_POLL_INTERVAL_MS};
use crate::{ColloquyError, Result};
use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A source that only delivers when polled
pub trait PollSource: Send {
    /// Raw JSON messages received since the last poll, oldest first
    fn poll(&mut self) -> Vec<String>;
}

/// `PollSource` backed by a channel
pub struct ChannelPollSource {
    rx: Receiver<String>,
}

impl ChannelPollSource {
    /// Returns the source and the sender that fills it
    pub fn new() -> (Self, Sender<String>) {
        let (tx, rx) = unbounded();
        (Self { rx }, tx)
    }
}

impl PollSource for ChannelPollSource {
    fn poll(&mut self) -> Vec<String> {
        self.rx.try_iter().collect()
    }
}

/// Runs a `PollSource` on its own thread
pub struct PollAdapter {
    stop_tx: Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl PollAdapter {
    /// Start polling `source` every `interval`
    ///
    /// The interval is clamped to 10..=500 ms.
    pub fn start(
        mut source: Box<dyn PollSource>,
        interval: Duration,
        bridge: Sender<BridgeCommand>,
    ) -> Result<Self> {
        let interval = interval.clamp(
            Duration::from_millis(MIN_POLL_INTERVAL_MS),
            Duration::from_millis(MAX_POLL_INTERVAL_MS),
        );
        let (stop_tx, stop_rx) = bounded::<()>(1);

        let thread = std::thread::Builder::new()
            .name("bridge-poll".into())
            .spawn(move || {
                info!("Poll adapter running every {:?}", interval);
                loop {
                    select! {
                        recv(stop_rx) -> _ => break,
                        default(interval) => {}
                    }

                    let batch = source.poll();
                    if !batch.is_empty() {
                        debug!("Polled {} messages", batch.len());
                    }
                    for raw in batch {
                        if bridge.send(BridgeCommand::PublishRaw(raw)).is_err() {
                            warn!("Bridge closed, poll adapter exiting");
                            return;
                        }
                    }
                }
                debug!("Poll adapter stopped");
            })
            .map_err(|e| ColloquyError::IOError(format!("Failed to spawn poll adapter: {}", e)))?;

        Ok(Self {
            stop_tx,
            thread: Some(thread),
        })
    }

    /// Stop polling and wait for the thread
    pub fn stop(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        let _ = self.stop_tx.try_send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for PollAdapter {
    fn drop(&mut self) {
        self.halt();
    }
}
