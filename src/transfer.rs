//! Bounded streaming of large bodies.
//!
//! The caller writes into a [`Sink`]; a dedicated worker thread drains the
//! bounded buffer into a [`StreamChannel`] while also listening for the
//! peer's out-of-band replies. The caller learns the outcome from [`Handle`].
use std::{
    io,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use crossbeam::channel::{Receiver, Sender, bounded, never, select};
use tracing::{debug, trace, warn};

use crate::{
    config::TransferConfig,
    error::{Result, RpcError, SyncError},
};

/// A bidirectional byte stream to the remote store.
pub trait StreamChannel: Send {
    fn write(&mut self, chunk: &[u8]) -> std::result::Result<(), RpcError>;

    /// Half-close: no more payload follows.
    fn close_write(&mut self) -> std::result::Result<(), RpcError>;

    /// Replies from the peer. Disconnects once the peer is done talking.
    fn replies(&self) -> Receiver<std::result::Result<Vec<u8>, RpcError>>;

    /// Tears down both directions.
    fn close(&mut self);
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransferReport {
    pub bytes_sent: u64,
    /// Concatenated replies read from the peer.
    pub reply: Vec<u8>,
}

pub struct StreamTransferPipeline {
    config: TransferConfig,
}

impl StreamTransferPipeline {
    pub fn new(config: TransferConfig) -> Self {
        StreamTransferPipeline { config }
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Spawns the worker for one transfer of `total_size` bytes.
    pub fn start_transfer(
        &self,
        total_size: u64,
        channel: Box<dyn StreamChannel>,
    ) -> Result<(Sink, Handle)> {
        // slots * chunk_size never exceeds the byte capacity
        let capacity = self.config.buffer_capacity.max(1);
        let chunk_size = self.config.chunk_size.clamp(1, capacity);
        let slots = (capacity / chunk_size).max(1);
        let (data_tx, data_rx) = bounded::<Vec<u8>>(slots);
        let (done_tx, done_rx) = bounded(1);
        let observed = Arc::new(AtomicU64::new(0));

        let worker = Worker {
            channel,
            data: data_rx,
            total_size,
            wait_budget: Duration::from_millis(self.config.wait_budget_ms),
            observed: observed.clone(),
        };
        std::thread::Builder::new()
            .name(format!("icsync-transfer-{total_size}"))
            .spawn(move || {
                let outcome = worker.run();
                // the handle may be gone already
                let _ = done_tx.send(outcome);
            })?;
        debug!(total_size, slots, chunk_size, "transfer started");

        Ok((
            Sink {
                tx: Some(data_tx),
                chunk_size,
                remaining: total_size,
            },
            Handle {
                done: done_rx,
                outcome: OnceLock::new(),
                observed,
            },
        ))
    }
}

/// Write side of a transfer. Dropping it ends the input.
pub struct Sink {
    tx: Option<Sender<Vec<u8>>>,
    chunk_size: usize,
    remaining: u64,
}

impl Sink {
    /// Blocks while the buffer is full.
    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let Some(tx) = self.tx.as_ref() else {
            return Err(SyncError::InvalidArgument("sink already closed".into()));
        };
        if bytes.len() as u64 > self.remaining {
            return Err(SyncError::InvalidArgument(format!(
                "{} bytes written past the announced size",
                bytes.len() as u64 - self.remaining
            )));
        }
        for chunk in bytes.chunks(self.chunk_size) {
            tx.send(chunk.to_vec())
                .map_err(|_| SyncError::TransferAborted)?;
            self.remaining -= chunk.len() as u64;
        }
        Ok(())
    }

    /// Bytes still expected before the transfer completes.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    pub fn close(&mut self) {
        self.tx = None;
    }
}

impl io::Write for Sink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Sink::write(self, buf)
            .map(|_| buf.len())
            .map_err(|e| io::Error::other(e.to_string()))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Completion side of a transfer.
pub struct Handle {
    done: Receiver<Result<TransferReport>>,
    outcome: OnceLock<Result<TransferReport>>,
    observed: Arc<AtomicU64>,
}

impl Handle {
    /// Blocks until the worker finishes. Safe to call repeatedly.
    pub fn result(&self) -> Result<TransferReport> {
        self.outcome
            .get_or_init(|| {
                self.done
                    .recv()
                    .unwrap_or(Err(SyncError::TransferAborted))
            })
            .clone()
    }

    /// Bytes the worker has forwarded so far.
    pub fn bytes_observed(&self) -> u64 {
        self.observed.load(Ordering::Acquire)
    }
}

struct Worker {
    channel: Box<dyn StreamChannel>,
    data: Receiver<Vec<u8>>,
    total_size: u64,
    wait_budget: Duration,
    observed: Arc<AtomicU64>,
}

impl Worker {
    fn run(mut self) -> Result<TransferReport> {
        let outcome = self.pump();
        if let Err(err) = &outcome {
            warn!(%err, sent = self.observed.load(Ordering::Acquire), "transfer aborted");
            self.channel.close();
        }
        outcome
    }

    fn pump(&mut self) -> Result<TransferReport> {
        let replies = self.channel.replies();
        let no_data = never();
        let no_replies = never();
        let mut report = TransferReport::default();
        let mut input_open = true;
        let mut replies_open = true;

        if self.total_size == 0 {
            end_input(self.channel.as_mut(), &mut input_open)?;
        }
        while input_open || replies_open {
            let data = if input_open { &self.data } else { &no_data };
            let incoming = if replies_open { &replies } else { &no_replies };
            select! {
                recv(data) -> msg => match msg {
                    Ok(chunk) => {
                        self.channel.write(&chunk)?;
                        report.bytes_sent += chunk.len() as u64;
                        self.observed.store(report.bytes_sent, Ordering::Release);
                        trace!(sent = report.bytes_sent, "chunk forwarded");
                        if report.bytes_sent >= self.total_size {
                            end_input(self.channel.as_mut(), &mut input_open)?;
                        }
                    }
                    Err(_) => {
                        debug!(sent = report.bytes_sent, "sink closed early");
                        end_input(self.channel.as_mut(), &mut input_open)?;
                    }
                },
                recv(incoming) -> msg => match msg {
                    Ok(Ok(bytes)) => report.reply.extend_from_slice(&bytes),
                    Ok(Err(err)) => return Err(err.into()),
                    Err(_) => replies_open = false,
                },
                default(self.wait_budget) => return Err(SyncError::Timeout),
            }
        }
        self.channel.close();
        debug!(sent = report.bytes_sent, reply = report.reply.len(), "transfer complete");
        Ok(report)
    }
}

fn end_input(channel: &mut dyn StreamChannel, input_open: &mut bool) -> Result<()> {
    *input_open = false;
    channel.close_write()?;
    Ok(())
}
