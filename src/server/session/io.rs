//! Session input and output.
//!
//! [`SessionOutput`] writes to the SSH channel. Remote terminals are in raw
//! mode, so `\n` is sent as `\r\n`. Once the channel is closed, writes are
//! discarded silently: a handler racing a disconnect never sees an error for
//! output nobody can read.
//!
//! [`SessionInput`] is the queue of bytes received from the client.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use russh::ChannelWriteHalf;
use russh::server::Msg;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::server::error::{Error, Result};

/// Write side of a session channel.
#[async_trait]
pub trait ChannelSink: Send + Sync {
    async fn write(&self, data: &[u8]) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

/// [`ChannelSink`] over the write half of a russh server channel.
///
/// The write half is kept behind a mutex so concurrent writers never
/// interleave inside one `data` call.
pub struct ChannelWriter {
    write_half: Mutex<ChannelWriteHalf<Msg>>,
}

impl ChannelWriter {
    pub fn new(write_half: ChannelWriteHalf<Msg>) -> Self {
        Self {
            write_half: Mutex::new(write_half),
        }
    }
}

#[async_trait]
impl ChannelSink for ChannelWriter {
    async fn write(&self, data: &[u8]) -> Result<()> {
        self.write_half
            .lock()
            .await
            .data(data)
            .await
            .map_err(|e| Error::Transport(format!("failed to write to channel: {e}")))
    }

    async fn close(&self) -> Result<()> {
        self.write_half
            .lock()
            .await
            .close()
            .await
            .map_err(|e| Error::Transport(format!("failed to close channel: {e}")))
    }
}

/// Newline-translating output sink.
pub struct SessionOutput {
    sink: Arc<dyn ChannelSink>,
    open: AtomicBool,
}

impl SessionOutput {
    pub fn new(sink: Arc<dyn ChannelSink>) -> Self {
        Self {
            sink,
            open: AtomicBool::new(true),
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Write bytes, translating `\n` to `\r\n`.
    ///
    /// Does nothing once the channel is closed. A failed write marks the
    /// output closed.
    pub async fn write(&self, data: &[u8]) {
        if !self.is_open() || data.is_empty() {
            return;
        }
        let translated = translate_newlines(data);
        if let Err(e) = self.sink.write(&translated).await {
            debug!("Discarding output, channel gone: {}", e);
            self.open.store(false, Ordering::Release);
        }
    }

    pub async fn write_str(&self, text: &str) {
        self.write(text.as_bytes()).await;
    }

    pub async fn writeln(&self, text: &str) {
        let mut line = String::with_capacity(text.len() + 1);
        line.push_str(text);
        line.push('\n');
        self.write(line.as_bytes()).await;
    }

    /// Stop accepting output without touching the channel.
    pub(crate) fn mark_closed(&self) -> bool {
        self.open.swap(false, Ordering::AcqRel)
    }

    /// Mark closed and close the underlying channel.
    pub(crate) async fn close(&self) {
        self.mark_closed();
        if let Err(e) = self.sink.close().await {
            debug!("Channel close failed: {}", e);
        }
    }
}

/// Translate every `\n` not already preceded by `\r` into `\r\n`.
pub(crate) fn translate_newlines(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 8);
    let mut previous = 0u8;
    for &byte in data {
        if byte == b'\n' && previous != b'\r' {
            out.push(b'\r');
        }
        out.push(byte);
        previous = byte;
    }
    out
}

/// Bytes received from the client, in order.
pub struct SessionInput {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    cancel: CancellationToken,
    pending: Vec<u8>,
}

impl SessionInput {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<Vec<u8>>, cancel: CancellationToken) -> Self {
        Self {
            rx,
            cancel,
            pending: Vec::new(),
        }
    }

    /// Wait for the next chunk of input.
    ///
    /// # Errors
    ///
    /// * [`Error::Cancelled`] once the session is cancelled
    /// * [`Error::ChannelClosed`] once the client closed its side
    pub async fn read(&mut self) -> Result<Vec<u8>> {
        if !self.pending.is_empty() {
            return Ok(std::mem::take(&mut self.pending));
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            chunk = self.rx.recv() => chunk.ok_or(Error::ChannelClosed),
        }
    }

    /// Wait for the next single byte.
    pub async fn read_byte(&mut self) -> Result<u8> {
        loop {
            if !self.pending.is_empty() {
                return Ok(self.pending.remove(0));
            }
            self.pending = self.read().await?;
        }
    }

    /// Return bytes to the front of the queue.
    pub fn unread(&mut self, bytes: &[u8]) {
        let mut restored = bytes.to_vec();
        restored.append(&mut self.pending);
        self.pending = restored;
    }
}
