//! Output stream relay
//!
//! The mux engine pushes container bytes through a [`ChunkSink`] from inside
//! the serialized write path; the single [`OutputStream`] reader pulls them
//! out in emission order. An error item ends the stream.

use std::io::{self, Read};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use futures::Stream;
use tokio::sync::mpsc;

use crate::error::{Error, Result};

/// Create a bounded relay holding at most `capacity` chunks in flight.
pub fn output_relay(capacity: usize) -> (ChunkSink, OutputStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let bytes = Arc::new(AtomicU64::new(0));
    let sink = ChunkSink {
        tx,
        bytes: Arc::clone(&bytes),
    };
    let stream = OutputStream {
        rx,
        pending: Bytes::new(),
        finished: false,
        bytes,
    };
    (sink, stream)
}

/// Producer side, handed to the mux engine's byte callback
#[derive(Clone)]
pub struct ChunkSink {
    tx: mpsc::Sender<Result<Bytes>>,
    bytes: Arc<AtomicU64>,
}

impl ChunkSink {
    /// Forward one chunk, blocking while the relay is full.
    ///
    /// Must not be called from an async worker thread.
    pub fn send(&self, chunk: &[u8]) -> Result<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        self.tx
            .blocking_send(Ok(Bytes::copy_from_slice(chunk)))
            .map_err(|_| Error::ConsumerGone)?;
        self.bytes.fetch_add(chunk.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Deliver a terminal error to the reader.
    pub fn fail(&self, err: Error) {
        let _ = self.tx.blocking_send(Err(err));
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Shared byte counter that outlives the sink itself
    pub(crate) fn byte_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.bytes)
    }
}

/// Consumer side: the muxed container byte stream.
///
/// `std::io::Read` blocks the calling thread; async consumers use
/// [`next_chunk`](Self::next_chunk) or the `Stream` impl.
pub struct OutputStream {
    rx: mpsc::Receiver<Result<Bytes>>,
    pending: Bytes,
    finished: bool,
    bytes: Arc<AtomicU64>,
}

impl OutputStream {
    pub async fn next_chunk(&mut self) -> Option<Result<Bytes>> {
        if let Some(chunk) = self.take_pending() {
            return Some(Ok(chunk));
        }
        if self.finished {
            return None;
        }
        let item = self.rx.recv().await;
        self.observe(item)
    }

    /// Blocking variant of [`next_chunk`](Self::next_chunk).
    pub fn blocking_next_chunk(&mut self) -> Option<Result<Bytes>> {
        if let Some(chunk) = self.take_pending() {
            return Some(Ok(chunk));
        }
        if self.finished {
            return None;
        }
        let item = self.rx.blocking_recv();
        self.observe(item)
    }

    /// Total bytes the muxer has pushed so far
    pub fn bytes_emitted(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn is_finished(&self) -> bool {
        self.finished && self.pending.is_empty()
    }

    fn take_pending(&mut self) -> Option<Bytes> {
        (!self.pending.is_empty()).then(|| std::mem::take(&mut self.pending))
    }

    fn observe(&mut self, item: Option<Result<Bytes>>) -> Option<Result<Bytes>> {
        match item {
            Some(Ok(chunk)) => Some(Ok(chunk)),
            Some(Err(e)) => {
                self.finished = true;
                self.rx.close();
                Some(Err(e))
            }
            None => {
                self.finished = true;
                None
            }
        }
    }
}

impl Read for OutputStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.pending.is_empty() {
            match self.blocking_next_chunk() {
                Some(Ok(chunk)) => self.pending = chunk,
                Some(Err(e)) => return Err(io::Error::other(e)),
                None => return Ok(0),
            }
        }

        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.advance(n);
        Ok(n)
    }
}

impl Stream for OutputStream {
    type Item = Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if let Some(chunk) = this.take_pending() {
            return Poll::Ready(Some(Ok(chunk)));
        }
        if this.finished {
            return Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(item) => Poll::Ready(this.observe(item)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl std::fmt::Debug for OutputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputStream")
            .field("pending", &self.pending.len())
            .field("finished", &self.finished)
            .field("bytes_emitted", &self.bytes_emitted())
            .finish()
    }
}
