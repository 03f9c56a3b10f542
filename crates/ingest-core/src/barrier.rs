//! Track arrival barrier
//!
//! The peer connection reports remote tracks one at a time, in whatever
//! order negotiation completes. The barrier holds the pipeline back until
//! every negotiated track is present, then hands them over as one list
//! ordered by media-description index.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::TrackCodec;
use crate::error::{Error, Result};
use crate::source::PacketSource;

/// One negotiated media line and its live packet source
pub struct Track {
    /// Media-description index in the answer; also the output stream index
    pub index: usize,
    pub codec: TrackCodec,
    pub source: Box<dyn PacketSource>,
}

impl Track {
    pub fn new(index: usize, codec: TrackCodec, source: Box<dyn PacketSource>) -> Self {
        Self {
            index,
            codec,
            source,
        }
    }
}

impl std::fmt::Debug for Track {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Track")
            .field("index", &self.index)
            .field("codec", &self.codec)
            .finish()
    }
}

/// Registration handle given to the peer's track callback
#[derive(Clone)]
pub struct TrackRegistrar {
    tx: mpsc::UnboundedSender<Track>,
    expected: usize,
    closed: Arc<AtomicBool>,
}

impl TrackRegistrar {
    pub fn expected(&self) -> usize {
        self.expected
    }

    pub fn register(&self, track: Track) -> Result<()> {
        if track.index >= self.expected {
            return Err(Error::TrackIndex {
                index: track.index,
                expected: self.expected,
            });
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::BarrierClosed);
        }

        debug!(track = track.index, mime_type = %track.codec.mime_type, "Track registered");
        self.tx.send(track).map_err(|_| Error::BarrierClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

pub struct TrackBarrier {
    rx: mpsc::UnboundedReceiver<Track>,
    expected: usize,
    closed: Arc<AtomicBool>,
}

impl TrackBarrier {
    /// Create a barrier for exactly `expected` tracks.
    pub fn new(expected: usize) -> Result<(TrackRegistrar, TrackBarrier)> {
        if expected == 0 {
            return Err(Error::Negotiation(
                "answer contains no media descriptions".to_string(),
            ));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        let registrar = TrackRegistrar {
            tx,
            expected,
            closed: Arc::clone(&closed),
        };
        let barrier = TrackBarrier {
            rx,
            expected,
            closed,
        };
        Ok((registrar, barrier))
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    /// Wait until every track has arrived.
    ///
    /// On timeout the partial set is dropped, which releases the tracks'
    /// packet sources.
    pub async fn await_all(mut self, timeout: Duration) -> Result<Vec<Track>> {
        let result = self.collect(timeout).await;
        self.close();
        result
    }

    /// Like [`await_all`](Self::await_all) but gives up when `cancel` fires.
    pub async fn await_all_or_cancel(
        mut self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<Track>> {
        let result = tokio::select! {
            result = self.collect(timeout) => result,
            _ = cancel.cancelled() => Err(Error::Cancelled),
        };
        self.close();
        result
    }

    async fn collect(&mut self, timeout: Duration) -> Result<Vec<Track>> {
        let deadline = Instant::now() + timeout;
        let mut slots: Vec<Option<Track>> = (0..self.expected).map(|_| None).collect();
        let mut arrived = 0;

        while arrived < self.expected {
            match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Ok(Some(track)) => {
                    let index = track.index;
                    if slots[index].is_some() {
                        warn!(track = index, "Duplicate track for an already filled slot, dropping");
                        continue;
                    }
                    slots[index] = Some(track);
                    arrived += 1;
                }
                Ok(None) => return Err(Error::BarrierClosed),
                Err(_) => {
                    warn!(expected = self.expected, arrived, "Track barrier timed out");
                    return Err(Error::BarrierTimeout {
                        expected: self.expected,
                        arrived,
                    });
                }
            }
        }

        info!(tracks = self.expected, "All negotiated tracks arrived");
        Ok(slots.into_iter().flatten().collect())
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::Release);
        self.rx.close();
    }
}

impl Drop for TrackBarrier {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::loopback::SyntheticSource;

    fn track(index: usize) -> Track {
        Track::new(index, TrackCodec::opus(), Box::new(SyntheticSource::new(index as u32, 1)))
    }

    #[tokio::test]
    async fn test_releases_in_media_order() {
        let (registrar, barrier) = TrackBarrier::new(3).unwrap();

        let r = registrar.clone();
        tokio::spawn(async move {
            r.register(track(2)).unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            r.register(track(0)).unwrap();
            r.register(track(1)).unwrap();
        });

        let tracks = barrier.await_all(Duration::from_secs(5)).await.unwrap();
        let indices: Vec<usize> = tracks.iter().map(|t| t.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert!(registrar.is_closed());
        assert!(matches!(registrar.register(track(0)), Err(Error::BarrierClosed)));
    }

    #[tokio::test]
    async fn test_duplicates_do_not_count() {
        let (registrar, barrier) = TrackBarrier::new(2).unwrap();
        registrar.register(track(0)).unwrap();
        registrar.register(track(0)).unwrap();

        let result = barrier.await_all(Duration::from_millis(50)).await;
        assert!(matches!(
            result,
            Err(Error::BarrierTimeout {
                expected: 2,
                arrived: 1
            })
        ));
    }

    #[tokio::test]
    async fn test_timeout_with_no_tracks() {
        let (_registrar, barrier) = TrackBarrier::new(1).unwrap();
        let result = barrier.await_all(Duration::from_millis(20)).await;
        assert!(matches!(
            result,
            Err(Error::BarrierTimeout {
                expected: 1,
                arrived: 0
            })
        ));
    }

    #[tokio::test]
    async fn test_out_of_range_index_is_rejected() {
        let (registrar, _barrier) = TrackBarrier::new(1).unwrap();
        assert!(matches!(
            registrar.register(track(1)),
            Err(Error::TrackIndex {
                index: 1,
                expected: 1
            })
        ));
    }

    #[tokio::test]
    async fn test_all_registrars_dropped() {
        let (registrar, barrier) = TrackBarrier::new(2).unwrap();
        registrar.register(track(1)).unwrap();
        drop(registrar);
        let result = barrier.await_all(Duration::from_secs(5)).await;
        assert!(matches!(result, Err(Error::BarrierClosed)));
    }

    #[tokio::test]
    async fn test_cancel_while_waiting() {
        let (_registrar, barrier) = TrackBarrier::new(1).unwrap();
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });
        let result = barrier
            .await_all_or_cancel(Duration::from_secs(5), &cancel)
            .await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[test]
    fn test_zero_tracks_rejected() {
        assert!(matches!(TrackBarrier::new(0), Err(Error::Negotiation(_))));
    }
}
