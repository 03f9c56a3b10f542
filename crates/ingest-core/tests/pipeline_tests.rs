//! Pipeline integration tests
//!
//! Drives barrier, demuxers and the synchronized muxer end to end over the
//! loopback engine and checks the container stream that comes out.

use std::io::Read;
use std::thread;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use whip_mpegts_core::engine::loopback::{
    parse_records, LoopbackDemux, LoopbackMux, Record, SyntheticSource,
};
use whip_mpegts_core::{
    Error, MuxerState, OutputStream, PipelineConfig, SynchronizedMuxer, Track, TrackBarrier,
    TrackCodec,
};

fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();
}

fn drain(mut stream: OutputStream) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    stream.read_to_end(&mut out)?;
    Ok(out)
}

/// Sequence numbers carried in each track's payload, in emission order
fn sequences_by_stream(records: &[Record], streams: usize) -> Vec<Vec<u16>> {
    let mut by_stream = vec![Vec::new(); streams];
    for record in records {
        if let Record::Packet {
            stream, payload, ..
        } = record
        {
            by_stream[*stream as usize].push(u16::from_be_bytes([payload[0], payload[1]]));
        }
    }
    by_stream
}

fn build(
    tracks: Vec<Track>,
    mux: LoopbackMux,
) -> (SynchronizedMuxer, OutputStream) {
    SynchronizedMuxer::build(
        tracks,
        &LoopbackDemux,
        &mux,
        &PipelineConfig::default(),
        CancellationToken::new(),
    )
    .expect("build muxer")
}

#[test]
fn test_two_tracks_interleave_without_tearing() {
    init_test_tracing();

    let tracks = vec![
        Track::new(
            0,
            TrackCodec::opus(),
            Box::new(SyntheticSource::new(0x11, 1_000).with_timestamp_step(960)),
        ),
        Track::new(
            1,
            TrackCodec::vp8(),
            Box::new(SyntheticSource::new(0x22, 1_000).with_payload_len(1_200)),
        ),
    ];
    let (muxer, stream) = build(tracks, LoopbackMux::default());

    let records = parse_records(&drain(stream).unwrap()).expect("well-formed stream");
    assert_eq!(records.first(), Some(&Record::Header { streams: 2 }));
    assert_eq!(records.last(), Some(&Record::Trailer { packets: 2_000 }));

    let expected: Vec<u16> = (0..1_000).collect();
    for sequences in sequences_by_stream(&records, 2) {
        assert_eq!(sequences, expected);
    }

    // Output timestamps per stream are monotone in the 90 kHz time base
    for stream_index in 0..2u8 {
        let pts: Vec<i64> = records
            .iter()
            .filter_map(|r| match r {
                Record::Packet { stream, pts, .. } if *stream == stream_index => *pts,
                _ => None,
            })
            .collect();
        assert!(pts.windows(2).all(|w| w[0] < w[1]));
    }

    let stats = muxer.stats();
    assert_eq!(stats.packets_written, vec![1_000, 1_000]);
    assert_eq!(stats.track_errors, 0);
    muxer.join().unwrap();
}

#[test]
fn test_short_track_does_not_stop_the_other() {
    init_test_tracing();

    let tracks = vec![
        Track::new(0, TrackCodec::opus(), Box::new(SyntheticSource::new(1, 10))),
        Track::new(1, TrackCodec::h264(), Box::new(SyntheticSource::new(2, 1_000))),
    ];
    let (muxer, stream) = build(tracks, LoopbackMux::default());

    let records = parse_records(&drain(stream).unwrap()).unwrap();
    let sequences = sequences_by_stream(&records, 2);
    assert_eq!(sequences[0].len(), 10);
    assert_eq!(sequences[1].len(), 1_000);
    assert_eq!(records.last(), Some(&Record::Trailer { packets: 1_010 }));

    assert_eq!(muxer.stats().packets_written, vec![10, 1_000]);
    muxer.join().unwrap();
}

#[test]
fn test_write_failure_ends_stream_with_error() {
    init_test_tracing();

    let tracks = vec![
        Track::new(0, TrackCodec::opus(), Box::new(SyntheticSource::new(1, 500))),
        Track::new(1, TrackCodec::vp8(), Box::new(SyntheticSource::new(2, 500))),
    ];
    let (muxer, stream) = build(tracks, LoopbackMux::default().fail_after(50));

    let err = drain(stream).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::Other);

    assert_eq!(muxer.stats().total_packets(), 50);
    assert!(matches!(muxer.join(), Err(Error::EngineFatal(_))));
}

#[test]
fn test_dropped_reader_stops_the_muxer() {
    let tracks = vec![Track::new(
        0,
        TrackCodec::vp8(),
        Box::new(SyntheticSource::new(1, 100_000)),
    )];
    let (muxer, mut stream) = build(tracks, LoopbackMux::default());

    // Read the header, then walk away
    assert!(stream.blocking_next_chunk().is_some());
    drop(stream);

    let result = muxer.join();
    assert!(matches!(result, Err(Error::EngineFatal(_))), "{:?}", result);
}

#[test]
fn test_shutdown_still_writes_trailer() {
    init_test_tracing();

    let tracks = vec![Track::new(
        0,
        TrackCodec::opus(),
        Box::new(SyntheticSource::new(1, 100_000).with_interval(Duration::from_millis(1))),
    )];
    let (muxer, stream) = build(tracks, LoopbackMux::default());

    let reader = thread::spawn(move || drain(stream));
    thread::sleep(Duration::from_millis(50));
    muxer.shutdown().unwrap();

    let records = parse_records(&reader.join().unwrap().unwrap()).unwrap();
    assert!(matches!(records.last(), Some(Record::Trailer { .. })));
    assert!(muxer.stats().total_packets() < 100_000);
    muxer.join().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_barrier_then_muxer() {
    init_test_tracing();

    let (registrar, barrier) = TrackBarrier::new(3).unwrap();

    // Tracks show up out of media order
    for index in [2usize, 0, 1] {
        let registrar = registrar.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5 * index as u64)).await;
            let codec = if index == 0 {
                TrackCodec::opus()
            } else {
                TrackCodec::vp8()
            };
            let source = SyntheticSource::new(index as u32, 100);
            registrar
                .register(Track::new(index, codec, Box::new(source)))
                .unwrap();
        });
    }

    let tracks = barrier.await_all(Duration::from_secs(5)).await.unwrap();
    assert_eq!(tracks.iter().map(|t| t.index).collect::<Vec<_>>(), vec![0, 1, 2]);

    let (muxer, stream) = tokio::task::spawn_blocking(move || {
        SynchronizedMuxer::build(
            tracks,
            &LoopbackDemux,
            &LoopbackMux::default(),
            &PipelineConfig::default(),
            CancellationToken::new(),
        )
    })
    .await
    .unwrap()
    .unwrap();

    let data = tokio::task::spawn_blocking(move || drain(stream))
        .await
        .unwrap()
        .unwrap();
    let records = parse_records(&data).unwrap();
    assert_eq!(records.first(), Some(&Record::Header { streams: 3 }));
    assert_eq!(records.last(), Some(&Record::Trailer { packets: 300 }));

    muxer.wait().await.unwrap();
    assert_eq!(muxer.state(), MuxerState::Closed);
}

#[tokio::test]
async fn test_barrier_timeout_releases_sources() {
    let mut config = PipelineConfig::default();
    config.barrier_timeout = Duration::from_millis(30);

    let (registrar, barrier) = TrackBarrier::new(2).unwrap();
    registrar
        .register(Track::new(
            0,
            TrackCodec::opus(),
            Box::new(SyntheticSource::new(1, 1)),
        ))
        .unwrap();

    let result = barrier.await_all(config.barrier_timeout).await;
    assert!(matches!(
        result,
        Err(Error::BarrierTimeout {
            expected: 2,
            arrived: 1
        })
    ));
    assert!(registrar.is_closed());
}
