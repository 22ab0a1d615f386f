//! Send-window behavior: fill and release, parked waiters, deadlines.

mod support;

use std::time::Duration;

use bytes::Bytes;
use streamux::{address, stream_close, stream_wait, stream_write, HostSocket, StreamError, StreamOptions};
use support::*;

fn window_options(max: i64) -> StreamOptions {
    StreamOptions {
        max_buf_size: max,
        min_buf_size: 0,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_window_fill_and_release() {
    let sink = CaptureSink::new();
    let host = HostSocket::new(sink.clone());
    let id = client_stream(&host, &window_options(100), settings(77, false, true), None);
    let stream = address(id).unwrap();

    stream_write(id, Bytes::from(vec![1u8; 40])).unwrap();
    stream_write(id, Bytes::from(vec![2u8; 40])).unwrap();
    assert_eq!(stream.produced(), 80);

    // A write is admissible while produced < remote_consumed + window, so
    // the window gates the write after this one.
    stream_write(id, Bytes::from(vec![3u8; 40])).unwrap();
    assert_eq!(stream.produced(), 120);
    assert_eq!(
        stream_write(id, Bytes::from(vec![4u8; 40])).unwrap_err(),
        StreamError::WindowFull
    );
    assert_eq!(stream.produced(), 120);

    inject_feedback(&host, id, 77, 40);
    assert_eq!(stream.remote_consumed(), 40);
    stream_write(id, Bytes::from(vec![5u8; 40])).unwrap();
    assert_eq!(stream.produced(), 160);

    // Every accepted write reached the socket; the rejected one did not.
    assert_eq!(sink.data_frames().len(), 4);
    for (header, payload) in sink.data_frames() {
        assert_eq!(header.stream_id, 77);
        assert_eq!(header.source_stream_id, id);
        assert_eq!(payload.len(), 40);
    }
    stream_close(id);
}

#[tokio::test(start_paused = true)]
async fn test_parked_waiter_resumes_on_feedback() {
    let host = HostSocket::new(CaptureSink::new());
    let id = client_stream(&host, &window_options(100), settings(77, false, true), None);

    stream_write(id, Bytes::from(vec![0u8; 120])).unwrap();
    assert_eq!(
        stream_write(id, Bytes::from(vec![0u8; 1])).unwrap_err(),
        StreamError::WindowFull
    );

    let started = tokio::time::Instant::now();
    let waiter = tokio::spawn(stream_wait(id, Some(Duration::from_secs(1))));
    // Let the waiter park before credit returns.
    for _ in 0..4 {
        tokio::task::yield_now().await;
    }

    tokio::time::sleep(Duration::from_millis(200)).await;
    inject_feedback(&host, id, 77, 40);

    assert_eq!(waiter.await.unwrap(), Ok(()));
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_secs(1));

    // The freed credit is usable immediately.
    stream_write(id, Bytes::from(vec![0u8; 10])).unwrap();
    stream_close(id);
}

#[tokio::test(start_paused = true)]
async fn test_waiter_deadline_fires() {
    let host = HostSocket::new(CaptureSink::new());
    let id = client_stream(&host, &window_options(100), settings(77, false, true), None);
    let stream = address(id).unwrap();

    stream_write(id, Bytes::from(vec![0u8; 120])).unwrap();

    let started = tokio::time::Instant::now();
    assert_eq!(
        stream_wait(id, Some(Duration::from_millis(50))).await,
        Err(StreamError::TimedOut)
    );
    assert!(started.elapsed() >= Duration::from_millis(50));

    // The stream is untouched: later feedback still lands.
    assert!(!stream.is_closed());
    inject_feedback(&host, id, 77, 60);
    assert_eq!(stream.remote_consumed(), 60);
    stream_write(id, Bytes::from(vec![0u8; 10])).unwrap();
    stream_close(id);
}

#[tokio::test]
async fn test_unbounded_stream_never_blocks() {
    let host = HostSocket::new(CaptureSink::new());
    let id = client_stream(&host, &window_options(0), settings(77, false, true), None);
    let stream = address(id).unwrap();

    for _ in 0..50 {
        stream_write(id, Bytes::from(vec![0u8; 1 << 16])).unwrap();
    }
    // Nothing is counted and a wait resolves on the spot.
    assert_eq!(stream.produced(), 0);
    assert_eq!(stream_wait(id, Some(Duration::from_millis(1))).await, Ok(()));
    stream_close(id);
}

#[tokio::test]
async fn test_stale_feedback_is_ignored() {
    let host = HostSocket::new(CaptureSink::new());
    let id = client_stream(&host, &window_options(100), settings(77, false, true), None);
    let stream = address(id).unwrap();

    stream_write(id, Bytes::from(vec![0u8; 80])).unwrap();
    inject_feedback(&host, id, 77, 50);
    inject_feedback(&host, id, 77, 30);
    assert_eq!(stream.remote_consumed(), 50);
    stream_close(id);
}

#[tokio::test]
async fn test_wait_on_unknown_stream_is_invalid() {
    assert_eq!(
        stream_wait(0xdead_beef, None).await,
        Err(StreamError::InvalidStream)
    );
}
