//! HTTP and RTMP adapters driven by real exporter sessions

mod common;

use std::sync::Arc;

use bytes::Bytes;

use mediacast::element::library::{ClipElement, PlaylistPolicy, SwitchingElement};
use mediacast::mapper::{ElementMapper, ExportSpec};
use mediacast::protocol::http::HttpStreamRequest;
use mediacast::protocol::memory::{HttpEvent, MemoryHttpConnection, MemoryRtmpConnection};
use mediacast::protocol::rtmp::PlayStream;
use mediacast::session::{Exporter, SessionState};
use mediacast::tag::DEFAULT_FLAVOUR_MASK;
use mediacast::{Capabilities, ExportConfig, MediaFormat, RequestInfo, Tag};

use common::{flv_video, Harness};

const FLV_HEADER_LEN: usize = 13;
const FLV_TAG_OVERHEAD: usize = 11 + 4;

fn add_clip(h: &Harness, name: &str, tags: Vec<Tag>) {
    h.mapper
        .add_element(ClipElement::new(name, Arc::clone(&h.media), MediaFormat::Flv, tags))
        .unwrap();
}

#[test]
fn test_http_flv_download() {
    let h = Harness::new();
    add_clip(&h, "intro", flv_video(100, 40, 25));
    h.mapper
        .add_export(ExportSpec::new("http", "intro.flv", "intro").header("Cache-Control", "no-cache"))
        .unwrap();

    let (conn, log) = MemoryHttpConnection::new(Arc::clone(&h.net), "/media/intro.flv", 100_000);
    let exporter = Exporter::new(h.context(ExportConfig::default()), HttpStreamRequest::new(conn));
    exporter.start_url("http://localhost/media/intro.flv");

    assert!(h.wait_until(|| exporter.state() == SessionState::Closed));
    assert_eq!(log.statuses(), vec![200]);
    let events = log.events();
    match &events[0] {
        HttpEvent::Begin { headers, .. } => {
            assert!(headers.contains(&("Content-Type".to_string(), "video/x-flv".to_string())));
            assert!(headers.contains(&("Cache-Control".to_string(), "no-cache".to_string())));
        }
        other => panic!("unexpected first event {:?}", other),
    }
    assert_eq!(events.last(), Some(&HttpEvent::End));

    let body = log.body();
    assert_eq!(&body[..3], b"FLV");
    assert_eq!(body.len(), FLV_HEADER_LEN + 100 * (FLV_TAG_OVERHEAD + 3));
    assert_eq!(exporter.metrics().tags_dropped, 0);

    drop(exporter);
    assert!(h.wait_until(|| log.releases() == 1));
}

#[test]
fn test_http_unknown_export_is_not_found() {
    let h = Harness::new();
    let (conn, log) = MemoryHttpConnection::new(Arc::clone(&h.net), "/media/nothing.flv", 100_000);
    let exporter = Exporter::new(h.context(ExportConfig::default()), HttpStreamRequest::new(conn));
    exporter.start_url("http://localhost/media/nothing.flv");

    assert!(h.wait_until(|| exporter.state() == SessionState::Closed));
    assert_eq!(log.statuses(), vec![404]);
    assert!(log.body().is_empty());
}

#[test]
fn test_http_backpressure_stalls_until_drained() {
    let h = Harness::new();
    let payload = Bytes::from(vec![0x27u8; 1000]);
    let tags: Vec<Tag> = (0..60)
        .map(|i| Tag::video(MediaFormat::Flv, i * 40, payload.clone(), i % 10 == 0))
        .collect();
    add_clip(&h, "big", tags);
    h.mapper.add_export(ExportSpec::new("http", "big.flv", "big")).unwrap();

    let (conn, log) = MemoryHttpConnection::new(Arc::clone(&h.net), "/media/big.flv", 10_000);
    log.set_auto_drain(false);
    let exporter = Exporter::new(h.context(ExportConfig::default()), HttpStreamRequest::new(conn));
    exporter.start_url("http://localhost/media/big.flv");

    // the wire takes tags until half the buffer is pending, then nothing
    assert!(h.wait_until(|| log.pending() >= 5_000));
    h.settle();
    let stalled = log.body().len();
    assert!(stalled < 10_000, "wrote {} bytes into a stalled wire", stalled);
    assert_eq!(exporter.state(), SessionState::Playing);

    assert!(h.wait_until(|| {
        log.drain(log.pending());
        exporter.state() == SessionState::Closed
    }));
    assert_eq!(log.body().len(), FLV_HEADER_LEN + 60 * (FLV_TAG_OVERHEAD + 1000));
    assert_eq!(exporter.metrics().tags_dropped, 0);
    assert_eq!(log.statuses(), vec![200]);
    assert_eq!(log.events().last(), Some(&HttpEvent::End));
}

#[test]
fn test_rtmp_play_to_completion() {
    let h = Harness::new();
    add_clip(&h, "intro", flv_video(20, 40, 10));

    let (conn, log) = MemoryRtmpConnection::new(Arc::clone(&h.net), 100_000);
    let exporter = Exporter::new(h.context(ExportConfig::default()), PlayStream::new(conn, 1, "intro"));
    exporter.start_request(RequestInfo {
        path: "/media/intro".to_string(),
        ..Default::default()
    });

    assert!(h.wait_until(|| exporter.state() == SessionState::Closed));
    assert_eq!(
        log.status_codes(),
        vec![
            "NetStream.Play.Reset",
            "NetStream.Play.Start",
            "NetStream.Play.Complete",
            "NetStream.Play.Stop"
        ]
    );
    let expected: Vec<u32> = (0..20).map(|i| i * 40).collect();
    assert_eq!(log.media_timestamps(), expected);
    assert!(!log.is_connection_closed());
    assert_eq!(exporter.with_protocol(|p| p.stats().video_frames), 20);
    assert_eq!(exporter.with_protocol(|p| p.stats().keyframes), 2);

    drop(exporter);
    assert!(h.wait_until(|| log.releases() == 1));
}

#[test]
fn test_rtmp_missing_stream() {
    let h = Harness::new();
    let (conn, log) = MemoryRtmpConnection::new(Arc::clone(&h.net), 100_000);
    let exporter = Exporter::new(h.context(ExportConfig::default()), PlayStream::new(conn, 1, "ghost"));
    exporter.start_request(RequestInfo {
        path: "/media/ghost".to_string(),
        ..Default::default()
    });

    assert!(h.wait_until(|| exporter.state() == SessionState::Closed));
    assert_eq!(log.status_codes(), vec!["NetStream.Play.StreamNotFound"]);
    assert!(log.media_timestamps().is_empty());
}

#[test]
fn test_rtmp_playlist_switches() {
    let h = Harness::new();
    add_clip(&h, "intro", flv_video(5, 40, 5));
    add_clip(&h, "main", flv_video(5, 40, 5));

    let mapper: Arc<dyn ElementMapper> = h.mapper.clone();
    let show = SwitchingElement::new(
        "show",
        Arc::clone(&h.media),
        &mapper,
        Capabilities::new(Some(MediaFormat::Flv), DEFAULT_FLAVOUR_MASK),
    );
    show.set_policy(Arc::new(PlaylistPolicy::new(
        "playlist",
        vec!["intro".to_string(), "main".to_string()],
        false,
    )));
    h.mapper.add_element(show.clone()).unwrap();

    let (conn, log) = MemoryRtmpConnection::new(Arc::clone(&h.net), 100_000);
    let exporter = Exporter::new(h.context(ExportConfig::default()), PlayStream::new(conn, 1, "show"));
    exporter.start_request(RequestInfo {
        path: "/media/show".to_string(),
        ..Default::default()
    });
    assert!(h.wait_until(|| exporter.state() == SessionState::Playing));
    assert!(h.media.run_and_wait(move || show.start()).unwrap());

    assert!(h.wait_until(|| exporter.state() == SessionState::Closed));
    assert_eq!(
        log.status_codes(),
        vec![
            "NetStream.Play.Reset",
            "NetStream.Play.Start",
            "NetStream.Play.Complete",
            "NetStream.Play.Switch",
            "NetStream.Play.Complete",
            "NetStream.Play.Stop"
        ]
    );
    let ts = log.media_timestamps();
    assert_eq!(ts.len(), 10);
    assert!(ts.windows(2).all(|w| w[0] <= w[1]), "{:?}", ts);
}
