//! Loopback broadcast: a live feed and a clip served to in-memory clients
//!
//! Run with: cargo run --example loopback
//!
//! Set `RUST_LOG=mediacast=debug` to follow the sessions.
//!
//! ## What happens
//!
//! - A publisher thread pushes 5 seconds of synthetic FLV video into the
//!   `studio` live element, 25 frames a second with a keyframe every second
//! - Three viewers watch it: one over HTTP (`/media/studio.flv`) and two over
//!   RTMP, the second of which joins late and gets the last GOP first
//! - A fourth viewer downloads the `promo` clip from a seek point
//! - Each viewer's bytes, tags and status messages are printed at the end

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use tracing_subscriber::EnvFilter;

use mediacast::element::library::{ClipElement, LiveElement};
use mediacast::mapper::{ExportSpec, StandardMapper};
use mediacast::protocol::http::HttpStreamRequest;
use mediacast::protocol::memory::{MemoryHttpConnection, MemoryRtmpConnection};
use mediacast::protocol::rtmp::PlayStream;
use mediacast::session::{ExportContext, Exporter, SessionState};
use mediacast::stats::MemoryStatsCollector;
use mediacast::tag::DEFAULT_FLAVOUR_MASK;
use mediacast::{Capabilities, ExportConfig, MediaFormat, RequestInfo, Selector, Tag};

const FRAME_MS: i64 = 40;
const GOP: i64 = 25;

fn frame(i: i64) -> Tag {
    let keyframe = i % GOP == 0;
    let header = if keyframe { 0x17 } else { 0x27 };
    Tag::video(
        MediaFormat::Flv,
        i * FRAME_MS,
        Bytes::from(vec![header, 0x01, 0x00, 0x00, 0x00]),
        keyframe,
    )
}

fn main() -> mediacast::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mediacast=info")),
        )
        .init();

    let media = Selector::spawn("media")?;
    let net = Selector::spawn("net")?;
    let mapper = Arc::new(StandardMapper::new());
    let stats = Arc::new(MemoryStatsCollector::new());

    let studio = LiveElement::new(
        "studio",
        Arc::clone(&media),
        Capabilities::new(Some(MediaFormat::Flv), DEFAULT_FLAVOUR_MASK),
        Some(10),
    );
    mapper.add_element(studio.clone())?;
    mapper.add_element(ClipElement::new(
        "promo",
        Arc::clone(&media),
        MediaFormat::Flv,
        (0..250).map(frame).collect(),
    ))?;
    mapper.add_export(
        ExportSpec::new("http", "studio.flv", "studio").header("Cache-Control", "no-cache"),
    )?;
    mapper.add_export(ExportSpec::new("http", "promo.flv", "promo"))?;

    let ctx = ExportContext::new(mapper.clone(), Arc::clone(&media), Arc::clone(&net))
        .with_stats(stats.clone())
        .with_config(ExportConfig::default().max_write_ahead_ms(0));

    let (conn, http_log) = MemoryHttpConnection::new(Arc::clone(&net), "/media/studio.flv", 100_000);
    let http_viewer = Exporter::new(ctx.clone(), HttpStreamRequest::new(conn));
    http_viewer.start_url("http://localhost/media/studio.flv?wsi=demo&wci=http-1");

    let play = |name: &str| RequestInfo {
        path: format!("/media/{}", name),
        ..Default::default()
    };
    let (conn, rtmp_log) = MemoryRtmpConnection::new(Arc::clone(&net), 100_000);
    let rtmp_viewer = Exporter::new(ctx.clone(), PlayStream::new(conn, 1, "studio"));
    rtmp_viewer.start_request(play("studio"));

    let (conn, promo_log) = MemoryHttpConnection::new(Arc::clone(&net), "/media/promo.flv", 100_000);
    let promo_viewer = Exporter::new(ctx.clone(), HttpStreamRequest::new(conn));
    promo_viewer.start_url("http://localhost/media/promo.flv?wsp=4000");

    while studio.subscriber_count() < 2 {
        thread::sleep(Duration::from_millis(10));
    }

    studio.start_publishing(1)?;
    let publisher = {
        let studio = Arc::clone(&studio);
        thread::spawn(move || {
            for i in 0..125 {
                studio.publish(frame(i));
                thread::sleep(Duration::from_millis(FRAME_MS as u64 / 4));
            }
        })
    };

    thread::sleep(Duration::from_millis(500));
    let (conn, late_log) = MemoryRtmpConnection::new(Arc::clone(&net), 100_000);
    let late_viewer = Exporter::new(ctx.clone(), PlayStream::new(conn, 1, "studio"));
    late_viewer.start_request(play("studio"));

    if publisher.join().is_err() {
        tracing::error!("Publisher thread panicked");
    }
    studio.stop_publishing(1);
    studio.end_source();

    for viewer in [&http_viewer, &promo_viewer] {
        while viewer.state() != SessionState::Closed {
            thread::sleep(Duration::from_millis(10));
        }
    }
    for viewer in [&rtmp_viewer, &late_viewer] {
        while viewer.state() != SessionState::Closed {
            thread::sleep(Duration::from_millis(10));
        }
    }

    println!(
        "http studio: statuses={:?} body={} bytes, {:?}",
        http_log.statuses(),
        http_log.body().len(),
        http_viewer.metrics()
    );
    println!(
        "http promo:  statuses={:?} body={} bytes, first ts={:?}",
        promo_log.statuses(),
        promo_log.body().len(),
        promo_viewer.metrics().first_media_ts
    );
    for (name, log, viewer) in [("rtmp", &rtmp_log, &rtmp_viewer), ("rtmp late", &late_log, &late_viewer)] {
        let ts = log.media_timestamps();
        println!(
            "{}: statuses={:?} frames={} first ts={:?} keyframes={}",
            name,
            log.status_codes(),
            ts.len(),
            ts.first(),
            viewer.with_protocol(|p| p.stats().keyframes)
        );
    }

    drop((http_viewer, promo_viewer, rtmp_viewer, late_viewer));
    while stats.open_streams() > 0 {
        thread::sleep(Duration::from_millis(10));
    }
    println!("streams recorded: {}", stats.stream_ends().len());

    media.stop_and_join();
    net.stop_and_join();
    Ok(())
}
