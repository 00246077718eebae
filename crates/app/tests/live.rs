mod common;

use std::{num::NonZeroU64, path::Path, sync::Arc, time::Duration};

use base64::{Engine as _, engine::general_purpose};
use common::{BoxDetector, FailingDetector, MemoryChannel, NullDetector, write_solid_y4m};
use ml_core::{Detector, SharedSettings};
use serde_json::json;
use vision_app::vision::{
    config::LiveConfig,
    encoding::encode_jpeg,
    live::{Inbound, LiveSession, SessionEnd},
};
use video_io::Frame;

fn live_config(stride: u64) -> LiveConfig {
    LiveConfig {
        stride: NonZeroU64::new(stride).unwrap(),
        ..LiveConfig::default()
    }
}

fn session(detector: Arc<dyn Detector>, scratch: &Path) -> LiveSession {
    LiveSession::new(detector, SharedSettings::default(), live_config(3), scratch)
}

fn jpeg_payload(width: u32, height: u32) -> Vec<u8> {
    encode_jpeg(&Frame::solid(width, height, [120, 120, 120]), 90).unwrap()
}

fn y4m_payload(dir: &Path, frames: u64) -> Vec<u8> {
    let path = dir.join("clip.y4m");
    write_solid_y4m(&path, frames, 32, 24, [30, 60, 90]);
    let bytes = std::fs::read(&path).unwrap();
    std::fs::remove_file(&path).unwrap();
    bytes
}

fn scratch_is_empty(dir: &Path) -> bool {
    std::fs::read_dir(dir).unwrap().next().is_none()
}

#[tokio::test]
async fn malformed_relay_message_does_not_end_the_session() {
    let scratch = tempfile::tempdir().unwrap();
    let data_url = format!(
        "data:image/jpeg;base64,{}",
        general_purpose::STANDARD.encode(jpeg_payload(20, 10))
    );
    let mut channel = MemoryChannel::with_inbound([
        Inbound::Text("{this is not json".into()),
        Inbound::Text(json!({ "frame": data_url }).to_string()),
    ]);

    let end = session(Arc::new(BoxDetector), scratch.path())
        .relay(&mut channel)
        .await;

    assert_eq!(end, SessionEnd::PeerDisconnected);
    assert_eq!(channel.sent.len(), 2);
    assert_eq!(channel.sent[0], json!({ "error": "invalid JSON" }));
    let reply = &channel.sent[1];
    assert!(reply["frame"].as_str().unwrap().starts_with("data:image/jpeg;base64,"));
    assert_eq!(reply["detections"][0]["class_name"], "person");
    assert_eq!(reply["detections"][0]["bbox"], json!([1.0, 1.0, 6.0, 6.0]));
}

#[tokio::test]
async fn relay_reports_missing_frame_field() {
    let scratch = tempfile::tempdir().unwrap();
    let mut channel = MemoryChannel::with_inbound([Inbound::Text(json!({ "image": "x" }).to_string())]);

    session(Arc::new(NullDetector::default()), scratch.path())
        .relay(&mut channel)
        .await;

    assert_eq!(channel.sent, vec![json!({ "error": "invalid frame data" })]);
}

#[tokio::test]
async fn relay_accepts_raw_binary_images_and_bare_base64() {
    let scratch = tempfile::tempdir().unwrap();
    let bare = general_purpose::STANDARD.encode(jpeg_payload(8, 8));
    let mut channel = MemoryChannel::with_inbound([
        Inbound::Binary(jpeg_payload(16, 16)),
        Inbound::Text(json!({ "frame": bare }).to_string()),
    ]);

    session(Arc::new(NullDetector::default()), scratch.path())
        .relay(&mut channel)
        .await;

    assert_eq!(channel.frames().len(), 2);
    assert!(channel.sent.iter().all(|env| env["detections"] == json!([])));
}

#[tokio::test]
async fn relay_detector_failure_is_reported_per_message() {
    let scratch = tempfile::tempdir().unwrap();
    let mut channel = MemoryChannel::with_inbound([
        Inbound::Binary(jpeg_payload(8, 8)),
        Inbound::Binary(jpeg_payload(8, 8)),
    ]);

    session(Arc::new(FailingDetector::new(0)), scratch.path())
        .relay(&mut channel)
        .await;

    assert!(channel.sent[0]["error"].as_str().unwrap().contains("inference backend crashed"));
    assert!(channel.sent[1].get("frame").is_some());
}

#[tokio::test]
async fn ingestion_streams_sampled_frames_between_info_and_completion() {
    let scratch = tempfile::tempdir().unwrap();
    let payload = y4m_payload(scratch.path(), 10);
    let detector = Arc::new(NullDetector::default());
    let mut channel = MemoryChannel::with_inbound([Inbound::Binary(payload)]);

    let end = session(detector.clone(), scratch.path()).ingest(&mut channel).await;

    assert_eq!(end, SessionEnd::Completed);
    assert_eq!(detector.calls(), 4);
    assert_eq!(channel.sent.len(), 6);
    assert_eq!(channel.sent[0], json!({ "info": { "fps": 25.0, "frame_count": 10 } }));

    let frames = channel.frames();
    let indices: Vec<u64> = frames.iter().map(|f| f["frame_index"].as_u64().unwrap()).collect();
    assert_eq!(indices, vec![0, 3, 6, 9]);
    let progress: Vec<f64> = frames.iter().map(|f| f["progress"].as_f64().unwrap()).collect();
    assert!(progress.windows(2).all(|pair| pair[0] <= pair[1]));
    assert!(progress.iter().all(|&p| p < 1.0));

    let last = channel.sent.last().unwrap();
    assert_eq!(last["status"], "completed");
    assert_eq!(last["progress"], 1.0);
    assert!(scratch_is_empty(scratch.path()));
}

#[tokio::test(start_paused = true)]
async fn ingestion_paces_frame_messages() {
    let scratch = tempfile::tempdir().unwrap();
    let payload = y4m_payload(scratch.path(), 9);
    let mut channel = MemoryChannel::with_inbound([Inbound::Binary(payload)]);

    session(Arc::new(NullDetector::default()), scratch.path())
        .ingest(&mut channel)
        .await;

    let frame_times: Vec<_> = channel
        .sent
        .iter()
        .zip(&channel.sent_at)
        .filter(|(env, _)| env.get("frame").is_some())
        .map(|(_, at)| *at)
        .collect();
    assert_eq!(frame_times.len(), 3);
    for pair in frame_times.windows(2) {
        assert!(pair[1] - pair[0] >= Duration::from_millis(50));
    }
}

#[tokio::test]
async fn ingestion_stops_promptly_when_the_peer_leaves() {
    let scratch = tempfile::tempdir().unwrap();
    let payload = y4m_payload(scratch.path(), 60);
    let detector = Arc::new(NullDetector::default());
    let mut channel = MemoryChannel::with_inbound([Inbound::Binary(payload)]);
    // Info and the first frame get through, then the peer is gone.
    channel.disconnect_after = Some(2);

    let end = session(detector.clone(), scratch.path()).ingest(&mut channel).await;

    assert_eq!(end, SessionEnd::PeerDisconnected);
    assert_eq!(channel.sent.len(), 2);
    assert!(detector.calls() < 20, "worker kept decoding after disconnect");
    assert!(scratch_is_empty(scratch.path()));
}

#[tokio::test]
async fn ingestion_detector_failure_ends_with_an_error_message() {
    let scratch = tempfile::tempdir().unwrap();
    let payload = y4m_payload(scratch.path(), 10);
    let mut channel = MemoryChannel::with_inbound([Inbound::Binary(payload)]);

    let end = session(Arc::new(FailingDetector::new(2)), scratch.path())
        .ingest(&mut channel)
        .await;

    assert!(matches!(end, SessionEnd::Failed(_)));
    let last = channel.sent.last().unwrap();
    assert!(last["error"].as_str().unwrap().contains("frame 6"));
    assert!(channel.sent.iter().all(|env| env.get("status").is_none()));
    assert!(scratch_is_empty(scratch.path()));
}

#[tokio::test]
async fn ingestion_rejects_unreadable_payloads() {
    let scratch = tempfile::tempdir().unwrap();
    let mut channel = MemoryChannel::with_inbound([Inbound::Binary(b"YUV4MPEG2 garbage".to_vec())]);

    let end = session(Arc::new(NullDetector::default()), scratch.path())
        .ingest(&mut channel)
        .await;

    assert!(matches!(end, SessionEnd::Failed(_)));
    assert_eq!(channel.sent.len(), 1);
    assert!(channel.sent[0].get("error").is_some());
    assert!(scratch_is_empty(scratch.path()));
}

#[tokio::test]
async fn ingestion_expects_binary_first() {
    let scratch = tempfile::tempdir().unwrap();
    let mut channel = MemoryChannel::with_inbound([Inbound::Text("hello".into())]);

    let end = session(Arc::new(NullDetector::default()), scratch.path())
        .ingest(&mut channel)
        .await;

    assert!(matches!(end, SessionEnd::Failed(_)));
    assert_eq!(channel.sent, vec![json!({ "error": "expected a binary video payload" })]);
}

#[tokio::test]
async fn ingestion_without_payload_is_a_quiet_disconnect() {
    let scratch = tempfile::tempdir().unwrap();
    let mut channel = MemoryChannel::default();

    let end = session(Arc::new(NullDetector::default()), scratch.path())
        .ingest(&mut channel)
        .await;

    assert_eq!(end, SessionEnd::PeerDisconnected);
    assert!(channel.sent.is_empty());
}
