//! Recording a remote participant during a connected call

mod common;

use common::{connect_pair, TestClient, TestNet};
use huddle_core::{CallEvent, MediaFrame, PeerId};
use pretty_assertions::assert_eq;
use std::time::Duration;

/// Session peers are tracked asynchronously, so retry until one is recordable
async fn start_recording(client: &TestClient) -> PeerId {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match client.service.start_recording().await {
                Ok(peer) => return peer,
                Err(_) => tokio::time::sleep(Duration::from_millis(5)).await,
            }
        }
    })
    .await
    .expect("no recordable peer")
}

async fn publish_frames(client: &TestClient, frames: &[&[u8]]) {
    let stream = client.service.local_stream().await.unwrap();
    for frame in frames {
        assert!(stream.publish(MediaFrame::video(frame.to_vec())));
    }
    // Let the loopback relay and the recorder drain
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn records_remote_video() {
    let net = TestNet::new();
    let mut alice = net.client("u1", "alice").await;
    let mut bob = net.client("u2", "bob").await;
    connect_pair(&mut alice, &mut bob, true).await;

    let peer = start_recording(&alice).await;
    assert_eq!(Some(peer.clone()), bob.service.local_peer_id());
    alice
        .expect(|e| matches!(e, CallEvent::RecordingStarted { .. }))
        .await;
    assert!(alice.service.start_recording().await.is_err());

    publish_frames(&bob, &[b"ab", b"cd", b"ef"]).await;

    let artifact = alice.service.stop_recording().await.unwrap();
    assert_eq!(artifact.mime_type, "video/webm");
    assert_eq!(artifact.peer, peer);
    assert_eq!(artifact.frame_count, 3);
    assert_eq!(artifact.data.as_ref(), b"abcdef");
    assert!(artifact.file_name().starts_with("call-recording-"));
    assert!(artifact.file_name().ends_with(".webm"));

    alice
        .expect(|e| matches!(e, CallEvent::RecordingFinished { .. }))
        .await;
    assert!(alice.service.stop_recording().await.is_err());
}

#[tokio::test]
async fn muted_camera_frames_are_not_recorded() {
    let net = TestNet::new();
    let mut alice = net.client("u1", "alice").await;
    let mut bob = net.client("u2", "bob").await;
    connect_pair(&mut alice, &mut bob, true).await;

    start_recording(&alice).await;
    publish_frames(&bob, &[b"on"]).await;

    assert_eq!(bob.service.toggle_camera().await, Some(false));
    let stream = bob.service.local_stream().await.unwrap();
    assert!(!stream.publish(MediaFrame::video(b"off".to_vec())));

    let artifact = alice.service.stop_recording().await.unwrap();
    assert_eq!(artifact.frame_count, 1);
    assert_eq!(artifact.data.as_ref(), b"on");
}

#[tokio::test]
async fn hang_up_finishes_running_recording() {
    let net = TestNet::new();
    let mut alice = net.client("u1", "alice").await;
    let mut bob = net.client("u2", "bob").await;
    connect_pair(&mut alice, &mut bob, false).await;

    start_recording(&alice).await;
    alice.service.hang_up().await.unwrap();

    let finished = alice
        .expect(|e| matches!(e, CallEvent::RecordingFinished { .. }))
        .await;
    match finished {
        CallEvent::RecordingFinished { artifact } => {
            assert_eq!(artifact.mime_type, "audio/webm");
            assert_eq!(artifact.frame_count, 0);
        }
        other => panic!("unexpected {other:?}"),
    }
    alice
        .expect(|e| matches!(e, CallEvent::CallEnded { .. }))
        .await;
}

#[tokio::test]
async fn recording_needs_a_session() {
    let net = TestNet::new();
    let alice = net.client("u1", "alice").await;
    assert!(alice.service.start_recording().await.is_err());
    assert!(alice.service.stop_recording().await.is_err());
}
