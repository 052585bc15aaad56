//! Push channel tests against a local WebSocket server

use futures::{SinkExt, StreamExt};
use livebot_panel::transport::{ConnectionState, PushMessage, TransportChannel, TransportConfig};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_tungstenite::{accept_async, tungstenite::Message};

/// Poll `condition` until it holds or `timeout` passes
async fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

fn collector(channel: &TransportChannel) -> Arc<Mutex<Vec<PushMessage>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let _subscription = channel.subscribe(move |message| sink.lock().push(message.clone()));
    seen
}

#[tokio::test]
async fn test_messages_fan_out_and_malformed_frames_are_dropped() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (received_tx, received_rx) = oneshot::channel::<String>();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();

        for frame in [
            r#"{"type":"asr_result","text":"你好"}"#,
            "not json at all",
            r#"{"type":"unknown_kind"}"#,
            r#"{"type":"token_chunk","text":"Hi"}"#,
            r#"{"type":"lip_sync","timeline":[{"char":"你","beginTime":0,"endTime":200}],"audioDelay":80}"#,
        ] {
            ws.send(Message::Text(frame.to_string())).await.unwrap();
        }

        // Echo the first text frame the client sends back to the test
        while let Some(Ok(message)) = ws.next().await {
            if let Message::Text(text) = message {
                let _ = received_tx.send(text);
                break;
            }
        }

        // Stay open until the client goes away
        while ws.next().await.is_some() {}
    });

    let channel = TransportChannel::new(TransportConfig::new(format!("ws://{}", addr)));
    let first = collector(&channel);
    let second = collector(&channel);
    channel.connect();

    assert!(
        wait_for(Duration::from_secs(5), || first.lock().len() == 3 && second.lock().len() == 3)
            .await,
        "subscribers did not receive the valid frames"
    );
    assert!(channel.is_open());
    assert_eq!(channel.connect_attempts(), 1);

    let messages = first.lock().clone();
    assert_eq!(
        messages[0],
        PushMessage::SpeechRecognized {
            text: "你好".to_string()
        }
    );
    assert_eq!(
        messages[1],
        PushMessage::TokenChunk {
            text: "Hi".to_string()
        }
    );
    match &messages[2] {
        PushMessage::VisemeTimeline {
            timeline,
            estimated_delay_ms,
        } => {
            assert_eq!(timeline.len(), 1);
            assert_eq!(timeline[0].end_offset_ms, 200.0);
            assert_eq!(*estimated_delay_ms, Some(80.0));
        }
        other => panic!("unexpected message {:?}", other),
    }
    assert_eq!(*second.lock(), messages);

    assert!(channel.send(r#"{"type":"ping"}"#));
    let echoed = tokio::time::timeout(Duration::from_secs(5), received_rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(echoed, r#"{"type":"ping"}"#);

    channel.shutdown();
    assert_eq!(channel.state(), ConnectionState::ClosedPermanently);
    assert!(!channel.send("after shutdown"));
}

#[tokio::test]
async fn test_connect_is_idempotent_while_open() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                if let Ok(mut ws) = accept_async(stream).await {
                    while ws.next().await.is_some() {}
                }
            });
        }
    });

    let channel = TransportChannel::new(TransportConfig::new(format!("ws://{}", addr)));
    channel.connect();
    channel.connect();
    assert!(wait_for(Duration::from_secs(5), || channel.is_open()).await);

    channel.connect();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(channel.connect_attempts(), 1);

    channel.shutdown();
}

#[tokio::test]
async fn test_reconnect_gives_up_after_retry_budget() {
    // Reserve a port, then free it so connections are refused
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };

    let channel = TransportChannel::new(TransportConfig {
        url: format!("ws://{}", addr),
        base_delay: Duration::from_millis(10),
        max_retries: 5,
    });
    channel.connect();

    assert!(
        wait_for(Duration::from_secs(10), || {
            channel.state() == ConnectionState::ClosedPermanently
        })
        .await
    );
    // One initial attempt plus five reconnects
    assert_eq!(channel.connect_attempts(), 6);

    // Giving up is final until connect() is called again
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(channel.connect_attempts(), 6);

    channel.connect();
    assert!(wait_for(Duration::from_secs(10), || channel.connect_attempts() == 12).await);
    assert!(
        wait_for(Duration::from_secs(10), || {
            channel.state() == ConnectionState::ClosedPermanently
        })
        .await
    );
}

#[tokio::test]
async fn test_server_drop_triggers_reconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        // First connection is closed right away, the second one stays
        if let Ok((stream, _)) = listener.accept().await {
            if let Ok(mut ws) = accept_async(stream).await {
                let _ = ws.close(None).await;
            }
        }
        if let Ok((stream, _)) = listener.accept().await {
            if let Ok(mut ws) = accept_async(stream).await {
                let _ = ws
                    .send(Message::Text(r#"{"type":"playback_done"}"#.to_string()))
                    .await;
                while ws.next().await.is_some() {}
            }
        }
    });

    let channel = TransportChannel::new(TransportConfig {
        url: format!("ws://{}", addr),
        base_delay: Duration::from_millis(10),
        max_retries: 5,
    });
    let seen = collector(&channel);
    channel.connect();

    assert!(wait_for(Duration::from_secs(5), || !seen.lock().is_empty()).await);
    assert_eq!(seen.lock()[0], PushMessage::PlaybackFinished {});
    assert_eq!(channel.connect_attempts(), 2);
    assert!(channel.is_open());

    channel.shutdown();
}
