mod common;

use common::RecordingSink;
use futures::StreamExt;
use notification_stream::models::{Notification, NotificationPriority};
use notification_stream::stream::{
    EventSink, NotificationStreamEvent, StreamError, StreamService,
};
use notification_stream::StreamSettings;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const INTERVAL: Duration = Duration::from_secs(30);
const TIMEOUT: Duration = Duration::from_secs(60);

fn settings() -> StreamSettings {
    StreamSettings {
        ping_interval: INTERVAL,
        liveness_timeout: TIMEOUT,
        retry_ms: Some(3000),
        ..StreamSettings::default()
    }
}

fn attach(
    service: &StreamService,
    user_id: &str,
    organization_id: Option<&str>,
) -> Arc<RecordingSink> {
    let sink = RecordingSink::new();
    service
        .attach_sink(user_id, organization_id, sink.clone())
        .expect("attach sink");
    sink
}

fn notification(title: &str) -> Notification {
    Notification::new("u1", title, "body").with_priority(NotificationPriority::High)
}

#[tokio::test]
async fn test_connected_is_first_frame() {
    let service = StreamService::new(settings());
    let sink = attach(&service, "u1", Some("o1"));

    let frames = sink.frames();
    assert_eq!(frames.len(), 1);
    assert!(frames[0].starts_with("event: connected\nretry: 3000\ndata: "));
    assert!(frames[0].ends_with("\n\n"));
    service.shutdown();
}

#[tokio::test]
async fn test_send_to_user_reaches_only_that_user() {
    let service = StreamService::new(settings());
    let u1 = attach(&service, "u1", Some("o1"));
    let u2 = attach(&service, "u2", Some("o1"));

    let n = notification("Build finished");
    let report = service.send_notification_to_user("u1", &n);

    assert_eq!(report.matched, 1);
    assert_eq!(report.delivered, 1);
    let delivered = u1.frames_of("notification");
    assert_eq!(delivered.len(), 1);
    assert!(delivered[0].contains("Build finished"));
    assert!(delivered[0].contains(&format!("id: {}\n", n.id)));
    assert!(u2.frames_of("notification").is_empty());
    service.shutdown();
}

#[tokio::test]
async fn test_send_to_organization_skips_other_and_unscoped() {
    let service = StreamService::new(settings());
    let u1 = attach(&service, "u1", Some("o1"));
    let u2 = attach(&service, "u2", Some("o1"));
    let u3 = attach(&service, "u3", Some("o2"));
    let u4 = attach(&service, "u4", None);

    let report = service.send_notification_to_organization("o1", &notification("Org"));

    assert_eq!(report.delivered, 2);
    assert_eq!(u1.frames_of("notification").len(), 1);
    assert_eq!(u2.frames_of("notification").len(), 1);
    assert!(u3.frames_of("notification").is_empty());
    assert!(u4.frames_of("notification").is_empty());
    service.shutdown();
}

#[tokio::test]
async fn test_broadcast_reaches_every_connection_once() {
    let service = StreamService::new(settings());
    let sinks: Vec<_> = ["u1", "u2", "u3"]
        .iter()
        .map(|user| attach(&service, user, None))
        .collect();

    let report = service.broadcast_notification(&notification("All"));

    assert_eq!(report.delivered, 3);
    for sink in &sinks {
        assert_eq!(sink.frames_of("notification").len(), 1);
    }
    service.shutdown();
}

#[tokio::test]
async fn test_broadcast_to_thousand_connections() {
    let service = StreamService::new(settings());
    let sinks: Vec<_> = (0..1000)
        .map(|i| attach(&service, &format!("user-{}", i), None))
        .collect();

    let report = service.broadcast_notification(&notification("Scale"));

    assert_eq!(report.matched, 1000);
    assert_eq!(report.delivered, 1000);
    assert_eq!(report.failed, 0);
    assert!(sinks
        .iter()
        .all(|sink| sink.frames_of("notification").len() == 1));
    service.shutdown();
}

#[tokio::test]
async fn test_failing_sink_does_not_affect_other_recipients() {
    let service = StreamService::new(settings());
    let broken = attach(&service, "u1", None);
    let healthy = attach(&service, "u1", None);
    broken.fail_writes();

    let report = service.send_notification_to_user("u1", &notification("Hi"));

    assert_eq!(report.matched, 2);
    assert_eq!(report.delivered, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(healthy.frames_of("notification").len(), 1);
    // Eviction is left to the heartbeat
    assert_eq!(service.user_clients_count("u1"), 2);
    assert_eq!(broken.close_calls(), 0);
    service.shutdown();
}

#[tokio::test]
async fn test_custom_event_and_malformed_event() {
    let service = StreamService::new(settings());
    let sink = attach(&service, "u1", None);

    let event = NotificationStreamEvent::new("export.ready", json!({ "exportId": 7 }));
    assert_eq!(service.send_event_to_user("u1", &event).delivered, 1);

    let bad = NotificationStreamEvent::new("bad\nname", json!({}));
    assert_eq!(service.send_event_to_user("u1", &bad).delivered, 1);

    assert_eq!(sink.frames_of("export.ready").len(), 1);
    let errors = sink.frames_of("error");
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("Failed to encode event"));
    service.shutdown();
}

#[tokio::test]
async fn test_counts_track_creates_and_disconnects() {
    let service = StreamService::new(settings());
    let _a = attach(&service, "u1", Some("o1"));
    let _b = attach(&service, "u1", None);
    let c = attach(&service, "u2", Some("o1"));

    assert_eq!(service.connected_clients_count(), 3);
    assert_eq!(service.user_clients_count("u1"), 2);
    assert_eq!(service.organization_clients_count("o1"), 2);
    assert_eq!(service.connected_user_ids(), vec!["u1", "u2"]);

    assert_eq!(service.disconnect_user("u2"), 1);
    assert_eq!(c.close_calls(), 1);
    assert_eq!(service.connected_clients_count(), 2);
    assert_eq!(service.organization_clients_count("o1"), 1);
    assert_eq!(service.user_clients_count("u2"), 0);

    assert_eq!(service.disconnect_user("nobody"), 0);
    assert_eq!(service.connected_user_ids(), vec!["u1"]);
    service.shutdown();
}

#[tokio::test]
async fn test_failed_connected_write_registers_nothing() {
    let service = StreamService::new(settings());
    let sink = RecordingSink::new();
    sink.fail_writes();

    let result = service.attach_sink("u1", None, sink.clone());

    assert!(matches!(result, Err(StreamError::Sink(_))));
    assert_eq!(service.connected_clients_count(), 0);
    assert_eq!(sink.close_calls(), 1);
    service.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_silent_connection_is_evicted_once() {
    let service = StreamService::new(settings());
    let sink = attach(&service, "u1", Some("o1"));
    sink.fail_writes();

    tokio::time::sleep(TIMEOUT + INTERVAL * 2).await;

    assert_eq!(service.connected_clients_count(), 0);
    assert_eq!(service.user_clients_count("u1"), 0);
    assert_eq!(service.organization_clients_count("o1"), 0);
    assert_eq!(sink.close_calls(), 1);
    assert!(service.heartbeat_running());

    service.shutdown();
    assert_eq!(sink.close_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unread_stream_is_evicted_within_timeout_window() {
    let service = StreamService::new(settings());
    let (connection, mut body) = service.create_stream("u1", Some("o1")).unwrap();

    // Body is held open but never polled
    tokio::time::sleep(TIMEOUT + INTERVAL * 2).await;

    assert_eq!(service.connected_clients_count(), 0);
    assert_eq!(service.organization_clients_count("o1"), 0);
    assert!(connection.is_closed());
    assert!(!connection.close(), "sink was already closed by eviction");

    // Queued frames drain, then the body ends
    let mut frames = Vec::new();
    while let Some(Ok(frame)) = body.next().await {
        frames.push(String::from_utf8(frame.to_vec()).unwrap());
    }
    assert!(frames[0].starts_with("event: connected\n"));
    assert_eq!(frames.len(), 4);
    assert!(frames[1..].iter().all(|f| f.starts_with("event: ping\n")));
    service.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_reading_stream_survives_heartbeats() {
    let service = StreamService::new(settings());
    let (_connection, mut body) = service.create_stream("u1", None).unwrap();
    let reader = tokio::spawn(async move {
        let mut frames = 0;
        while body.next().await.is_some() {
            frames += 1;
        }
        frames
    });

    tokio::time::sleep(TIMEOUT * 5).await;
    assert_eq!(service.connected_clients_count(), 1);

    service.shutdown();
    let frames = reader.await.unwrap();
    assert!(frames >= 10);
}

#[tokio::test(start_paused = true)]
async fn test_responsive_connection_survives_heartbeats() {
    let service = StreamService::new(settings());
    let sink = attach(&service, "u1", None);

    tokio::time::sleep(TIMEOUT * 5).await;

    assert_eq!(service.connected_clients_count(), 1);
    assert!(sink.frames_of("ping").len() >= 9);
    service.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_manual_ping_refreshes_liveness() {
    let service = StreamService::new(settings());
    let sink = attach(&service, "u1", None);

    let report = service.ping_user("u1");
    assert_eq!(report.delivered, 1);
    assert_eq!(sink.frames_of("ping").len(), 1);

    let tick = service.run_heartbeat();
    assert_eq!(tick.pinged, 1);
    assert_eq!(tick.evicted, 0);
    service.shutdown();
}

#[tokio::test]
async fn test_shutdown_closes_every_sink_exactly_once() {
    let service = StreamService::new(settings());
    let sinks: Vec<_> = (0..5)
        .map(|i| attach(&service, &format!("u{}", i), Some("o1")))
        .collect();

    service.shutdown();
    service.shutdown();

    assert_eq!(service.connected_clients_count(), 0);
    assert!(!service.heartbeat_running());
    for sink in &sinks {
        assert_eq!(sink.close_calls(), 1);
        assert!(sink.is_closed());
    }

    let late = RecordingSink::new();
    assert!(matches!(
        service.attach_sink("u9", None, late.clone()),
        Err(StreamError::ShuttingDown)
    ));
    assert!(late.frames().is_empty());
}

#[tokio::test]
async fn test_shutdown_on_empty_service() {
    let service = StreamService::new(settings());
    service.shutdown();
    service.shutdown();
    assert!(service.is_shut_down());
}

#[tokio::test]
async fn test_capacity_limit_rejects_without_writing() {
    let service = StreamService::new(StreamSettings {
        max_connections: Some(1),
        ..settings()
    });
    let _first = attach(&service, "u1", None);

    let second = RecordingSink::new();
    let result = service.attach_sink("u2", None, second.clone());

    assert!(matches!(
        result,
        Err(StreamError::CapacityExhausted { limit: 1 })
    ));
    assert!(second.frames().is_empty());
    assert_eq!(second.close_calls(), 1);
    assert_eq!(service.connected_clients_count(), 1);
    service.shutdown();
}
