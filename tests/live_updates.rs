//! Live floor-plan streams over server-sent events.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use chrono::{Offset, Utc};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;
use ulid::Ulid;

use seatline::api::{self, AdminAuth, AppState};
use seatline::engine::{BusinessHours, Engine};
use seatline::mailer::LogMailer;
use seatline::model::{Geometry, ReservationRequest, UPDATE_EVENT};
use seatline::notify::{Dispatcher, NotifyHub};

async fn setup() -> (Router, Arc<Engine>, Ulid) {
    let dir = std::env::temp_dir().join(format!("seatline_live_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(NotifyHub::new()),
        Arc::new(LogMailer),
        "http://localhost:8080".into(),
        Duration::from_secs(1),
    ));
    let hours = BusinessHours::new(0, 24, Utc.fix()).unwrap();
    let engine = Arc::new(Engine::new(dir.join("reservations.wal"), dispatcher, hours).unwrap());

    let t1 = Ulid::new();
    engine.create_table(t1, "T1", Geometry::default(), 4).await.unwrap();
    engine.create_table(Ulid::new(), "T2", Geometry::default(), 2).await.unwrap();

    let admin = AdminAuth::new("unused".into(), vec![]);
    (api::router(AppState::new(engine.clone(), admin, 64)), engine, t1)
}

fn booking(table: Ulid) -> ReservationRequest {
    let day = Utc::now().date_naive() + chrono::Duration::days(2);
    ReservationRequest {
        name: Some("Ada Lovelace".into()),
        email: Some("ada@example.com".into()),
        date: Some(day.to_string()),
        start_time: Some(format!("{day}T18:00")),
        end_time: Some(format!("{day}T20:00")),
        table_ids: vec![table],
    }
}

/// Reads whole SSE events off a response body.
struct EventReader {
    body: Body,
    buffer: String,
}

impl EventReader {
    fn new(body: Body) -> Self {
        Self {
            body,
            buffer: String::new(),
        }
    }

    /// Next `reservation:update` payload, skipping keep-alive comments.
    async fn next(&mut self) -> Value {
        loop {
            if let Some(end) = self.buffer.find("\n\n") {
                let raw: String = self.buffer.drain(..end + 2).collect();
                let mut event = None;
                let mut data = None;
                for line in raw.lines() {
                    if let Some(name) = line.strip_prefix("event:") {
                        event = Some(name.trim().to_string());
                    } else if let Some(payload) = line.strip_prefix("data:") {
                        data = Some(payload.trim().to_string());
                    }
                }
                if let (Some(event), Some(data)) = (event, data) {
                    assert_eq!(event, UPDATE_EVENT);
                    return serde_json::from_str(&data).unwrap();
                }
                continue;
            }

            let frame = tokio::time::timeout(Duration::from_secs(5), self.body.frame())
                .await
                .expect("timed out waiting for an event")
                .expect("stream ended")
                .unwrap();
            if let Ok(bytes) = frame.into_data() {
                self.buffer.push_str(std::str::from_utf8(&bytes).unwrap());
            }
        }
    }
}

async fn open(router: &Router, uri: &str) -> (StatusCode, Body) {
    let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    if status == StatusCode::OK {
        let content_type = response.headers().get(header::CONTENT_TYPE).unwrap();
        assert!(content_type.to_str().unwrap().starts_with("text/event-stream"));
    }
    (status, response.into_body())
}

#[tokio::test]
async fn floor_stream_starts_with_snapshot() {
    let (router, engine, t1) = setup().await;
    let (status, body) = open(&router, "/api/events").await;
    assert_eq!(status, StatusCode::OK);
    let mut events = EventReader::new(body);

    let first = events.next().await;
    assert_eq!(first["kind"], "snapshot");
    assert_eq!(first["data"].as_array().unwrap().len(), 2);

    let r = engine.create_reservation(booking(t1), Utc::now().timestamp_millis()).await.unwrap();
    let update = events.next().await;
    assert_eq!(update["kind"], "table");
    assert_eq!(update["data"]["id"], r.table_ids[0].to_string());
    assert_eq!(update["data"]["reservations"][0]["id"], r.id.to_string());
    assert_eq!(update["data"]["reservations"][0]["status"], "PENDING");

    engine.cancel(r.id, Utc::now().timestamp_millis()).await.unwrap();
    let update = events.next().await;
    assert!(update["data"]["reservations"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn table_stream_only_sees_its_table() {
    let (router, engine, t1) = setup().await;
    let t3 = Ulid::new();
    engine.create_table(t3, "T3", Geometry::default(), 2).await.unwrap();

    let (status, body) = open(&router, &format!("/api/events/tables/{t1}")).await;
    assert_eq!(status, StatusCode::OK);
    let mut events = EventReader::new(body);

    let first = events.next().await;
    assert_eq!(first["kind"], "table");
    assert_eq!(first["data"]["label"], "T1");

    // a booking elsewhere is not delivered; the next event is about T1
    let now = Utc::now().timestamp_millis();
    engine.create_reservation(booking(t3), now).await.unwrap();
    let r = engine.create_reservation(booking(t1), now).await.unwrap();
    let update = events.next().await;
    assert_eq!(update["data"]["label"], "T1");
    assert_eq!(update["data"]["reservations"][0]["id"], r.id.to_string());
}

#[tokio::test]
async fn unknown_table_stream_is_404() {
    let (router, _, _) = setup().await;
    let (status, _) = open(&router, &format!("/api/events/tables/{}", Ulid::new())).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = open(&router, "/api/events/tables/not-an-id").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
