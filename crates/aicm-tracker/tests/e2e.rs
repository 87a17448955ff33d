// SPDX-FileCopyrightText: 2026 AICM Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end scenarios against a mocked tracking API.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use aicm_tracker::{
    AicmError, DeliveryType, SchemaSet, SettingsOverrides, TrackOptions, TrackRequest,
    TrackStatus, Tracker, UsageSchema,
};
use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn base_overrides(server: &MockServer) -> SettingsOverrides {
    SettingsOverrides {
        api_key: Some("sk-e2e-test".to_string()),
        api_base: Some(server.uri()),
        timeout: Some(5.0),
        ..SettingsOverrides::default()
    }
}

async fn immediate_tracker(server: &MockServer) -> Tracker {
    Tracker::builder()
        .settings(base_overrides(server))
        .delivery_type(DeliveryType::Immediate)
        .without_store()
        .build()
        .await
        .unwrap()
}

fn queued_body(ids: &[&str]) -> serde_json::Value {
    json!({
        "results": ids
            .iter()
            .map(|id| json!({"response_id": id, "status": "queued"}))
            .collect::<Vec<_>>()
    })
}

// Scenario: immediate happy path. One call, one POST, no retries.
#[tokio::test]
async fn immediate_happy_path() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/track"))
        .and(body_partial_json(json!({
            "records": [{
                "response_id": "r1",
                "service_key": "openai::gpt-4o-mini",
                "usage": {"input_tokens": 10, "output_tokens": 20}
            }]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [{"response_id": "r1", "status": "queued", "cost_event_id": "ce-1"}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let tracker = immediate_tracker(&server).await;
    let result = tracker
        .track_with(
            "openai::gpt-4o-mini",
            json!({"input_tokens": 10, "output_tokens": 20}),
            TrackOptions {
                response_id: Some("r1".to_string()),
                ..TrackOptions::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(result.response_id, "r1");
    assert_eq!(result.status, TrackStatus::Delivered);
    assert_eq!(result.cost_event_id.as_deref(), Some("ce-1"));
    tracker.close().await.unwrap();
}

// Scenario: a cached LIMIT matches the record. The record is still sent;
// the limit surfaces as an error afterwards.
#[tokio::test]
async fn limit_triggered_after_send() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/track"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [{"response_id": "r2", "status": "queued"}],
            "triggered_limits": [{
                "limit_id": "L1",
                "threshold_type": "LIMIT",
                "api_key_id": "K",
                "service_key": "openai::gpt-4o-mini"
            }]
        })))
        .expect(2)
        .mount(&server)
        .await;

    let tracker = Tracker::builder()
        .settings(SettingsOverrides {
            limits_enabled: Some(true),
            ..base_overrides(&server)
        })
        .delivery_type(DeliveryType::Immediate)
        .without_store()
        .build()
        .await
        .unwrap();

    // The response itself carries the limit, so enforcement trips on the
    // same call that delivered the record.
    let err = tracker
        .track_with(
            "openai::gpt-4o-mini",
            json!({"input_tokens": 5}),
            TrackOptions {
                response_id: Some("r2".to_string()),
                ..TrackOptions::default()
            },
        )
        .await
        .unwrap_err();
    let AicmError::LimitExceeded { limit_id, .. } = err else {
        panic!("expected LimitExceeded, got {err}");
    };
    assert_eq!(limit_id, "L1");

    // Subsequent calls keep sending (usage is never dropped) and keep
    // raising.
    let err = tracker
        .track("openai::gpt-4o-mini", json!({"input_tokens": 1}))
        .await
        .unwrap_err();
    assert!(matches!(err, AicmError::LimitExceeded { .. }));

    // A different service key is not blocked.
    tracker.close().await.unwrap();
}

// Scenario: two 503s then success within one track call, MAX_ATTEMPTS=3.
#[tokio::test]
async fn transient_5xx_is_retried_within_one_call() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/track"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/track"))
        .respond_with(ResponseTemplate::new(200).set_body_json(queued_body(&["r1"])))
        .expect(1)
        .mount(&server)
        .await;

    let tracker = immediate_tracker(&server).await;
    let result = tracker
        .track_with(
            "openai::gpt-4o-mini",
            json!({"input_tokens": 1}),
            TrackOptions {
                response_id: Some("r1".to_string()),
                ..TrackOptions::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(result.status, TrackStatus::Delivered);
    tracker.close().await.unwrap();
}

// Scenario: durable queue. Records enqueued before a "crash" are delivered
// exactly once by a fresh tracker pointed at the same file.
#[tokio::test]
async fn persistent_queue_survives_restart() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("queue.db");

    // First incarnation can never reach the server.
    Mock::given(method("POST"))
        .and(path("/api/v1/track"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let overrides = SettingsOverrides {
        db_path: Some(db_path.clone()),
        max_attempts: Some(1),
        poll_interval: Some(0.02),
        batch_interval: Some(0.02),
        ..base_overrides(&server)
    };

    {
        let tracker = Tracker::builder()
            .settings(overrides.clone())
            .without_store()
            .build()
            .await
            .unwrap();
        let result = tracker
            .track_with(
                "openai::gpt-4o-mini",
                json!({"input_tokens": 3}),
                TrackOptions {
                    response_id: Some("r3".to_string()),
                    ..TrackOptions::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(result.status, TrackStatus::Accepted);
        tracker.close_within(Duration::from_secs(2)).await.unwrap();
    }

    // Restart against a healthy server.
    server.reset().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/track"))
        .respond_with(ResponseTemplate::new(200).set_body_json(queued_body(&["r3"])))
        .expect(1)
        .mount(&server)
        .await;

    let tracker = Tracker::builder()
        .settings(overrides)
        .without_store()
        .build()
        .await
        .unwrap();
    for _ in 0..500 {
        if tracker.health().await.delivered == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(tracker.health().await.delivered, 1);
    tracker.close().await.unwrap();
}

// Scenario: unknown service key. Settled without error or retry.
#[tokio::test]
async fn service_key_unknown_is_terminal_but_not_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/track"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [{"response_id": "r", "status": "service_key_unknown"}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let tracker = immediate_tracker(&server).await;
    let result = tracker
        .track_with(
            "unknown::x",
            json!({"n": 1}),
            TrackOptions {
                response_id: Some("r".to_string()),
                ..TrackOptions::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(result.status, TrackStatus::ServiceKeyUnknown);
    tracker.close().await.unwrap();
}

// Validation failures propagate synchronously; nothing reaches the wire.
#[tokio::test]
async fn schema_violation_never_reaches_the_server() {
    let server = MockServer::start().await;

    let mut fields = BTreeMap::new();
    fields.insert(
        "input_tokens".to_string(),
        aicm_core::FieldSpec {
            kind: aicm_core::FieldKind::Integer,
            required: true,
        },
    );
    let mut schemas = SchemaSet::new();
    schemas.insert(
        "openai::*",
        UsageSchema {
            fields,
            allow_extra: false,
        },
    );

    let tracker = Tracker::builder()
        .settings(base_overrides(&server))
        .delivery_type(DeliveryType::Immediate)
        .without_store()
        .schemas(schemas)
        .build()
        .await
        .unwrap();

    let err = tracker
        .track("openai::gpt-4o-mini", json!({"input_tokens": "ten"}))
        .await
        .unwrap_err();
    assert!(matches!(err, AicmError::Validation { .. }));
    assert!(server.received_requests().await.unwrap().is_empty());
    tracker.close().await.unwrap();
}

// Batches through the immediate strategy are one atomic POST.
#[tokio::test]
async fn immediate_batch_is_one_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/track"))
        .respond_with(ResponseTemplate::new(200).set_body_json(queued_body(&["a", "b", "c"])))
        .expect(1)
        .mount(&server)
        .await;

    let tracker = immediate_tracker(&server).await;
    let results = tracker
        .track_batch(vec![
            TrackRequest {
                options: TrackOptions {
                    response_id: Some("a".to_string()),
                    ..TrackOptions::default()
                },
                ..TrackRequest::new("svc::x", json!({"n": 1}))
            },
            TrackRequest {
                options: TrackOptions {
                    response_id: Some("b".to_string()),
                    ..TrackOptions::default()
                },
                ..TrackRequest::new("svc::x", json!({"n": 2}))
            },
            TrackRequest {
                options: TrackOptions {
                    response_id: Some("c".to_string()),
                    ..TrackOptions::default()
                },
                ..TrackRequest::new("svc::x", json!({"n": 3}))
            },
        ])
        .await
        .unwrap();
    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|r| r.status == TrackStatus::Delivered));
    tracker.close().await.unwrap();
}

// Tracker defaults apply when a call omits customer key and context.
#[tokio::test]
async fn tracker_defaults_fill_omitted_fields() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/track"))
        .and(body_partial_json(json!({
            "records": [{"customer_key": "acme", "context": {"env": "prod"}}]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(queued_body(&["r1"])))
        .expect(1)
        .mount(&server)
        .await;

    let tracker = immediate_tracker(&server).await;
    tracker.set_customer_key("acme");
    let mut context = serde_json::Map::new();
    context.insert("env".to_string(), json!("prod"));
    tracker.set_context(context);

    tracker
        .track_with(
            "svc::x",
            json!({"n": 1}),
            TrackOptions {
                response_id: Some("r1".to_string()),
                ..TrackOptions::default()
            },
        )
        .await
        .unwrap();
    tracker.close().await.unwrap();
}

// Using the tracker after close fails fast.
#[tokio::test]
async fn closed_tracker_rejects_calls() {
    let server = MockServer::start().await;
    let tracker = immediate_tracker(&server).await;
    tracker.close().await.unwrap();
    // close() is idempotent.
    tracker.close().await.unwrap();
    let err = tracker.track("svc::x", json!({"n": 1})).await.unwrap_err();
    assert!(matches!(err, AicmError::Closed));
}

// Blocking wrappers work from a non-runtime thread.
#[tokio::test(flavor = "multi_thread")]
async fn blocking_wrapper_from_plain_thread() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/track"))
        .respond_with(ResponseTemplate::new(200).set_body_json(queued_body(&["r1"])))
        .mount(&server)
        .await;

    let tracker = Arc::new(immediate_tracker(&server).await);
    let handle = tokio::runtime::Handle::current();
    let worker_tracker = Arc::clone(&tracker);
    let result = tokio::task::spawn_blocking(move || {
        worker_tracker.track_blocking(&handle, "svc::x", json!({"n": 1}))
    })
    .await
    .unwrap()
    .unwrap();
    assert_eq!(result.status, TrackStatus::Delivered);
    tracker.close().await.unwrap();
}
