mod common;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use common::{signed, webhook_body, Harness, SIGNATURE_HEADER};
use momo_core::database::transaction_repository::{Transaction, TransactionStatus};
use momo_core::payments::providers::airtel::map_airtel_status;
use momo_core::payments::providers::mtn::map_mtn_status;
use momo_core::payments::providers::zamtel::map_zamtel_status;
use momo_core::payments::signature::{sign, verify_hmac_sha256, SignatureEncoding};
use momo_core::payments::types::CanonicalStatus;
use momo_core::services::payment_orchestrator::TransactionRequest;
use rust_decimal_macros::dec;
use serde_json::Value as JsonValue;
use tower::ServiceExt;

async fn pending(h: &Harness) -> Transaction {
    h.services
        .orchestrator
        .initiate_payment(
            &h.ctx(),
            TransactionRequest {
                provider_code: Some("mtn".to_string()),
                amount: dec!(100),
                phone_number: "0971234567".to_string(),
                ..TransactionRequest::default()
            },
        )
        .await
        .unwrap()
        .transaction
}

fn webhook(provider: &str, body: Vec<u8>, signature: Option<String>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(format!("/webhooks/{}", provider))
        .header("content-type", "application/json")
        .header("x-request-id", "req-webhook-1");
    if let Some(signature) = signature {
        builder = builder.header(SIGNATURE_HEADER, signature);
    }
    builder.body(Body::from(body)).unwrap()
}

async fn json_body(response: axum::response::Response) -> JsonValue {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

// --- signatures and status vocabularies -----------------------------------

#[test]
fn signature_must_match_exactly() {
    let good = sign(b"payload", "s", SignatureEncoding::Hex);
    assert!(verify_hmac_sha256(b"payload", &good, "s", SignatureEncoding::Hex));

    let mut tampered = good.into_bytes();
    tampered[0] = if tampered[0] == b'0' { b'1' } else { b'0' };
    let tampered = String::from_utf8(tampered).unwrap();
    assert!(!verify_hmac_sha256(b"payload", &tampered, "s", SignatureEncoding::Hex));

    let b64 = sign(b"payload", "s", SignatureEncoding::Base64);
    assert!(verify_hmac_sha256(b"payload", &b64, "s", SignatureEncoding::Base64));
    assert!(!verify_hmac_sha256(b"payload!", &b64, "s", SignatureEncoding::Base64));
}

#[test]
fn native_statuses_map_to_canonical_ones() {
    assert_eq!(map_airtel_status("TS"), CanonicalStatus::Completed);
    assert_eq!(map_airtel_status("XYZ"), CanonicalStatus::Unknown);
    assert_eq!(map_mtn_status("SUCCESSFUL"), CanonicalStatus::Completed);
    assert_eq!(map_mtn_status("FAILED"), CanonicalStatus::Failed);
    assert_eq!(map_zamtel_status("nonsense"), CanonicalStatus::Unknown);
}

// --- ingress --------------------------------------------------------------

#[tokio::test]
async fn signed_webhook_completes_the_transaction() {
    let h = Harness::new();
    let txn = pending(&h).await;
    let body = webhook_body("P1", "SUCCESSFUL");
    let signature = signed(&body);

    let response = h
        .services
        .router()
        .oneshot(webhook("mtn", body, Some(signature)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["transaction_number"], txn.transaction_number.as_str());
    assert_eq!(json["transaction_status"], "completed");

    let stored = h.services.orchestrator.find_transaction(txn.id).await.unwrap();
    assert_eq!(stored.status, TransactionStatus::Completed);
    assert_eq!(h.ledger.entries_for(txn.id).len(), 3);
}

#[tokio::test]
async fn webhook_can_reference_our_transaction_number() {
    let h = Harness::new();
    let txn = pending(&h).await;
    let body = serde_json::json!({
        "external_id": txn.transaction_number,
        "status": "FAILED",
        "reason": "payer declined"
    })
    .to_string()
    .into_bytes();
    let signature = signed(&body);

    let response = h
        .services
        .router()
        .oneshot(webhook("mtn", body, Some(signature)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let stored = h.services.orchestrator.find_transaction(txn.id).await.unwrap();
    assert_eq!(stored.status, TransactionStatus::Failed);
    assert_eq!(stored.failure_reason.as_deref(), Some("payer declined"));
}

#[tokio::test]
async fn tampered_or_unsigned_webhooks_are_rejected() {
    let h = Harness::new();
    let txn = pending(&h).await;
    let body = webhook_body("P1", "SUCCESSFUL");
    let signature = signed(&body);
    let tampered = webhook_body("P1", "FAILED");

    let response = h
        .services
        .router()
        .oneshot(webhook("mtn", tampered, Some(signature)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let json = json_body(response).await;
    assert_eq!(json["error"], "INVALID_SIGNATURE");
    assert_eq!(json["request_id"], "req-webhook-1");

    let response = h
        .services
        .router()
        .oneshot(webhook("mtn", body, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let stored = h.services.orchestrator.find_transaction(txn.id).await.unwrap();
    assert_eq!(stored.status, TransactionStatus::Pending);
    assert!(h.ledger.is_empty());
}

#[tokio::test]
async fn unknown_provider_is_not_found() {
    let h = Harness::new();
    let body = webhook_body("P1", "SUCCESSFUL");
    let signature = signed(&body);

    let response = h
        .services
        .router()
        .oneshot(webhook("vodafone", body, Some(signature)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let json = json_body(response).await;
    assert_eq!(json["error"], "UNKNOWN_PROVIDER");
}

#[tokio::test]
async fn unknown_reference_is_not_found() {
    let h = Harness::new();
    pending(&h).await;
    let body = webhook_body("P404", "SUCCESSFUL");
    let signature = signed(&body);

    let response = h
        .services
        .router()
        .oneshot(webhook("mtn", body, Some(signature)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let json = json_body(response).await;
    assert_eq!(json["error"], "TRANSACTION_NOT_FOUND");
}

#[tokio::test]
async fn malformed_payload_is_a_bad_request() {
    let h = Harness::new();
    let body = b"{not json".to_vec();
    let signature = signed(&body);

    let response = h
        .services
        .router()
        .oneshot(webhook("mtn", body, Some(signature)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = json_body(response).await;
    assert_eq!(json["error"], "INVALID_PAYLOAD");
}

#[tokio::test]
async fn redelivered_webhook_is_acknowledged_once_posted() {
    let h = Harness::new();
    let txn = pending(&h).await;
    let body = webhook_body("P1", "SUCCESSFUL");
    let signature = signed(&body);

    for _ in 0..3 {
        let response = h
            .services
            .router()
            .oneshot(webhook("mtn", body.clone(), Some(signature.clone())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    assert_eq!(h.ledger.entries_for(txn.id).len(), 3);
    let completions = h
        .services
        .orchestrator
        .audit_trail(txn.id)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.action == "webhook")
        .count();
    assert_eq!(completions, 1);
}

#[tokio::test]
async fn health_reports_reachable_providers() {
    let h = Harness::new();
    let response = h
        .services
        .router()
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["status"], "Healthy");
    assert_eq!(json["checks"]["provider:mtn"]["status"], "Up");
}
