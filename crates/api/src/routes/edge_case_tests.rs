// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the HTTP surface
//!
//! Drives the full router over the in-memory store and scripted gateway:
//! - Callback acknowledgement and signature rejection
//! - Checkout, status polling and error mapping
//! - Staff and cron authentication

use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request, StatusCode},
    Router,
};
use playhouse_billing::webhooks::{sign_payload, SIGNATURE_HEADER};
use playhouse_billing::{
    BillingService, BillingSettings, CardType, EventInfo, EventStatus, MemoryStore,
    ScriptedGateway, ScriptedStatus,
};
use serde_json::{json, Value};
use time::{Duration, OffsetDateTime};
use tower::ServiceExt;
use url::Url;
use uuid::Uuid;

use crate::{config::Config, routes::create_router, state::AppState};

const SECRET: &str = "gateway-secret";
const ADMIN: &str = "admin-token";
const CRON: &str = "cron-secret";

struct TestApp {
    router: Router,
    store: Arc<MemoryStore>,
    gateway: Arc<ScriptedGateway>,
}

fn test_app() -> TestApp {
    let url = Url::parse("https://playhouse.example/").unwrap();
    let store = Arc::new(MemoryStore::new());
    let gateway = Arc::new(ScriptedGateway::new());
    let mut settings = BillingSettings::new(url.clone());
    settings.webhook_secret = Some(SECRET.to_string());
    let billing = BillingService::new(store.clone(), gateway.clone(), settings);

    let mut config = Config::local(url);
    config.admin_api_token = Some(ADMIN.to_string());
    config.cron_secret = Some(CRON.to_string());

    TestApp {
        router: create_router(AppState::with_billing(config, billing)),
        store,
        gateway,
    }
}

impl TestApp {
    async fn send(&self, req: Request<Body>) -> (StatusCode, Value) {
        let resp = self.router.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, body)
    }

    async fn seed_card(&self) -> CardType {
        let card = CardType {
            id: Uuid::new_v4(),
            name: "10 entries".to_string(),
            entries: 10,
            price: 32_000,
            validity_months: None,
            is_active: true,
        };
        self.store.insert_card_type(card.clone()).await;
        card
    }
}

fn json_request(method: Method, uri: &str, body: Value, bearer: Option<&str>) -> Request<Body> {
    let mut req = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = bearer {
        req = req.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    req.body(Body::from(body.to_string())).unwrap()
}

fn empty_request(method: Method, uri: &str, bearer: Option<&str>) -> Request<Body> {
    let mut req = Request::builder().method(method).uri(uri);
    if let Some(token) = bearer {
        req = req.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    req.body(Body::empty()).unwrap()
}

fn checkout_body(card_type_id: Uuid) -> Value {
    json!({
        "purchase": { "kind": "pass", "card_type_id": card_type_id },
        "customer": { "name": "Noa Levi", "email": "noa@example.com", "phone": null }
    })
}

fn callback(payment_id: &str, status_code: &str) -> String {
    json!({
        "transaction_type": "Charge",
        "transaction": {
            "uid": "txn-1",
            "payment_page_request_uid": format!("page-{}", payment_id),
            "more_info": payment_id,
            "status_code": status_code,
            "amount": "320.00",
            "currency": "ILS"
        }
    })
    .to_string()
}

fn webhook_request(body: &str, signature: Option<String>) -> Request<Body> {
    let mut req = Request::builder()
        .method(Method::POST)
        .uri("/api/payments/webhook")
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(sig) = signature {
        req = req.header(SIGNATURE_HEADER, sig);
    }
    req.body(Body::from(body.to_string())).unwrap()
}

#[cfg(test)]
mod public_route_tests {
    use super::*;

    #[tokio::test]
    async fn test_health_sets_security_headers() {
        let app = test_app();
        let resp = app
            .router
            .clone()
            .oneshot(empty_request(Method::GET, "/health", None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["x-content-type-options"], "nosniff");
        assert_eq!(resp.headers()["x-frame-options"], "DENY");
    }

    #[tokio::test]
    async fn test_webhook_probe() {
        let app = test_app();
        let (status, body) = app
            .send(empty_request(Method::GET, "/api/payments/webhook", None))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    // =========================================================================
    // Checkout, callback, then the status endpoint reports completion
    // =========================================================================
    #[tokio::test]
    async fn test_checkout_callback_and_status() {
        let app = test_app();
        let card = app.seed_card().await;

        let (status, body) = app
            .send(json_request(
                Method::POST,
                "/api/payments/checkout",
                checkout_body(card.id),
                None,
            ))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["next"], "redirect");
        let payment_id = body["payment_id"].as_str().unwrap().to_string();
        assert!(body["payment_url"].as_str().unwrap().contains(&payment_id));

        let status_uri = format!("/api/payments/{}/status", payment_id);
        let (_, pending) = app.send(empty_request(Method::GET, &status_uri, None)).await;
        assert_eq!(pending["status"], "pending");

        let raw = callback(&payment_id, "000");
        let (status, ack) = app
            .send(webhook_request(&raw, Some(sign_payload(SECRET, &raw).unwrap())))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ack["result"], "processed");
        assert_eq!(ack["outcome"], "completed");

        let (_, done) = app.send(empty_request(Method::GET, &status_uri, None)).await;
        assert_eq!(done["status"], "completed");
        assert!(done["item_id"].is_string());
        assert_eq!(done["manual_refund_required"], false);
    }

    // =========================================================================
    // Status endpoint settles from the gateway when the webhook never came
    // =========================================================================
    #[tokio::test]
    async fn test_status_endpoint_verifies_with_gateway() {
        let app = test_app();
        let card = app.seed_card().await;
        let (_, body) = app
            .send(json_request(
                Method::POST,
                "/api/payments/checkout",
                checkout_body(card.id),
                None,
            ))
            .await;
        let payment_id = body["payment_id"].as_str().unwrap().to_string();

        app.gateway
            .set_status(
                &format!("page-{}", payment_id),
                ScriptedStatus::Succeeded {
                    transaction_uid: "txn-s".to_string(),
                },
            )
            .await;
        let (_, status) = app
            .send(empty_request(
                Method::GET,
                &format!("/api/payments/{}/status", payment_id),
                None,
            ))
            .await;
        assert_eq!(status["status"], "completed");
    }

    #[tokio::test]
    async fn test_status_survives_gateway_outage() {
        let app = test_app();
        let card = app.seed_card().await;
        let (_, body) = app
            .send(json_request(
                Method::POST,
                "/api/payments/checkout",
                checkout_body(card.id),
                None,
            ))
            .await;
        let payment_id = body["payment_id"].as_str().unwrap().to_string();
        app.gateway
            .set_status(&format!("page-{}", payment_id), ScriptedStatus::Unreachable)
            .await;

        let (status, body) = app
            .send(empty_request(
                Method::GET,
                &format!("/api/payments/{}/status", payment_id),
                None,
            ))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "pending");
    }

    #[tokio::test]
    async fn test_unknown_payment_status_is_404() {
        let app = test_app();
        let (status, body) = app
            .send(empty_request(
                Method::GET,
                &format!("/api/payments/{}/status", Uuid::new_v4()),
                None,
            ))
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");
    }

    #[tokio::test]
    async fn test_bad_signature_is_401() {
        let app = test_app();
        let raw = callback(&Uuid::new_v4().to_string(), "000");

        let (status, _) = app
            .send(webhook_request(&raw, Some(sign_payload("other", &raw).unwrap())))
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = app.send(webhook_request(&raw, None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_duplicate_callback_acknowledged() {
        let app = test_app();
        let card = app.seed_card().await;
        let (_, body) = app
            .send(json_request(
                Method::POST,
                "/api/payments/checkout",
                checkout_body(card.id),
                None,
            ))
            .await;
        let payment_id = body["payment_id"].as_str().unwrap().to_string();
        let raw = callback(&payment_id, "000");
        let sig = sign_payload(SECRET, &raw).unwrap();

        app.send(webhook_request(&raw, Some(sig.clone()))).await;
        let (status, ack) = app.send(webhook_request(&raw, Some(sig))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ack["result"], "duplicate");
        assert_eq!(app.store.passes().await.len(), 1);
    }

    #[tokio::test]
    async fn test_sold_out_checkout_is_409() {
        let app = test_app();
        let event = EventInfo {
            id: Uuid::new_v4(),
            title: "Music class".to_string(),
            capacity: 1,
            price: 5_000,
            start_at: OffsetDateTime::now_utc() + Duration::days(2),
            status: EventStatus::Published,
        };
        app.store.insert_event(event.clone()).await;
        let body = |name: &str| {
            json!({
                "purchase": { "kind": "event_ticket", "event_id": event.id, "ticket_type": "regular" },
                "customer": { "name": name, "email": null, "phone": null }
            })
        };

        let (first, _) = app
            .send(json_request(Method::POST, "/api/payments/checkout", body("A"), None))
            .await;
        assert_eq!(first, StatusCode::OK);
        let (second, err) = app
            .send(json_request(Method::POST, "/api/payments/checkout", body("B"), None))
            .await;
        assert_eq!(second, StatusCode::CONFLICT);
        assert_eq!(err["error"], "sold_out");

        let (_, capacity) = app
            .send(empty_request(
                Method::GET,
                &format!("/api/events/{}/capacity", event.id),
                None,
            ))
            .await;
        assert_eq!(capacity["available"], 0);
        assert_eq!(capacity["held"], 1);
    }

    #[tokio::test]
    async fn test_unknown_coupon_is_422() {
        let app = test_app();
        let (status, body) = app
            .send(json_request(
                Method::POST,
                "/api/coupons/validate",
                json!({ "code": "NOPE", "item_type": "pass", "amount": 32000 }),
                None,
            ))
            .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"], "coupon_rejected");
    }
}

#[cfg(test)]
mod protected_route_tests {
    use super::*;

    #[tokio::test]
    async fn test_cron_requires_secret() {
        let app = test_app();
        for path in [
            "/api/cron/sync-pending",
            "/api/cron/detect-stuck",
            "/api/cron/expire-abandoned",
            "/api/cron/retry-webhooks",
        ] {
            let (status, _) = app.send(empty_request(Method::POST, path, None)).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED, "{}", path);
            let (status, _) = app
                .send(empty_request(Method::POST, path, Some(ADMIN)))
                .await;
            assert_eq!(status, StatusCode::UNAUTHORIZED, "{}", path);
        }
        assert!(app.store.runs().await.is_empty());
    }

    #[tokio::test]
    async fn test_cron_runs_job_and_reports_counts() {
        let app = test_app();
        let (status, run) = app
            .send(empty_request(Method::POST, "/api/cron/expire-abandoned", Some(CRON)))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(run["job"], "expire_abandoned");
        assert_eq!(run["checked"], 0);
        assert_eq!(app.store.runs().await.len(), 1);
    }

    #[tokio::test]
    async fn test_pos_sale_and_redeem() {
        let app = test_app();
        let card = app.seed_card().await;
        let sale = json!({
            "purchase": { "kind": "pass", "card_type_id": card.id },
            "payment_type": "pos_cash",
            "recorded_by": "front-desk"
        });

        let (status, _) = app
            .send(json_request(Method::POST, "/api/pos/sales", sale.clone(), None))
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, receipt) = app
            .send(json_request(Method::POST, "/api/pos/sales", sale, Some(ADMIN)))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(receipt["payment"]["status"], "completed");
        let pass_id = receipt["entitlement"]["id"].as_str().unwrap().to_string();

        let (status, pass) = app
            .send(empty_request(
                Method::POST,
                &format!("/api/passes/{}/redeem", pass_id),
                Some(ADMIN),
            ))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(pass["remaining_entries"], 9);
    }

    #[tokio::test]
    async fn test_admin_refund_and_webhook_listing() {
        let app = test_app();
        let card = app.seed_card().await;
        let sale = json!({
            "purchase": { "kind": "pass", "card_type_id": card.id },
            "payment_type": "pos_credit",
            "recorded_by": "front-desk"
        });
        let (_, receipt) = app
            .send(json_request(Method::POST, "/api/pos/sales", sale, Some(ADMIN)))
            .await;
        let payment_id = receipt["payment"]["id"].as_str().unwrap().to_string();

        let (status, refund) = app
            .send(json_request(
                Method::POST,
                &format!("/api/admin/payments/{}/refund", payment_id),
                json!({ "reason": "changed plans", "requested_by": "manager" }),
                Some(ADMIN),
            ))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(refund["payment"]["status"], "refunded");

        let (status, _) = app
            .send(json_request(
                Method::POST,
                &format!("/api/admin/payments/{}/refund", payment_id),
                json!({ "reason": "again", "requested_by": "manager" }),
                Some(ADMIN),
            ))
            .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, list) = app
            .send(empty_request(
                Method::GET,
                "/api/admin/webhooks?status=failed",
                Some(ADMIN),
            ))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(list["webhooks"].as_array().unwrap().len(), 0);

        let (status, _) = app
            .send(empty_request(
                Method::GET,
                "/api/admin/webhooks?status=bogus",
                Some(ADMIN),
            ))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
