//! Unit tests for the bearer-token middleware
//!
//! Tests cover:
//! - Missing, malformed and wrong tokens
//! - Unconfigured secrets rejecting everything
//! - Cron and admin secrets not being interchangeable

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::Body,
        http::{header::AUTHORIZATION, Request, StatusCode},
        middleware,
        routing::get,
        Router,
    };
    use playhouse_billing::{BillingService, BillingSettings, MemoryStore, ScriptedGateway};
    use tower::ServiceExt;
    use url::Url;

    use super::super::middleware::*;
    use crate::config::Config;
    use crate::state::AppState;

    fn state(cron: Option<&str>, admin: Option<&str>) -> AppState {
        let url = Url::parse("https://playhouse.example/").unwrap();
        let mut config = Config::local(url.clone());
        config.cron_secret = cron.map(String::from);
        config.admin_api_token = admin.map(String::from);
        let billing = BillingService::new(
            Arc::new(MemoryStore::new()),
            Arc::new(ScriptedGateway::new()),
            BillingSettings::new(url),
        );
        AppState::with_billing(config, billing)
    }

    fn app(state: AppState) -> Router {
        let cron = Router::new()
            .route("/cron", get(|| async { "ran" }))
            .route_layer(middleware::from_fn_with_state(
                state.clone(),
                require_cron_secret,
            ));
        let admin = Router::new()
            .route("/admin", get(|| async { "ok" }))
            .route_layer(middleware::from_fn_with_state(state.clone(), require_admin));
        cron.merge(admin).with_state(state)
    }

    async fn call(app: Router, path: &str, auth: Option<&str>) -> StatusCode {
        let mut req = Request::builder().uri(path);
        if let Some(value) = auth {
            req = req.header(AUTHORIZATION, value);
        }
        app.oneshot(req.body(Body::empty()).unwrap())
            .await
            .unwrap()
            .status()
    }

    #[tokio::test]
    async fn test_correct_cron_secret_passes() {
        let app = app(state(Some("s3cret"), None));
        assert_eq!(call(app, "/cron", Some("Bearer s3cret")).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_missing_and_malformed_tokens_rejected() {
        let s = state(Some("s3cret"), None);
        assert_eq!(call(app(s.clone()), "/cron", None).await, StatusCode::UNAUTHORIZED);
        assert_eq!(
            call(app(s.clone()), "/cron", Some("Basic s3cret")).await,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            call(app(s), "/cron", Some("Bearer ")).await,
            StatusCode::UNAUTHORIZED
        );
    }

    #[tokio::test]
    async fn test_wrong_token_rejected() {
        let app = app(state(Some("s3cret"), None));
        assert_eq!(
            call(app, "/cron", Some("Bearer s3cret-not")).await,
            StatusCode::UNAUTHORIZED
        );
    }

    #[tokio::test]
    async fn test_unconfigured_secret_rejects_everything() {
        let app = app(state(None, None));
        assert_eq!(
            call(app, "/admin", Some("Bearer anything")).await,
            StatusCode::UNAUTHORIZED
        );
    }

    #[tokio::test]
    async fn test_cron_secret_does_not_open_admin_routes() {
        let s = state(Some("cron"), Some("admin"));
        assert_eq!(
            call(app(s.clone()), "/admin", Some("Bearer cron")).await,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(call(app(s), "/admin", Some("Bearer admin")).await, StatusCode::OK);
    }

    #[test]
    fn test_tokens_match_requires_equal_length() {
        assert!(tokens_match("abc", "abc"));
        assert!(!tokens_match("abc", "abcd"));
        assert!(!tokens_match("", "abc"));
    }
}
