//! HTTP client for the WMS change feed.
//!
//! `GET {base}/changes/{category}?since=<rfc3339>` with a bearer token
//! returns a JSON array of [`RemoteChange`] values.

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::debug;

use crate::types::EventGroup;
use crate::worker::{ReconciliationSource, RemoteChange, SourceError};

/// Longest error body kept in a [`SourceError::Status`].
const MAX_ERROR_BODY: usize = 512;

#[derive(Clone)]
pub struct WmsClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl WmsClient {
    pub fn new(
        base_url: impl Into<String>,
        token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, SourceError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("wms-sync/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(WmsClient {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    fn changes_url(&self, group: EventGroup) -> String {
        format!("{}/changes/{}", self.base_url, group)
    }
}

impl ReconciliationSource for WmsClient {
    async fn fetch_recent(
        &self,
        group: EventGroup,
        since: DateTime<Utc>,
    ) -> Result<Vec<RemoteChange>, SourceError> {
        let url = self.changes_url(group);
        let since = since.to_rfc3339_opts(SecondsFormat::Secs, true);
        debug!(%url, %since, "Fetching WMS changes");

        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .query(&[("since", since.as_str())])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let mut body = response.text().await.unwrap_or_default();
            if body.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
            }
            return Err(SourceError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| SourceError::Invalid(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::at;
    use axum::extract::{Path, Query};
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::{Value, json};
    use std::collections::HashMap;

    /// Serves `router` on an ephemeral port and returns its base URL.
    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn client(base: &str) -> WmsClient {
        WmsClient::new(base, "t0ken", Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let c = client("http://wms.local/api/");
        assert_eq!(c.changes_url(EventGroup::Stock), "http://wms.local/api/changes/stock");
    }

    #[tokio::test]
    async fn fetches_changes_with_auth_and_since() {
        let router = Router::new().route(
            "/changes/{category}",
            get(
                |Path(category): Path<String>,
                 Query(q): Query<HashMap<String, String>>,
                 headers: HeaderMap| async move {
                    let auth = headers
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    if auth != "Bearer t0ken" {
                        return (StatusCode::UNAUTHORIZED, Json(Value::Null));
                    }
                    (
                        StatusCode::OK,
                        Json(json!([{
                            "event_type": format!("{category}.updated"),
                            "entity_key": "SKU-1",
                            "changed_at": q["since"],
                            "payload": {"qty": 3}
                        }])),
                    )
                },
            ),
        );
        let base = serve(router).await;

        let changes = client(&base)
            .fetch_recent(EventGroup::Stock, at(0))
            .await
            .unwrap();

        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].event_type.to_string(), "stock.updated");
        assert_eq!(changes[0].changed_at, at(0));
        assert_eq!(changes[0].payload, json!({"qty": 3}));
    }

    #[tokio::test]
    async fn error_status_is_reported() {
        let router = Router::new().route(
            "/changes/{category}",
            get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "maintenance") }),
        );
        let base = serve(router).await;

        let err = client(&base)
            .fetch_recent(EventGroup::Order, at(0))
            .await
            .unwrap_err();

        match err {
            SourceError::Status { status, body } => {
                assert_eq!(status, 503);
                assert_eq!(body, "maintenance");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn unparsable_body_is_invalid() {
        let router = Router::new().route("/changes/{category}", get(|| async { "not json" }));
        let base = serve(router).await;

        let err = client(&base)
            .fetch_recent(EventGroup::Article, at(0))
            .await
            .unwrap_err();

        assert!(matches!(err, SourceError::Invalid(_)));
    }
}
