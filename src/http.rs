//! JSON-over-HTTP with retry, shared by the catalog, embedding, and LLM
//! clients.
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use anyhow::Result;
use serde_json::Value;
use std::time::Duration;

use crate::error::ShelfError;

pub fn client(timeout_secs: u64) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .user_agent(format!("shelf-insight/{}", env!("CARGO_PKG_VERSION")))
        .build()?)
}

/// POST `body` to `url` and return the decoded JSON response.
///
/// `service` names the remote end in errors (`"openai"`, `"gemini"`, ...).
pub async fn post_json(
    client: &reqwest::Client,
    service: &str,
    url: &str,
    headers: &[(&str, String)],
    body: &Value,
    max_retries: u32,
) -> Result<Value> {
    send_json(service, url, max_retries, || {
        let mut request = client.post(url).json(body);
        for (name, value) in headers {
            request = request.header(*name, value);
        }
        request
    })
    .await
}

/// GET `url` with `query` parameters and return the decoded JSON response.
pub async fn get_json(
    client: &reqwest::Client,
    service: &str,
    url: &str,
    query: &[(&str, &str)],
    max_retries: u32,
) -> Result<Value> {
    send_json(service, url, max_retries, || client.get(url).query(query)).await
}

/// Send the request built by `build`, retrying per the module policy.
async fn send_json<F>(service: &str, url: &str, max_retries: u32, build: F) -> Result<Value>
where
    F: Fn() -> reqwest::RequestBuilder,
{
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tokio::time::sleep(delay).await;
        }

        match build().send().await {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    return response.json().await.map_err(|e| {
                        ShelfError::external(service, format!("invalid JSON response: {}", e))
                            .into()
                    });
                }

                let body_text = response.text().await.unwrap_or_default();
                let err = ShelfError::external(service, format!("API error {}: {}", status, body_text));

                // Rate limited or server error; retry
                if status.as_u16() == 429 || status.is_server_error() {
                    tracing::debug!(service, %status, attempt, "request will be retried");
                    last_err = Some(err);
                    continue;
                }

                return Err(err.into());
            }
            Err(e) => {
                last_err = Some(ShelfError::external(
                    service,
                    format!("connection error ({}): {}", url, e),
                ));
                continue;
            }
        }
    }

    Err(last_err
        .unwrap_or_else(|| ShelfError::external(service, "request failed after retries"))
        .into())
}

/// Read an API key from the environment, as a configuration error if absent.
pub fn api_key(var: &str) -> Result<String> {
    match std::env::var(var) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ShelfError::config(format!("{} not set", var)).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, routing::get, Json, Router};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Serve `app` on an ephemeral local port and return its base URL.
    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn local_client() -> reqwest::Client {
        reqwest::Client::builder().no_proxy().build().unwrap()
    }

    fn external_service(err: &anyhow::Error) -> Option<&str> {
        match err.downcast_ref::<ShelfError>() {
            Some(ShelfError::ExternalService { service, .. }) => Some(service.as_str()),
            _ => None,
        }
    }

    #[tokio::test]
    async fn get_json_passes_query_and_decodes() {
        let app = Router::new().route(
            "/search.json",
            get(|axum::extract::RawQuery(q): axum::extract::RawQuery| async move {
                Json(serde_json::json!({ "query": q.unwrap_or_default() }))
            }),
        );
        let base = serve(app).await;

        let value = get_json(
            &local_client(),
            "openlibrary",
            &format!("{}/search.json", base),
            &[("title", "Dune"), ("limit", "1")],
            0,
        )
        .await
        .unwrap();
        assert_eq!(value["query"], "title=Dune&limit=1");
    }

    #[tokio::test]
    async fn non_json_body_is_external_error() {
        let app = Router::new().route("/", get(|| async { "<html>maintenance</html>" }));
        let base = serve(app).await;

        let err = get_json(&local_client(), "openlibrary", &base, &[], 0)
            .await
            .unwrap_err();
        assert_eq!(external_service(&err), Some("openlibrary"));
        assert!(err.to_string().contains("invalid JSON"));
    }

    #[tokio::test]
    async fn client_error_fails_without_retry() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let app = Router::new().route(
            "/",
            get(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    (StatusCode::NOT_FOUND, "no such work")
                }
            }),
        );
        let base = serve(app).await;

        let err = get_json(&local_client(), "openlibrary", &base, &[], 3)
            .await
            .unwrap_err();
        assert_eq!(external_service(&err), Some("openlibrary"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn server_error_is_retried() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let app = Router::new().route(
            "/",
            get(move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err((StatusCode::SERVICE_UNAVAILABLE, "busy"))
                    } else {
                        Ok(Json(serde_json::json!({ "docs": [] })))
                    }
                }
            }),
        );
        let base = serve(app).await;

        let value = get_json(&local_client(), "openlibrary", &base, &[], 1)
            .await
            .unwrap();
        assert_eq!(value["docs"], serde_json::json!([]));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
