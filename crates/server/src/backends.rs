use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use gatehouse_core::config::BackendConfig;
use gatehouse_core::{
    Backend, BackendCallError, BackendId, BackendRegistry, BackendRequest, BackendResponse,
};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tracing::debug;

/// JSON-over-HTTP backend. The request is POSTed as a JSON body and the
/// response must be a single JSON object of field values.
pub struct HttpBackend {
    id: BackendId,
    url: String,
    client: Client,
    field_scoping: bool,
    timeout: Option<Duration>,
}

impl HttpBackend {
    pub fn new(config: &BackendConfig, client: Client) -> Self {
        Self {
            id: BackendId(config.id.clone()),
            url: config.url.clone(),
            client,
            field_scoping: config.supports_field_scoping,
            timeout: config.timeout_ms.map(Duration::from_millis),
        }
    }
}

#[async_trait]
impl Backend for HttpBackend {
    fn id(&self) -> &BackendId {
        &self.id
    }

    fn supports_field_scoping(&self) -> bool {
        self.field_scoping
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    async fn call(&self, request: BackendRequest) -> Result<BackendResponse, BackendCallError> {
        let response = self
            .client
            .post(&self.url)
            .header("x-request-id", &request.request_id)
            .json(&request)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            debug!(
                event_name = "backend.http.error_status",
                correlation_id = %request.request_id,
                backend = %self.id,
                status = status.as_u16(),
                "backend returned error status"
            );
            return Err(classify_status(status));
        }

        let body: Value = response.json().await.map_err(|error| {
            BackendCallError::Permanent(format!("response body is not valid JSON: {error}"))
        })?;
        let Value::Object(fields) = body else {
            return Err(BackendCallError::Permanent(
                "response body is not a JSON object".to_owned(),
            ));
        };

        Ok(BackendResponse { backend: self.id.clone(), fields, retrieved_at: Utc::now() })
    }
}

fn classify_transport_error(error: reqwest::Error) -> BackendCallError {
    if error.is_timeout() {
        BackendCallError::Timeout
    } else {
        BackendCallError::Transient(error.to_string())
    }
}

fn classify_status(status: StatusCode) -> BackendCallError {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        BackendCallError::Transient(format!("upstream returned {status}"))
    } else if status == StatusCode::REQUEST_TIMEOUT {
        BackendCallError::Timeout
    } else {
        BackendCallError::Permanent(format!("upstream returned {status}"))
    }
}

pub fn registry_from_config(backends: &[BackendConfig]) -> Result<BackendRegistry, reqwest::Error> {
    let client = Client::builder().connect_timeout(Duration::from_secs(2)).build()?;
    let mut registry = BackendRegistry::new();
    for config in backends {
        registry.register(Arc::new(HttpBackend::new(config, client.clone())));
    }
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
    use chrono::Utc;
    use gatehouse_core::config::BackendConfig;
    use gatehouse_core::{Backend, BackendCallError, BackendId, BackendRequest};
    use serde_json::{json, Value};

    use super::{registry_from_config, HttpBackend};

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        format!("http://{address}")
    }

    fn backend(url: String) -> HttpBackend {
        let config = BackendConfig {
            id: "credit_bureau".to_owned(),
            url,
            supports_field_scoping: true,
            timeout_ms: Some(500),
        };
        HttpBackend::new(&config, reqwest::Client::new())
    }

    fn request(fields: Option<Vec<String>>) -> BackendRequest {
        BackendRequest {
            request_id: "req-http-1".to_owned(),
            backend: BackendId("credit_bureau".to_owned()),
            fields,
            params: BTreeMap::from([("applicant_id".to_owned(), "A-100".to_owned())]),
            issued_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn posts_scoped_request_and_decodes_object() {
        async fn echo(Json(body): Json<Value>) -> Json<Value> {
            Json(json!({
                "credit_score": 712,
                "requested": body["fields"].clone(),
                "applicant": body["params"]["applicant_id"].clone(),
            }))
        }
        let url = serve(Router::new().route("/credit", post(echo))).await;

        let response = backend(format!("{url}/credit"))
            .call(request(Some(vec!["credit_score".to_owned()])))
            .await
            .expect("call succeeds");

        assert_eq!(response.backend, BackendId("credit_bureau".to_owned()));
        assert_eq!(response.fields["credit_score"], json!(712));
        assert_eq!(response.fields["requested"], json!(["credit_score"]));
        assert_eq!(response.fields["applicant"], json!("A-100"));
    }

    #[tokio::test]
    async fn server_errors_are_transient_and_client_errors_permanent() {
        async fn unavailable() -> StatusCode {
            StatusCode::SERVICE_UNAVAILABLE
        }
        async fn forbidden() -> StatusCode {
            StatusCode::FORBIDDEN
        }
        let url = serve(
            Router::new().route("/down", post(unavailable)).route("/denied", post(forbidden)),
        )
        .await;

        let down = backend(format!("{url}/down")).call(request(None)).await;
        assert!(matches!(down, Err(BackendCallError::Transient(_))));

        let denied = backend(format!("{url}/denied")).call(request(None)).await;
        assert!(matches!(denied, Err(BackendCallError::Permanent(_))));
    }

    #[tokio::test]
    async fn non_object_body_is_rejected() {
        async fn list() -> Json<Value> {
            Json(json!([1, 2, 3]))
        }
        let url = serve(Router::new().route("/list", post(list))).await;

        let result = backend(format!("{url}/list")).call(request(None)).await;
        assert!(matches!(result, Err(BackendCallError::Permanent(_))));
    }

    #[tokio::test]
    async fn connection_refused_is_retryable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = listener.local_addr().expect("local addr");
        drop(listener);

        let result = backend(format!("http://{address}/gone")).call(request(None)).await;
        let error = result.expect_err("nothing is listening");
        assert!(error.is_retryable());
    }

    #[tokio::test]
    async fn registry_registers_every_configured_backend() {
        async fn count(State(hits): State<Arc<AtomicU32>>) -> Json<Value> {
            hits.fetch_add(1, Ordering::SeqCst);
            Json(json!({}))
        }
        let hits = Arc::new(AtomicU32::new(0));
        let url =
            serve(Router::new().route("/empty", post(count)).with_state(Arc::clone(&hits))).await;

        let configs = vec![
            BackendConfig {
                id: "customer_profile".to_owned(),
                url: format!("{url}/empty"),
                supports_field_scoping: false,
                timeout_ms: None,
            },
            BackendConfig {
                id: "credit_bureau".to_owned(),
                url: format!("{url}/empty"),
                supports_field_scoping: true,
                timeout_ms: Some(250),
            },
        ];
        let registry = registry_from_config(&configs).expect("registry");

        assert_eq!(registry.ids().len(), 2);
        let credit = registry.get(&BackendId("credit_bureau".to_owned())).expect("registered");
        assert!(credit.supports_field_scoping());
        assert_eq!(credit.timeout(), Some(std::time::Duration::from_millis(250)));

        credit.call(request(None)).await.expect("call");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
