//! HTTP implementation of `RemoteApi`.
//!
//! Maps mutations onto a resource-per-entity REST layout:
//! `POST /{entity}`, `PATCH /{entity}/{id}`, `DELETE /{entity}/{id}`, and
//! asset uploads onto a multipart `POST /{destination}`.

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{header, Client, Method, RequestBuilder, Response, StatusCode};
use thiserror::Error;
use tracing::debug;
use url::Url;

use outbox_common::{ExecError, ExecResult};

use crate::action::ActionKind;
use crate::executor::{AssetUpload, MutationRequest, RemoteApi};

/// Header carrying the action id so the server can drop replays.
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

const USER_AGENT: &str = "Outbox/0.1";

/// Errors raised while setting up an `HttpRemote`.
#[derive(Debug, Error)]
pub enum HttpSetupError {
    #[error("Base URL cannot carry a path: {0}")]
    InvalidBaseUrl(Url),

    #[error("Failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// REST client for the remote side.
pub struct HttpRemote {
    http: Client,
    base_url: Url,
    bearer_token: Option<String>,
}

impl HttpRemote {
    /// Create a client rooted at `base_url`.
    pub fn new(base_url: Url) -> Result<Self, HttpSetupError> {
        if base_url.cannot_be_a_base() {
            return Err(HttpSetupError::InvalidBaseUrl(base_url));
        }

        let http = Client::builder().user_agent(USER_AGENT).build()?;

        Ok(Self {
            http,
            base_url,
            bearer_token: None,
        })
    }

    /// Send `Authorization: Bearer <token>` with every request.
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    /// Append path segments to the base URL, percent-encoding each one.
    fn endpoint<'a>(&self, segments: impl IntoIterator<Item = &'a str>) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn request(&self, method: Method, url: Url, idempotency_key: &str) -> RequestBuilder {
        let mut request = self
            .http
            .request(method, url)
            .header(IDEMPOTENCY_HEADER, idempotency_key);

        if let Some(token) = &self.bearer_token {
            request = request.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        request
    }

    fn mutation_request(&self, mutation: &MutationRequest) -> ExecResult<RequestBuilder> {
        let entity = mutation.entity.as_str();
        let record = || {
            mutation.record_id.as_deref().ok_or_else(|| {
                ExecError::Rejected(format!("{} {} without record id", mutation.kind, entity))
            })
        };

        let request = match mutation.kind {
            ActionKind::Create => self
                .request(Method::POST, self.endpoint([entity]), &mutation.idempotency_key)
                .json(&mutation.fields),
            ActionKind::Update => self
                .request(
                    Method::PATCH,
                    self.endpoint([entity, record()?]),
                    &mutation.idempotency_key,
                )
                .json(&mutation.fields),
            ActionKind::Delete => {
                let request = self.request(
                    Method::DELETE,
                    self.endpoint([entity, record()?]),
                    &mutation.idempotency_key,
                );
                if mutation.fields.is_empty() {
                    request
                } else {
                    request.json(&mutation.fields)
                }
            }
        };
        Ok(request)
    }

    fn upload_request(&self, upload: &AssetUpload) -> ExecResult<RequestBuilder> {
        let mut part = Part::bytes(upload.data.clone()).file_name(upload.file_name.clone());
        if let Some(mime) = &upload.content_type {
            part = part
                .mime_str(mime)
                .map_err(|e| ExecError::Rejected(format!("Invalid content type {}: {}", mime, e)))?;
        }

        let form = Form::new()
            .text("entity", upload.entity.clone())
            .part("file", part);

        let segments = upload.destination.split('/').filter(|s| !s.is_empty());
        Ok(self
            .request(Method::POST, self.endpoint(segments), &upload.idempotency_key)
            .multipart(form))
    }

    async fn send(&self, request: RequestBuilder, what: &str) -> ExecResult<()> {
        let response = request
            .send()
            .await
            .map_err(|e| ExecError::Network(format!("Failed to {}: {}", what, e)))?;

        handle_response(response).await
    }
}

#[async_trait]
impl RemoteApi for HttpRemote {
    async fn submit_mutation(&self, request: &MutationRequest) -> ExecResult<()> {
        debug!(
            "HTTP {} {} {:?}",
            request.kind, request.entity, request.record_id
        );
        let builder = self.mutation_request(request)?;
        self.send(builder, "submit mutation").await
    }

    async fn upload_asset(&self, upload: &AssetUpload) -> ExecResult<()> {
        debug!(
            "HTTP upload {} ({} bytes) to {}",
            upload.file_name,
            upload.data.len(),
            upload.destination
        );
        let builder = self.upload_request(upload)?;
        self.send(builder, "upload asset").await
    }
}

async fn handle_response(response: Response) -> ExecResult<()> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }

    let body = response.text().await.unwrap_or_default();
    Err(classify_failure(status, &body))
}

/// Map a non-success status onto the executor error taxonomy.
///
/// Client errors are final except request timeouts and rate limiting,
/// which clear up on their own.
fn classify_failure(status: StatusCode, body: &str) -> ExecError {
    let message = if body.is_empty() {
        status.to_string()
    } else {
        format!("{} - {}", status, body)
    };

    if status == StatusCode::REQUEST_TIMEOUT || status == StatusCode::TOO_MANY_REQUESTS {
        ExecError::Network(message)
    } else if status.is_client_error() {
        ExecError::Rejected(message)
    } else {
        ExecError::Network(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map, Value};

    fn remote(base: &str) -> HttpRemote {
        HttpRemote::new(Url::parse(base).unwrap()).unwrap()
    }

    fn mutation(kind: ActionKind, record_id: Option<&str>, fields: Value) -> MutationRequest {
        MutationRequest {
            entity: "orders".to_string(),
            kind,
            record_id: record_id.map(String::from),
            fields: fields.as_object().cloned().unwrap_or_else(Map::new),
            idempotency_key: "a-1".to_string(),
        }
    }

    #[test]
    fn test_rejects_non_base_url() {
        let result = HttpRemote::new(Url::parse("mailto:ops@example.com").unwrap());
        assert!(matches!(result, Err(HttpSetupError::InvalidBaseUrl(_))));
    }

    #[test]
    fn test_endpoint_joins_segments() {
        let api = remote("https://api.example.com/v1/");
        assert_eq!(
            api.endpoint(["orders", "o-1"]).as_str(),
            "https://api.example.com/v1/orders/o-1"
        );

        let bare = remote("https://api.example.com");
        assert_eq!(bare.endpoint(["orders"]).as_str(), "https://api.example.com/orders");
    }

    #[test]
    fn test_endpoint_escapes_segments() {
        let api = remote("https://api.example.com/v1");
        assert_eq!(
            api.endpoint(["orders", "a/b c"]).as_str(),
            "https://api.example.com/v1/orders/a%2Fb%20c"
        );
    }

    #[test]
    fn test_mutation_routes() {
        let api = remote("https://api.example.com/v1/").with_bearer_token("secret");

        let create = api
            .mutation_request(&mutation(ActionKind::Create, None, json!({"total": 3})))
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(create.method(), Method::POST);
        assert_eq!(create.url().path(), "/v1/orders");
        assert_eq!(create.headers()[IDEMPOTENCY_HEADER], "a-1");
        assert_eq!(create.headers()[header::AUTHORIZATION], "Bearer secret");

        let update = api
            .mutation_request(&mutation(ActionKind::Update, Some("o-9"), json!({"total": 4})))
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(update.method(), Method::PATCH);
        assert_eq!(update.url().path(), "/v1/orders/o-9");

        let delete = api
            .mutation_request(&mutation(ActionKind::Delete, Some("o-9"), json!({})))
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(delete.method(), Method::DELETE);
        assert!(delete.body().is_none());
    }

    #[test]
    fn test_mutation_without_record_id_is_rejected() {
        let api = remote("https://api.example.com");
        let result = api.mutation_request(&mutation(ActionKind::Update, None, json!({"a": 1})));
        assert!(matches!(result, Err(ExecError::Rejected(_))));
    }

    #[test]
    fn test_upload_route() {
        let api = remote("https://api.example.com/v1");
        let upload = AssetUpload {
            entity: "profile".to_string(),
            destination: "/avatars/u-1/".to_string(),
            file_name: "me.png".to_string(),
            content_type: Some("image/png".to_string()),
            data: vec![1, 2, 3],
            idempotency_key: "a-2".to_string(),
        };

        let request = api.upload_request(&upload).unwrap().build().unwrap();
        assert_eq!(request.method(), Method::POST);
        assert_eq!(request.url().path(), "/v1/avatars/u-1");
        let content_type = request.headers()[header::CONTENT_TYPE].to_str().unwrap();
        assert!(content_type.starts_with("multipart/form-data"));
    }

    #[test]
    fn test_invalid_content_type_is_rejected() {
        let api = remote("https://api.example.com");
        let upload = AssetUpload {
            entity: "profile".to_string(),
            destination: "avatars".to_string(),
            file_name: "me.png".to_string(),
            content_type: Some("not a mime".to_string()),
            data: Vec::new(),
            idempotency_key: "a-3".to_string(),
        };
        assert!(matches!(api.upload_request(&upload), Err(ExecError::Rejected(_))));
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            classify_failure(StatusCode::UNPROCESSABLE_ENTITY, "bad total"),
            ExecError::Rejected(m) if m.contains("bad total")
        ));
        assert!(matches!(
            classify_failure(StatusCode::NOT_FOUND, ""),
            ExecError::Rejected(_)
        ));
        assert!(matches!(
            classify_failure(StatusCode::TOO_MANY_REQUESTS, ""),
            ExecError::Network(_)
        ));
        assert!(matches!(
            classify_failure(StatusCode::REQUEST_TIMEOUT, ""),
            ExecError::Network(_)
        ));
        assert!(matches!(
            classify_failure(StatusCode::BAD_GATEWAY, ""),
            ExecError::Network(_)
        ));
    }
}
