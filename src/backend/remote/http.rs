//! JSON/HTTP client for the hosted notification store.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Serialize;
use tracing::debug;

use crate::backend::{BackendError, NotificationBackend};
use crate::notifications::{
    NewNotification, NotificationId, NotificationQuery, NotificationRecord, SubscriberId,
};

#[derive(Serialize)]
struct IdsBody<'a> {
    ids: &'a [NotificationId],
}

/// `NotificationBackend` over the REST API of the notification store.
pub struct HttpBackend {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpBackend {
    /// Create a new client.
    ///
    /// # Arguments
    /// * `base_url` - Base URL of the API (e.g., "https://api.example.org")
    /// * `api_key` - Bearer token sent with every request, if any
    /// * `timeout_sec` - Request timeout in seconds
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        timeout_sec: u64,
    ) -> Result<Self, BackendError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_sec))
            .build()
            .map_err(|e| BackendError::Unavailable(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            // Ensure base_url doesn't have trailing slash
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn notifications_url(&self) -> String {
        format!("{}/notifications", self.base_url)
    }

    fn read_url(&self, id: &str) -> String {
        format!(
            "{}/notifications/{}/read",
            self.base_url,
            urlencoding::encode(id)
        )
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder, what: &str) -> Result<Response, BackendError> {
        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(|e| BackendError::Unavailable(format!("{}: {}", what, e)))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        debug!("{} failed with status {}: {}", what, status, body);
        Err(status_error(status, what, &body))
    }
}

/// Query string for a notification query.
fn query_params(subscriber: &SubscriberId, query: &NotificationQuery) -> Vec<(&'static str, String)> {
    let mut params = vec![
        ("role", subscriber.role.as_str().to_string()),
        ("account_id", subscriber.account_id.clone()),
    ];
    if let Some(limit) = query.limit {
        params.push(("limit", limit.to_string()));
    }
    if let Some(offset) = query.offset {
        params.push(("offset", offset.to_string()));
    }
    if query.unread_only {
        params.push(("unread_only", "true".to_string()));
    }
    if let Some(kind) = query.kind {
        params.push(("kind", kind.as_str().to_string()));
    }
    params
}

fn status_error(status: StatusCode, what: &str, body: &str) -> BackendError {
    let detail = if body.is_empty() {
        format!("{}: status {}", what, status)
    } else {
        format!("{}: status {} - {}", what, status, body)
    };
    match status {
        StatusCode::NOT_FOUND => BackendError::NotFound(detail),
        s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
            BackendError::Unavailable(detail)
        }
        _ => BackendError::Rejected(detail),
    }
}

#[async_trait]
impl NotificationBackend for HttpBackend {
    async fn query(
        &self,
        subscriber: &SubscriberId,
        query: &NotificationQuery,
    ) -> Result<Vec<NotificationRecord>, BackendError> {
        let request = self
            .client
            .get(self.notifications_url())
            .query(&query_params(subscriber, query));
        let response = self.send(request, "query notifications").await?;

        response
            .json()
            .await
            .map_err(|e| BackendError::Decode(format!("notification list: {}", e)))
    }

    async fn mark_read(&self, id: &str) -> Result<(), BackendError> {
        let request = self.client.patch(self.read_url(id));
        match self.send(request, "mark read").await {
            Err(BackendError::NotFound(_)) => Err(BackendError::NotFound(id.to_string())),
            other => other.map(|_| ()),
        }
    }

    async fn mark_many_read(&self, ids: &[NotificationId]) -> Result<(), BackendError> {
        if ids.is_empty() {
            return Ok(());
        }
        let request = self
            .client
            .post(format!("{}/read", self.notifications_url()))
            .json(&IdsBody { ids });
        self.send(request, "mark many read").await?;
        Ok(())
    }

    async fn delete(&self, ids: &[NotificationId]) -> Result<(), BackendError> {
        if ids.is_empty() {
            return Ok(());
        }
        let request = self
            .client
            .delete(self.notifications_url())
            .json(&IdsBody { ids });
        self.send(request, "delete notifications").await?;
        Ok(())
    }

    async fn create(
        &self,
        notification: NewNotification,
    ) -> Result<NotificationRecord, BackendError> {
        let request = self.client.post(self.notifications_url()).json(&notification);
        let response = self.send(request, "create notification").await?;

        response
            .json()
            .await
            .map_err(|e| BackendError::Decode(format!("created notification: {}", e)))
    }
}
