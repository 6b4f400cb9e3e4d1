use super::{
    Backend, BackendError, BackendErrorKind, BackendResult, ChangePage, ChangeStream,
    ChangesRequest, ChangesResponse, ErrorBody, FeedEvent, FeedEventKind, SnapshotQuery,
};
use crate::config::BackendConfig;
use crate::Record;
use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// How long the server may hold a change-feed poll open.
const FEED_WAIT: Duration = Duration::from_secs(25);

/// Client of `cadence-server`.
#[derive(Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    token: Arc<RwLock<String>>,
    request_timeout: Duration,
}

impl std::fmt::Debug for HttpBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpBackend")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl HttpBackend {
    pub fn new(config: &BackendConfig) -> BackendResult<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| BackendError::new(BackendErrorKind::Network, e.to_string()))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: Arc::new(RwLock::new(config.access_token.clone())),
            request_timeout: config.request_timeout,
        })
    }

    /// Swap the access credential, e.g. after re-authentication.
    pub fn set_access_token(&self, token: impl Into<String>) {
        *self.token.write() = token.into();
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .bearer_auth(self.token.read().as_str())
            .timeout(self.request_timeout)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> BackendResult<T> {
        let response = request.send().await.map_err(transport_error)?;
        decode(response).await
    }

    async fn poll_changes(
        &self,
        table: &str,
        request: &ChangesRequest,
    ) -> BackendResult<ChangesResponse> {
        let wait = Duration::from_millis(request.wait_ms);
        let builder = self
            .authorized(self.client.post(self.url(&format!("/tables/{table}/changes"))))
            .timeout(self.request_timeout + wait)
            .json(request);
        self.send(builder).await
    }
}

/// Map a transport failure onto the error taxonomy.
fn transport_error(err: reqwest::Error) -> BackendError {
    let kind = if err.is_timeout() {
        BackendErrorKind::Timeout
    } else {
        BackendErrorKind::Network
    };
    BackendError::new(kind, err.to_string())
}

/// Map an HTTP status onto the error taxonomy.
pub(crate) fn status_kind(status: StatusCode) -> BackendErrorKind {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => BackendErrorKind::Authorization,
        StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND | StatusCode::UNPROCESSABLE_ENTITY => {
            BackendErrorKind::Validation
        }
        StatusCode::CONFLICT => BackendErrorKind::Constraint,
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => BackendErrorKind::Timeout,
        _ => BackendErrorKind::Unavailable,
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> BackendResult<T> {
    let status = response.status();
    if status.is_success() {
        return response
            .json()
            .await
            .map_err(|e| BackendError::new(BackendErrorKind::Unavailable, e.to_string()));
    }

    let kind = status_kind(status);
    let message = match response.json::<ErrorBody>().await {
        Ok(body) => body.error,
        Err(_) => status.to_string(),
    };
    Err(BackendError::new(kind, message))
}

#[async_trait]
impl Backend for HttpBackend {
    async fn query(&self, table: &str, query: &SnapshotQuery) -> BackendResult<Vec<Record>> {
        let request = self
            .authorized(self.client.post(self.url(&format!("/tables/{table}/query"))))
            .json(query);
        self.send(request).await
    }

    async fn changes_since(
        &self,
        table: &str,
        filter: &Map<String, Value>,
        since: i64,
        limit: usize,
    ) -> BackendResult<ChangePage> {
        let response = self
            .poll_changes(
                table,
                &ChangesRequest {
                    filter: filter.clone(),
                    cursor: Some(since),
                    wait_ms: 0,
                    limit: Some(limit),
                },
            )
            .await?;
        let rows = response
            .events
            .into_iter()
            .map(|event| {
                let mut row = event.row;
                if event.kind == FeedEventKind::Delete {
                    row.deleted = true;
                }
                row
            })
            .collect();
        Ok(ChangePage {
            rows,
            cursor: response.cursor,
        })
    }

    async fn subscribe(
        &self,
        table: &str,
        filter: &Map<String, Value>,
    ) -> BackendResult<ChangeStream> {
        // The first poll asks for the head so the feed starts from now.
        let head = self
            .poll_changes(
                table,
                &ChangesRequest {
                    filter: filter.clone(),
                    cursor: None,
                    wait_ms: 0,
                    limit: None,
                },
            )
            .await?;

        struct Feed {
            backend: HttpBackend,
            table: String,
            filter: Map<String, Value>,
            cursor: i64,
            buffered: VecDeque<FeedEvent>,
        }

        let feed = Feed {
            backend: self.clone(),
            table: table.to_string(),
            filter: filter.clone(),
            cursor: head.cursor,
            buffered: head.events.into(),
        };

        let stream = futures::stream::unfold(Some(feed), |feed| async move {
            let mut feed = feed?;
            loop {
                if let Some(event) = feed.buffered.pop_front() {
                    return Some((Ok(event), Some(feed)));
                }
                let request = ChangesRequest {
                    filter: feed.filter.clone(),
                    cursor: Some(feed.cursor),
                    wait_ms: FEED_WAIT.as_millis() as u64,
                    limit: None,
                };
                match feed.backend.poll_changes(&feed.table, &request).await {
                    Ok(response) => {
                        feed.cursor = response.cursor;
                        feed.buffered.extend(response.events);
                    }
                    Err(err) => return Some((Err(err), None)),
                }
            }
        });
        Ok(Box::pin(stream))
    }

    async fn upsert(&self, table: &str, row: &Record) -> BackendResult<Record> {
        let request = self
            .authorized(
                self.client
                    .put(self.url(&format!("/tables/{table}/rows/{}", row.id))),
            )
            .json(row);
        self.send(request).await
    }

    async fn call(&self, procedure: &str, params: Value) -> BackendResult<Value> {
        let request = self
            .authorized(self.client.post(self.url(&format!("/rpc/{procedure}"))))
            .json(&params);
        self.send(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_to_error_kinds() {
        assert_eq!(
            status_kind(StatusCode::UNAUTHORIZED),
            BackendErrorKind::Authorization
        );
        assert_eq!(status_kind(StatusCode::CONFLICT), BackendErrorKind::Constraint);
        assert_eq!(
            status_kind(StatusCode::UNPROCESSABLE_ENTITY),
            BackendErrorKind::Validation
        );
        assert_eq!(
            status_kind(StatusCode::GATEWAY_TIMEOUT),
            BackendErrorKind::Timeout
        );
        assert_eq!(
            status_kind(StatusCode::SERVICE_UNAVAILABLE),
            BackendErrorKind::Unavailable
        );
    }

    #[test]
    fn base_url_is_normalized() {
        let config = BackendConfig {
            base_url: "http://localhost:3000/".into(),
            access_token: "secret".into(),
            request_timeout: Duration::from_secs(5),
        };
        let backend = HttpBackend::new(&config).unwrap();
        assert_eq!(
            backend.url("/tables/tags/query"),
            "http://localhost:3000/tables/tags/query"
        );
    }

    #[tokio::test]
    async fn unreachable_server_is_a_transient_error() {
        let config = BackendConfig {
            base_url: "http://127.0.0.1:9".into(),
            access_token: "secret".into(),
            request_timeout: Duration::from_secs(2),
        };
        let backend = HttpBackend::new(&config).unwrap();
        let err = backend
            .query("tags", &SnapshotQuery::default())
            .await
            .unwrap_err();
        assert_eq!(err.class(), crate::backend::ErrorClass::Transient);
    }
}
