//! Matrix client-server API over HTTP
//!
//! Covers exactly what the relay needs: whoami, join, send, display name
//! lookup and incremental sync. [`MatrixApi`] is the seam the supervisor is
//! written against; [`MatrixClient`] is the reqwest implementation.

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{MatrixError, Result};
use crate::sync::SyncResponse;

/// HTTP connect timeout
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Request timeout for everything except sync
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Extra time a sync request may take beyond its long-poll timeout
const SYNC_GRACE: Duration = Duration::from_secs(30);

const CLIENT_V3: [&str; 3] = ["_matrix", "client", "v3"];

/// Homeserver operations used by the chat supervisor
#[async_trait]
pub trait MatrixApi: Send + Sync + 'static {
    /// User id owning the access token
    async fn whoami(&self) -> Result<String>;

    /// Join a room by id or alias; returns the room id
    async fn join(&self, room: &str) -> Result<String>;

    /// Send a room event; returns the event id
    async fn send_event(&self, room_id: &str, event_type: &str, content: Value) -> Result<String>;

    /// Display name of a user, `None` when unset
    async fn display_name(&self, user_id: &str) -> Result<Option<String>>;

    /// One sync request; `since = None` is an initial sync
    async fn sync(&self, since: Option<&str>, timeout: Duration) -> Result<SyncResponse>;
}

#[async_trait]
impl<T: MatrixApi> MatrixApi for std::sync::Arc<T> {
    async fn whoami(&self) -> Result<String> {
        (**self).whoami().await
    }

    async fn join(&self, room: &str) -> Result<String> {
        (**self).join(room).await
    }

    async fn send_event(&self, room_id: &str, event_type: &str, content: Value) -> Result<String> {
        (**self).send_event(room_id, event_type, content).await
    }

    async fn display_name(&self, user_id: &str) -> Result<Option<String>> {
        (**self).display_name(user_id).await
    }

    async fn sync(&self, since: Option<&str>, timeout: Duration) -> Result<SyncResponse> {
        (**self).sync(since, timeout).await
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    errcode: String,
    #[serde(default)]
    error: String,
}

#[derive(Deserialize)]
struct WhoamiResponse {
    user_id: String,
}

#[derive(Deserialize)]
struct JoinResponse {
    room_id: String,
}

#[derive(Deserialize)]
struct SendResponse {
    event_id: String,
}

#[derive(Deserialize)]
struct DisplayNameResponse {
    #[serde(default)]
    displayname: Option<String>,
}

/// reqwest-backed Matrix client
#[derive(Clone)]
pub struct MatrixClient {
    http: reqwest::Client,
    base: Url,
    access_token: String,
}

impl std::fmt::Debug for MatrixClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatrixClient")
            .field("base", &self.base.as_str())
            .finish_non_exhaustive()
    }
}

impl MatrixClient {
    /// Create a client for a homeserver base URL
    pub fn new(homeserver: &str, access_token: impl Into<String>) -> Result<Self> {
        let base = Url::parse(homeserver)
            .map_err(|e| MatrixError::InvalidUrl(format!("{homeserver}: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(MatrixError::InvalidUrl(homeserver.to_string()));
        }

        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "Failed to build HTTP client with timeouts, using default");
                reqwest::Client::default()
            });

        Ok(Self {
            http,
            base,
            access_token: access_token.into(),
        })
    }

    /// Homeserver base URL
    pub fn homeserver(&self) -> &Url {
        &self.base
    }

    /// URL for a client API path; each segment is percent-encoded
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| MatrixError::InvalidUrl(self.base.to_string()))?
            .pop_if_empty()
            .extend(CLIENT_V3)
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.http.request(method, url).bearer_auth(&self.access_token)
    }

    async fn execute<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            let body = response.bytes().await?;
            return Ok(serde_json::from_slice(&body)?);
        }

        let text = response.text().await.unwrap_or_default();
        let body: ErrorBody = serde_json::from_str(&text).unwrap_or(ErrorBody {
            errcode: String::new(),
            error: text,
        });
        Err(api_error(status, body))
    }
}

fn api_error(status: StatusCode, body: ErrorBody) -> MatrixError {
    MatrixError::Api {
        status: status.as_u16(),
        errcode: if body.errcode.is_empty() {
            "M_UNKNOWN".to_string()
        } else {
            body.errcode
        },
        message: body.error,
    }
}

#[async_trait]
impl MatrixApi for MatrixClient {
    async fn whoami(&self) -> Result<String> {
        let url = self.endpoint(&["account", "whoami"])?;
        let body: WhoamiResponse = self.execute(self.request(Method::GET, url)).await?;
        Ok(body.user_id)
    }

    async fn join(&self, room: &str) -> Result<String> {
        let url = self.endpoint(&["join", room])?;
        let body: JoinResponse = self
            .execute(self.request(Method::POST, url).json(&serde_json::json!({})))
            .await?;
        debug!(room, room_id = %body.room_id, "Joined room");
        Ok(body.room_id)
    }

    async fn send_event(&self, room_id: &str, event_type: &str, content: Value) -> Result<String> {
        let txn_id = uuid::Uuid::new_v4().simple().to_string();
        let url = self.endpoint(&["rooms", room_id, "send", event_type, &txn_id])?;
        let body: SendResponse = self
            .execute(self.request(Method::PUT, url).json(&content))
            .await?;
        debug!(room_id, event_id = %body.event_id, "Sent event");
        Ok(body.event_id)
    }

    async fn display_name(&self, user_id: &str) -> Result<Option<String>> {
        let url = self.endpoint(&["profile", user_id, "displayname"])?;
        match self
            .execute::<DisplayNameResponse>(self.request(Method::GET, url))
            .await
        {
            Ok(body) => Ok(body.displayname.filter(|name| !name.is_empty())),
            Err(MatrixError::Api { status: 404, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn sync(&self, since: Option<&str>, timeout: Duration) -> Result<SyncResponse> {
        let mut url = self.endpoint(&["sync"])?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("timeout", &timeout.as_millis().to_string());
            if let Some(since) = since {
                query.append_pair("since", since);
            }
        }
        self.execute(
            self.request(Method::GET, url)
                .timeout(timeout + SYNC_GRACE),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_encodes_segments() {
        let client = MatrixClient::new("https://matrix.example.org/", "token").unwrap();
        let url = client
            .endpoint(&["rooms", "!abc:example.org", "send", "m.room.message", "t1"])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://matrix.example.org/_matrix/client/v3/rooms/!abc:example.org/send/m.room.message/t1"
        );

        let alias = client.endpoint(&["join", "#mesh/chat:example.org"]).unwrap();
        assert!(alias.path().ends_with("/join/%23mesh%2Fchat:example.org"));
    }

    #[test]
    fn test_endpoint_keeps_base_path() {
        let client = MatrixClient::new("https://example.org/matrix", "token").unwrap();
        let url = client.endpoint(&["account", "whoami"]).unwrap();
        assert_eq!(url.path(), "/matrix/_matrix/client/v3/account/whoami");
    }

    #[test]
    fn test_invalid_homeserver() {
        assert!(matches!(
            MatrixClient::new("not a url", "token"),
            Err(MatrixError::InvalidUrl(_))
        ));
        assert!(matches!(
            MatrixClient::new("mailto:relay@example.org", "token"),
            Err(MatrixError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_api_error_defaults_errcode() {
        let err = api_error(
            StatusCode::BAD_GATEWAY,
            ErrorBody {
                errcode: String::new(),
                error: "upstream".into(),
            },
        );
        assert!(matches!(err, MatrixError::Api { status: 502, ref errcode, .. } if errcode == "M_UNKNOWN"));
        assert!(err.is_retriable());
    }
}
