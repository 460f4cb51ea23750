//! REST client for room history and conversation provisioning

use async_trait::async_trait;
use florachat_core::{
    AuthError, FlorachatError, HistoryFetchError, HistoryPage, NetworkError, Result, RoomId,
    UserId,
};
use florachat_runtime::{AuthToken, HistoryApi, RoomProvisioner};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

#[derive(Serialize)]
struct OpenRoomRequest<'a> {
    participant_id: &'a UserId,
}

#[derive(Deserialize)]
struct OpenRoomResponse {
    room_id: RoomId,
}

/// HTTP client for the chat REST API
#[derive(Clone)]
pub struct RestClient {
    http: Client,
    base_url: Url,
    token: AuthToken,
}

impl RestClient {
    pub fn new(base_url: &str, token: AuthToken) -> Result<Self> {
        let base_url = Url::parse(base_url).map_err(|_| invalid_endpoint(base_url))?;
        if base_url.cannot_be_a_base() || !matches!(base_url.scheme(), "http" | "https") {
            return Err(invalid_endpoint(base_url.as_str()));
        }
        Ok(Self {
            http: Client::new(),
            base_url,
            token,
        })
    }

    /// Use a preconfigured HTTP client (proxies, timeouts, TLS roots)
    pub fn with_client(mut self, http: Client) -> Self {
        self.http = http;
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// `{base}/rooms/{id}/messages?cursor=...`
    pub fn history_url(&self, room_id: &RoomId, cursor: Option<&str>) -> Result<Url> {
        let mut url = self.endpoint(&["rooms", room_id.as_str(), "messages"])?;
        if let Some(cursor) = cursor {
            url.query_pairs_mut().append_pair("cursor", cursor);
        }
        Ok(url)
    }

    /// `{base}/rooms`
    pub fn rooms_url(&self) -> Result<Url> {
        self.endpoint(&["rooms"])
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| invalid_endpoint(self.base_url.as_str()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

#[async_trait]
impl HistoryApi for RestClient {
    async fn fetch_page(
        &self,
        room_id: &RoomId,
        cursor: Option<&str>,
    ) -> core::result::Result<HistoryPage, HistoryFetchError> {
        let url = self
            .history_url(room_id, cursor)
            .map_err(|error| HistoryFetchError::Permanent {
                room_id: room_id.clone(),
                attempts: 0,
                reason: error.to_string(),
            })?;
        debug!(room_id = %room_id, %url, "requesting history page");

        let response = self
            .http
            .get(url)
            .bearer_auth(self.token.expose())
            .send()
            .await
            .map_err(|error| HistoryFetchError::Retryable {
                room_id: room_id.clone(),
                reason: error.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(HistoryFetchError::Retryable {
                room_id: room_id.clone(),
                reason: format!("HTTP {status}"),
            });
        }

        let body = response
            .text()
            .await
            .map_err(|error| HistoryFetchError::Retryable {
                room_id: room_id.clone(),
                reason: error.to_string(),
            })?;
        serde_json::from_str(&body).map_err(|error| HistoryFetchError::Decode {
            room_id: room_id.clone(),
            reason: error.to_string(),
        })
    }
}

#[async_trait]
impl RoomProvisioner for RestClient {
    async fn open_room(&self, participant_id: &UserId) -> Result<RoomId> {
        let url = self.rooms_url()?;
        let response = self
            .http
            .post(url.clone())
            .bearer_auth(self.token.expose())
            .json(&OpenRoomRequest { participant_id })
            .send()
            .await
            .map_err(|error| request_failed(&url, error.to_string()))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(AuthError::Rejected {
                status: status.as_u16(),
            }
            .into());
        }
        if !status.is_success() {
            return Err(request_failed(&url, format!("HTTP {status}")));
        }

        let body = response
            .text()
            .await
            .map_err(|error| request_failed(&url, error.to_string()))?;
        let opened: OpenRoomResponse = serde_json::from_str(&body)?;
        info!(room_id = %opened.room_id, participant = %participant_id, "room provisioned");
        Ok(opened.room_id)
    }
}

fn invalid_endpoint(url: &str) -> FlorachatError {
    NetworkError::InvalidEndpoint {
        url: url.to_string(),
    }
    .into()
}

fn request_failed(url: &Url, reason: String) -> FlorachatError {
    NetworkError::ConnectFailed {
        endpoint: url.to_string(),
        reason,
    }
    .into()
}
