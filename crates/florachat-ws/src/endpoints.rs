//! Endpoint wiring

use crate::rest::RestClient;
use crate::transport::WsTransport;
use florachat_core::{Result, SenderRole, SessionConfig, UserId};
use florachat_runtime::{AuthToken, SessionBuilder};
use serde::{Deserialize, Serialize};

/// Server endpoints for one deployment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoints {
    /// `wss://` URL of the chat socket
    pub websocket_url: String,
    /// Base URL of the REST API
    pub api_base_url: String,
}

impl Endpoints {
    pub fn new<W: Into<String>, A: Into<String>>(websocket_url: W, api_base_url: A) -> Self {
        Self {
            websocket_url: websocket_url.into(),
            api_base_url: api_base_url.into(),
        }
    }
}

/// Session builder wired to the production transport and REST API
///
/// The REST client authenticates with `token`; the socket receives its
/// credential later through `ChatSession::connect`.
pub fn session_builder(
    endpoints: &Endpoints,
    config: SessionConfig,
    user_id: UserId,
    role: SenderRole,
    token: AuthToken,
) -> Result<SessionBuilder> {
    let transport = WsTransport::new(&endpoints.websocket_url)?.with_channels(config.channels.clone());
    let rest = RestClient::new(&endpoints.api_base_url, token)?;
    Ok(SessionBuilder::new(user_id, role)
        .with_config(config)
        .with_transport(transport)
        .with_history_api(rest.clone())
        .with_provisioner(rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoints_deserialize() {
        let endpoints: Endpoints = serde_json::from_str(
            r#"{"websocket_url": "wss://chat.florachat.app/ws", "api_base_url": "https://api.florachat.app"}"#,
        )
        .unwrap();
        assert_eq!(
            endpoints,
            Endpoints::new("wss://chat.florachat.app/ws", "https://api.florachat.app")
        );
    }

    #[test]
    fn test_invalid_endpoint_fails_early() {
        let endpoints = Endpoints::new("https://wrong-scheme", "https://api.florachat.app");
        assert!(session_builder(
            &endpoints,
            SessionConfig::default(),
            UserId::new("admin-1"),
            SenderRole::Admin,
            AuthToken::new("t"),
        )
        .is_err());
    }
}
