//! Transport abstraction
//!
//! A transport turns a credential into a live [`TransportLink`]: a pair of
//! frame channels. The connection driver is the only owner of a link. A link is
//! considered dropped as soon as its inbound channel closes or an outbound
//! write fails.

use async_trait::async_trait;
use core::fmt;
use florachat_core::{ChannelConfig, ClientFrame, Result, ServerFrame};
use tokio::sync::mpsc;

/// Frames written towards the server
pub type FrameSender = mpsc::Sender<ClientFrame>;
/// Frames read from the server
pub type FrameReceiver = mpsc::Receiver<ServerFrame>;

// ----------------------------------------------------------------------------
// Credential
// ----------------------------------------------------------------------------

/// Bearer credential presented once during the handshake
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken(String);

impl AuthToken {
    pub fn new<S: Into<String>>(token: S) -> Self {
        Self(token.into())
    }

    /// Raw token, for building the `Authorization` header
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn bearer_header(&self) -> String {
        format!("Bearer {}", self.0)
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthToken(<redacted>)")
    }
}

// ----------------------------------------------------------------------------
// Link
// ----------------------------------------------------------------------------

/// Live connection to the server
#[derive(Debug)]
pub struct TransportLink {
    pub outbound: FrameSender,
    pub inbound: FrameReceiver,
}

impl TransportLink {
    pub fn new(outbound: FrameSender, inbound: FrameReceiver) -> Self {
        Self { outbound, inbound }
    }
}

/// Channel ends a transport implementation keeps for itself
#[derive(Debug)]
pub struct TransportEnds {
    /// Frames the session wants written
    pub outbound: mpsc::Receiver<ClientFrame>,
    /// Where decoded server frames are delivered
    pub inbound: mpsc::Sender<ServerFrame>,
}

/// Create a link and the transport-side ends of its channels
pub fn create_link(config: &ChannelConfig) -> (TransportLink, TransportEnds) {
    let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_frame_buffer_size);
    let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_frame_buffer_size);
    (
        TransportLink::new(outbound_tx, inbound_rx),
        TransportEnds {
            outbound: outbound_rx,
            inbound: inbound_tx,
        },
    )
}

// ----------------------------------------------------------------------------
// Transport Trait
// ----------------------------------------------------------------------------

/// Connection factory used by the connection driver
///
/// `open` fails with [`florachat_core::AuthError`] when the server rejects the
/// credential and with [`florachat_core::NetworkError`] when the link cannot be
/// established at all.
#[async_trait]
pub trait Transport: Send + 'static {
    async fn open(&mut self, token: &AuthToken) -> Result<TransportLink>;

    /// Human-readable endpoint, for logs
    fn endpoint(&self) -> String;
}

#[async_trait]
impl Transport for Box<dyn Transport> {
    async fn open(&mut self, token: &AuthToken) -> Result<TransportLink> {
        (**self).open(token).await
    }

    fn endpoint(&self) -> String {
        (**self).endpoint()
    }
}
