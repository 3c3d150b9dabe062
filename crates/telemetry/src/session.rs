//! Telemetry session model.
//!
//! # State Transitions
//!
//! ```text
//! Disconnected
//!     ↓ (connect)
//! Connecting ──────────┐
//!     ↓ (peer verified) │
//! Authenticated ───────┤
//!     ↓ (stream)        ├──→ Faulted ──→ Connecting
//! Streaming ───────────┘
//!     ↓ (close)
//! Disconnected
//! ```
//!
//! Any state can return to `Disconnected` on shutdown.

use crate::batch::SignedBatch;
use crate::error::{TelemetryError, TelemetryResult};
use async_trait::async_trait;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use tokio::sync::watch;
use vitalguard_core::{ChannelError, TimestampMs};
use vitalguard_crypto::verify_signature;
use vitalguard_identity::{Certificate, ClientCredentials};

const MAX_HISTORY_SIZE: usize = 100;
const HELLO_DOMAIN: &[u8] = b"vitalguard-session-v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Authenticated,
    Streaming,
    Faulted,
}

impl SessionState {
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Authenticated)
                | (Connecting, Faulted)
                | (Authenticated, Streaming)
                | (Authenticated, Faulted)
                | (Streaming, Faulted)
                | (Faulted, Connecting)
                | (_, Disconnected)
        ) && *self != next
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Disconnected => "Disconnected",
            SessionState::Connecting => "Connecting",
            SessionState::Authenticated => "Authenticated",
            SessionState::Streaming => "Streaming",
            SessionState::Faulted => "Faulted",
        };
        f.write_str(s)
    }
}

/// Record of a session state change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionTransition {
    pub from: SessionState,
    pub to: SessionState,
    pub at_ms: TimestampMs,
    pub reason: Option<String>,
}

/// Current session state with bounded history, published on a watch channel.
pub struct SessionStateMachine {
    current: SessionState,
    history: VecDeque<SessionTransition>,
    publisher: watch::Sender<SessionState>,
}

impl SessionStateMachine {
    pub fn new() -> Self {
        let (publisher, _) = watch::channel(SessionState::Disconnected);
        Self {
            current: SessionState::Disconnected,
            history: VecDeque::with_capacity(MAX_HISTORY_SIZE),
            publisher,
        }
    }

    pub fn current(&self) -> SessionState {
        self.current
    }

    pub fn history(&self) -> &VecDeque<SessionTransition> {
        &self.history
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.publisher.subscribe()
    }

    pub fn transition(
        &mut self,
        to: SessionState,
        at_ms: TimestampMs,
        reason: Option<String>,
    ) -> TelemetryResult<SessionTransition> {
        if !self.current.can_transition_to(to) {
            return Err(TelemetryError::InvalidTransition {
                from: self.current,
                to,
            });
        }

        let transition = SessionTransition {
            from: self.current,
            to,
            at_ms,
            reason,
        };
        if self.history.len() >= MAX_HISTORY_SIZE {
            self.history.pop_front();
        }
        self.history.push_back(transition.clone());
        self.current = to;
        self.publisher.send_replace(to);
        Ok(transition)
    }
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

/// Structured server-side refusal of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Rejection {
    AuthExpired,
    Malformed,
    RateLimited,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Rejection::AuthExpired => "AuthExpired",
            Rejection::Malformed => "Malformed",
            Rejection::RateLimited => "RateLimited",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchResponse {
    Ack { batch_id: String },
    Rejected {
        batch_id: String,
        reason: Rejection,
        detail: String,
    },
}

impl BatchResponse {
    pub fn batch_id(&self) -> &str {
        match self {
            BatchResponse::Ack { batch_id } | BatchResponse::Rejected { batch_id, .. } => batch_id,
        }
    }
}

/// Client half of the mutual authentication handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientHello {
    pub certificate: Certificate,
    /// Hex-encoded random challenge
    pub nonce: String,
    pub timestamp_ms: TimestampMs,
    pub signature: Vec<u8>,
}

fn hello_message(cert_id: &str, nonce: &str, timestamp_ms: TimestampMs) -> Vec<u8> {
    let mut message = Vec::with_capacity(HELLO_DOMAIN.len() + cert_id.len() + nonce.len() + 8);
    message.extend_from_slice(HELLO_DOMAIN);
    message.extend_from_slice(cert_id.as_bytes());
    message.extend_from_slice(nonce.as_bytes());
    message.extend_from_slice(&timestamp_ms.to_le_bytes());
    message
}

impl ClientHello {
    pub fn new(credentials: &ClientCredentials, timestamp_ms: TimestampMs) -> Self {
        let mut nonce = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        let nonce = hex::encode(nonce);
        let signature = credentials
            .key_pair
            .sign(&hello_message(&credentials.certificate.id, &nonce, timestamp_ms))
            .to_vec();
        Self {
            certificate: credentials.certificate.clone(),
            nonce,
            timestamp_ms,
            signature,
        }
    }

    /// Proof that the sender holds the certificate's private key.
    pub fn verify_possession(&self) -> TelemetryResult<()> {
        verify_signature(
            &self.certificate.public_key,
            &hello_message(&self.certificate.id, &self.nonce, self.timestamp_ms),
            &self.signature,
        )?;
        Ok(())
    }
}

/// Opens authenticated sessions to the telemetry server.
#[async_trait]
pub trait TelemetryChannel: Send + Sync {
    async fn connect(&self, hello: ClientHello) -> Result<Box<dyn TelemetrySession>, ChannelError>;
}

/// One open session. Responses may arrive out of order relative to sends.
#[async_trait]
pub trait TelemetrySession: Send {
    /// Certificate the server presented during the handshake.
    fn peer_certificate(&self) -> &Certificate;

    async fn send(&mut self, batch: &SignedBatch) -> Result<(), ChannelError>;

    async fn next_response(&mut self) -> Result<BatchResponse, ChannelError>;

    async fn close(&mut self);
}
