use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use shared::{
    domain::TenantId,
    protocol::{InboundMessage, OutboundContent, TerminalReason},
};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::info;
use uuid::Uuid;

use crate::credentials::{AccountIdentity, AuthState, Credentials};

const EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendAck {
    pub message_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SocketError {
    #[error("connection lost")]
    ConnectionLost,
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("{0}")]
    Other(String),
}

/// Close details reported by the messaging network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: Option<u16>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseKind {
    Transient,
    Terminal(TerminalReason),
}

impl CloseInfo {
    pub fn new(code: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn connection_lost() -> Self {
        Self::new(None, "event stream ended")
    }

    pub fn classify(&self) -> CloseKind {
        let message = self.message.to_ascii_lowercase();
        match self.code {
            Some(401) => CloseKind::Terminal(TerminalReason::LoggedOut),
            Some(440) => CloseKind::Terminal(TerminalReason::Superseded),
            _ if message.contains("conflict") || message.contains("replaced") => {
                CloseKind::Terminal(TerminalReason::Superseded)
            }
            Some(402 | 403 | 406) => CloseKind::Terminal(TerminalReason::Rejected),
            _ => CloseKind::Transient,
        }
    }
}

#[derive(Debug, Clone)]
pub enum SocketEvent {
    PairingCode(String),
    Open,
    Closed(CloseInfo),
    CredentialsUpdated(Box<Credentials>),
    MessageStatus {
        message_id: String,
        remote_target: String,
        status: String,
    },
    Inbound(InboundMessage),
}

/// One live connection to the messaging network.
#[async_trait]
pub trait ProtocolSocket: Send + Sync {
    async fn send(&self, target: &str, content: &OutboundContent) -> Result<SendAck, SocketError>;
    async fn close(&self);
}

pub struct SocketSession {
    pub socket: Arc<dyn ProtocolSocket>,
    pub events: mpsc::Receiver<SocketEvent>,
}

/// Opens protocol sockets using a tenant's credentials.
#[async_trait]
pub trait SocketConnector: Send + Sync {
    async fn connect(&self, tenant_id: &TenantId, auth: Arc<AuthState>) -> Result<SocketSession>;
}

pub struct MissingSocketConnector;

#[async_trait]
impl SocketConnector for MissingSocketConnector {
    async fn connect(&self, tenant_id: &TenantId, _auth: Arc<AuthState>) -> Result<SocketSession> {
        Err(anyhow!(
            "no protocol socket backend configured for tenant '{tenant_id}'"
        ))
    }
}

/// Local development backend: pairs instantly and acknowledges every send.
#[derive(Default)]
pub struct LoopbackConnector;

struct LoopbackSocket {
    tenant_id: TenantId,
    events: mpsc::Sender<SocketEvent>,
    closed: AtomicBool,
}

#[async_trait]
impl SocketConnector for LoopbackConnector {
    async fn connect(&self, tenant_id: &TenantId, auth: Arc<AuthState>) -> Result<SocketSession> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let creds = auth.credentials().await;
        if !creds.is_paired() {
            let code = format!("loopback-{}", Uuid::new_v4().simple());
            tx.send(SocketEvent::PairingCode(code)).await?;
            let mut paired = creds;
            paired.me = Some(AccountIdentity {
                id: format!("{tenant_id}@loopback"),
                name: Some(tenant_id.to_string()),
            });
            paired.platform = Some("loopback".to_string());
            tx.send(SocketEvent::CredentialsUpdated(Box::new(paired)))
                .await?;
        }
        tx.send(SocketEvent::Open).await?;
        info!(tenant_id = %tenant_id, "socket: loopback connection opened");

        let socket = Arc::new(LoopbackSocket {
            tenant_id: tenant_id.clone(),
            events: tx,
            closed: AtomicBool::new(false),
        });
        Ok(SocketSession { socket, events: rx })
    }
}

#[async_trait]
impl ProtocolSocket for LoopbackSocket {
    async fn send(&self, target: &str, _content: &OutboundContent) -> Result<SendAck, SocketError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SocketError::ConnectionLost);
        }
        let message_id = Uuid::new_v4().simple().to_string().to_ascii_uppercase();
        let _ = self
            .events
            .send(SocketEvent::MessageStatus {
                message_id: message_id.clone(),
                remote_target: target.to_string(),
                status: format!("delivered:{}", Utc::now().timestamp_millis()),
            })
            .await;
        Ok(SendAck { message_id })
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!(tenant_id = %self.tenant_id, "socket: loopback connection closed");
        }
    }
}

/// Full addresses pass through; bare numbers become `{digits}@{domain}`.
pub fn normalize_target(target: &str, address_domain: &str) -> String {
    let trimmed = target.trim();
    if trimmed.contains('@') {
        return trimmed.to_string();
    }
    let digits: String = trimmed.chars().filter(char::is_ascii_digit).collect();
    format!("{digits}@{address_domain}")
}

#[cfg(test)]
#[path = "tests/socket_tests.rs"]
mod tests;
