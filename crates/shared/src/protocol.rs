use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{TenantId, WorkerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Uninitialized,
    Connecting,
    Open,
    ClosedTransient,
    ClosedTerminal,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::ClosedTransient => "closed_transient",
            Self::ClosedTerminal => "closed_terminal",
        }
    }

    pub fn is_closed(self) -> bool {
        matches!(self, Self::ClosedTransient | Self::ClosedTerminal)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalReason {
    LoggedOut,
    Superseded,
    Rejected,
    MaxReconnectAttempts,
    LeaseLost,
}

impl TerminalReason {
    /// Whether the paired identity is gone and the tenant must pair again.
    pub fn requires_repairing(self) -> bool {
        matches!(self, Self::LoggedOut | Self::Superseded)
    }

    /// Whether the connection gave up its slot on this worker.
    pub fn retires_session(self) -> bool {
        matches!(self, Self::MaxReconnectAttempts | Self::LeaseLost)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundContent {
    Text { text: String },
}

impl OutboundContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReceipt {
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub queued: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub event_id: String,
    pub trace_id: Uuid,
    pub sender: String,
    #[serde(default)]
    pub from_me: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStatus {
    pub tenant_id: TenantId,
    pub worker_id: WorkerId,
    pub connection_state: ConnectionState,
    pub is_connected: bool,
    pub qr_available: bool,
    pub pending_messages: usize,
    pub reconnect_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal_reason: Option<TerminalReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_open_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub worker_id: WorkerId,
    pub sessions: Vec<SessionStatus>,
    pub session_count: usize,
    pub max_sessions: usize,
    pub is_shutting_down: bool,
}

/// Connection lifecycle notifications published for upstream collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum SessionEvent {
    PairingCodeAvailable {
        tenant_id: TenantId,
        code: String,
    },
    Connected {
        tenant_id: TenantId,
    },
    Disconnected {
        tenant_id: TenantId,
        #[serde(default)]
        code: Option<u16>,
        will_retry: bool,
    },
    ReconnectScheduled {
        tenant_id: TenantId,
        attempt: u32,
        delay_ms: u64,
    },
    Terminal {
        tenant_id: TenantId,
        reason: TerminalReason,
    },
    InboundMessage {
        tenant_id: TenantId,
        message: InboundMessage,
    },
}

impl SessionEvent {
    pub fn tenant_id(&self) -> &TenantId {
        match self {
            Self::PairingCodeAvailable { tenant_id, .. }
            | Self::Connected { tenant_id }
            | Self::Disconnected { tenant_id, .. }
            | Self::ReconnectScheduled { tenant_id, .. }
            | Self::Terminal { tenant_id, .. }
            | Self::InboundMessage { tenant_id, .. } => tenant_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthIssue {
    NotConnected,
    LockNotOwned,
    LockOwnershipWarning,
    SessionTooOld,
    OrphanedLock,
    ExpiredLock,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionHealth {
    pub tenant_id: TenantId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<WorkerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_state: Option<ConnectionState>,
    pub is_connected: bool,
    pub lock_owned: bool,
    pub last_seen_ms: i64,
    pub qr_available: bool,
    pub status: HealthStatus,
    pub issues: Vec<HealthIssue>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSummary {
    pub total_sessions: usize,
    pub healthy_sessions: usize,
    pub warning_sessions: usize,
    pub error_sessions: usize,
    pub orphaned_locks: usize,
    pub expired_locks: usize,
    pub timestamp_ms: i64,
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
