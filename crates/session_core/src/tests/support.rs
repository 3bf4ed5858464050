use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use shared::{
    domain::{TenantId, WorkerId},
    protocol::{OutboundContent, SessionEvent},
};
use storage::Storage;
use tokio::sync::{broadcast, mpsc};

use crate::{
    cipher::PassthroughCipher,
    connection::ConnectionContext,
    credentials::{AuthState, CredentialStore},
    lock::DistributedLock,
    settings::SessionSettings,
    socket::{
        CloseInfo, ProtocolSocket, SendAck, SocketConnector, SocketError, SocketEvent,
        SocketSession,
    },
};

pub const WAIT: Duration = Duration::from_secs(5);

pub fn fast_settings(worker: &str) -> SessionSettings {
    SessionSettings {
        worker_id: WorkerId::new(worker),
        claim_interval: Duration::from_secs(3600),
        auto_claim: false,
        lock_ttl_seconds: 300,
        min_renewal_interval: Duration::from_secs(60),
        max_reconnect_attempts: 5,
        base_reconnect_delay: Duration::from_millis(10),
        max_reconnect_delay: Duration::from_secs(1),
        reconnect_jitter: Duration::ZERO,
        stability_delay: Duration::from_millis(20),
        inter_send_delay: Duration::ZERO,
        queue_timeout: Duration::from_secs(5),
        ..SessionSettings::default()
    }
}

/// A socket whose traffic is recorded and whose events are driven by the test.
pub struct ScriptedSocket {
    sent: Mutex<Vec<(String, String)>>,
    failures: Mutex<VecDeque<SocketError>>,
    closed: AtomicBool,
    acks: AtomicUsize,
}

impl ScriptedSocket {
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().expect("sent lock").clone()
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.sent().into_iter().map(|(_, text)| text).collect()
    }

    pub fn fail_next(&self, err: SocketError) {
        self.failures.lock().expect("failures lock").push_back(err);
    }

    pub fn has_scripted_failures(&self) -> bool {
        !self.failures.lock().expect("failures lock").is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProtocolSocket for ScriptedSocket {
    async fn send(&self, target: &str, content: &OutboundContent) -> Result<SendAck, SocketError> {
        if let Some(err) = self.failures.lock().expect("failures lock").pop_front() {
            return Err(err);
        }
        let OutboundContent::Text { text } = content;
        self.sent
            .lock()
            .expect("sent lock")
            .push((target.to_string(), text.clone()));
        let n = self.acks.fetch_add(1, Ordering::SeqCst);
        Ok(SendAck {
            message_id: format!("ack-{n}"),
        })
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct OpenedSocket {
    pub tenant_id: TenantId,
    pub socket: Arc<ScriptedSocket>,
    pub events: mpsc::Sender<SocketEvent>,
}

impl OpenedSocket {
    pub async fn emit(&self, event: SocketEvent) {
        self.events.send(event).await.expect("event pump alive");
    }

    pub async fn open(&self) {
        self.emit(SocketEvent::Open).await;
    }

    pub async fn close_with(&self, code: u16, message: &str) {
        self.emit(SocketEvent::Closed(CloseInfo::new(Some(code), message)))
            .await;
    }
}

/// Hands every socket it opens to the test through a channel.
pub struct ScriptedConnector {
    opened: mpsc::UnboundedSender<OpenedSocket>,
    refuse: AtomicBool,
}

impl ScriptedConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<OpenedSocket>) {
        let (opened, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                opened,
                refuse: AtomicBool::new(false),
            }),
            rx,
        )
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }
}

#[async_trait]
impl SocketConnector for ScriptedConnector {
    async fn connect(&self, tenant_id: &TenantId, _auth: Arc<AuthState>) -> Result<SocketSession> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(anyhow!("scripted connector refused"));
        }
        let (tx, rx) = mpsc::channel(32);
        let socket = Arc::new(ScriptedSocket {
            sent: Mutex::new(Vec::new()),
            failures: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
            acks: AtomicUsize::new(0),
        });
        let _ = self.opened.send(OpenedSocket {
            tenant_id: tenant_id.clone(),
            socket: Arc::clone(&socket),
            events: tx,
        });
        Ok(SocketSession { socket, events: rx })
    }
}

pub fn context(
    storage: &Storage,
    settings: SessionSettings,
    connector: Arc<dyn SocketConnector>,
) -> ConnectionContext {
    let (events, _) = broadcast::channel(256);
    ConnectionContext {
        lock: DistributedLock::new(
            storage.clone(),
            settings.worker_id.clone(),
            settings.lock_ttl_seconds,
        ),
        credentials: CredentialStore::new(
            storage.clone(),
            Arc::new(PassthroughCipher),
            settings.credential_ttl,
        ),
        storage: storage.clone(),
        connector,
        events,
        settings: Arc::new(settings),
    }
}

pub async fn next_socket(sockets: &mut mpsc::UnboundedReceiver<OpenedSocket>) -> OpenedSocket {
    tokio::time::timeout(WAIT, sockets.recv())
        .await
        .expect("socket opened in time")
        .expect("connector alive")
}

pub async fn wait_for<F>(events: &mut broadcast::Receiver<SessionEvent>, mut matches: F) -> SessionEvent
where
    F: FnMut(&SessionEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(err) => panic!("event stream closed: {err}"),
            }
        }
    })
    .await
    .expect("event arrived in time")
}

pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(WAIT, async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition reached in time");
}
