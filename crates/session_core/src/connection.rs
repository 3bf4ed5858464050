use std::{
    collections::VecDeque,
    mem,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use rand::Rng;
use shared::{
    domain::TenantId,
    protocol::{
        ConnectionState, InboundMessage, OutboundContent, SendReceipt, SessionEvent,
        SessionStatus, TerminalReason,
    },
};
use storage::{now_ms, Storage};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use crate::{
    credentials::{AuthState, CredentialStore, Credentials},
    error::SendError,
    lock::DistributedLock,
    routing::{RouteCheck, RouteTracker},
    schedule::ScheduledTask,
    settings::SessionSettings,
    socket::{normalize_target, CloseInfo, CloseKind, ProtocolSocket, SocketConnector, SocketError, SocketEvent, SocketSession},
};

/// `min(base * 2^(attempt-1) + jitter, cap)` with uniform jitter in `[0, jitter]`.
pub fn reconnect_delay(attempt: u32, base: Duration, cap: Duration, jitter: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(20);
    let backoff = base.saturating_mul(1u32 << exponent);
    let jitter_ms = u64::try_from(jitter.as_millis()).unwrap_or(u64::MAX);
    let jitter = if jitter_ms == 0 {
        Duration::ZERO
    } else {
        Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    };
    backoff.saturating_add(jitter).min(cap)
}

/// Collaborators shared by every connection a worker owns.
#[derive(Clone)]
pub struct ConnectionContext {
    pub settings: Arc<SessionSettings>,
    pub storage: Storage,
    pub lock: DistributedLock,
    pub credentials: CredentialStore,
    pub connector: Arc<dyn SocketConnector>,
    pub events: broadcast::Sender<SessionEvent>,
}

struct PendingMessage {
    id: u64,
    target: String,
    content: OutboundContent,
    enqueued_at: Instant,
    responder: oneshot::Sender<Result<SendReceipt, SendError>>,
    _deadline: ScheduledTask,
}

impl PendingMessage {
    fn resolve(self, result: Result<SendReceipt, SendError>) {
        let _ = self.responder.send(result);
    }
}

struct ConnectionInner {
    state: ConnectionState,
    shutting_down: bool,
    retired: bool,
    terminal_reason: Option<TerminalReason>,
    generation: u64,
    reconnect_attempts: u32,
    socket: Option<Arc<dyn ProtocolSocket>>,
    auth: Option<Arc<AuthState>>,
    pending: VecDeque<PendingMessage>,
    draining: Option<u64>,
    routes: RouteTracker,
    pairing_code: Option<String>,
    last_open_at: Option<DateTime<Utc>>,
    lease_renewal: Option<ScheduledTask>,
    event_pump: Option<ScheduledTask>,
    stability_timer: Option<ScheduledTask>,
    reconnect_timer: Option<ScheduledTask>,
}

impl ConnectionInner {
    fn new(route_ttl: Duration) -> Self {
        Self {
            state: ConnectionState::Uninitialized,
            shutting_down: false,
            retired: false,
            terminal_reason: None,
            generation: 0,
            reconnect_attempts: 0,
            socket: None,
            auth: None,
            pending: VecDeque::new(),
            draining: None,
            routes: RouteTracker::new(route_ttl),
            pairing_code: None,
            last_open_at: None,
            lease_renewal: None,
            event_pump: None,
            stability_timer: None,
            reconnect_timer: None,
        }
    }

    /// Events from an older socket, or after shutdown, are ignored.
    fn is_current(&self, generation: u64) -> bool {
        self.generation == generation
            && !self.shutting_down
            && self.state != ConnectionState::ClosedTerminal
    }

    fn rejection(&self) -> Option<SendError> {
        if self.shutting_down {
            return Some(SendError::NotConnected);
        }
        match self.state {
            ConnectionState::Uninitialized => Some(SendError::NotConnected),
            ConnectionState::ClosedTerminal => Some(
                self.terminal_reason
                    .map(SendError::for_terminal)
                    .unwrap_or(SendError::NotConnected),
            ),
            _ => None,
        }
    }

    fn cancel_timers(&mut self) {
        self.lease_renewal = None;
        self.event_pump = None;
        self.stability_timer = None;
        self.reconnect_timer = None;
    }
}

enum Kick {
    None,
    Reconnect,
    Drain(u64),
}

/// The single live session for one tenant on this worker.
pub struct SessionConnection {
    tenant_id: TenantId,
    ctx: ConnectionContext,
    next_pending_id: AtomicU64,
    inner: Mutex<ConnectionInner>,
}

impl SessionConnection {
    pub fn new(tenant_id: TenantId, ctx: ConnectionContext) -> Arc<Self> {
        let route_ttl = ctx.settings.route_ttl;
        Arc::new(Self {
            tenant_id,
            ctx,
            next_pending_id: AtomicU64::new(1),
            inner: Mutex::new(ConnectionInner::new(route_ttl)),
        })
    }

    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    /// Takes the lease, loads credentials and opens the socket.
    ///
    /// Returns `false` when another worker holds the lease or setup failed;
    /// a failed setup never leaves the lease behind.
    pub async fn initialize(self: &Arc<Self>) -> bool {
        {
            let mut inner = self.inner.lock().await;
            if inner.shutting_down {
                return false;
            }
            if inner.state != ConnectionState::Uninitialized {
                return matches!(
                    inner.state,
                    ConnectionState::Connecting | ConnectionState::Open
                );
            }
            inner.state = ConnectionState::Connecting;
        }

        match self.ctx.lock.acquire(&self.tenant_id).await {
            Ok(true) => {}
            Ok(false) => {
                self.inner.lock().await.state = ConnectionState::Uninitialized;
                return false;
            }
            Err(err) => {
                error!(tenant_id = %self.tenant_id, error = %err, "session: lock acquire failed");
                self.inner.lock().await.state = ConnectionState::Uninitialized;
                return false;
            }
        }

        match self.open_first_socket().await {
            Ok(()) => true,
            Err(err) => {
                error!(
                    tenant_id = %self.tenant_id,
                    error = %err,
                    "session: setup failed, releasing lock"
                );
                {
                    let mut inner = self.inner.lock().await;
                    inner.cancel_timers();
                    inner.auth = None;
                    if !inner.shutting_down {
                        inner.state = ConnectionState::Uninitialized;
                    }
                }
                if let Err(err) = self.ctx.lock.release(&self.tenant_id).await {
                    warn!(tenant_id = %self.tenant_id, error = %err, "session: lock release after failed setup errored");
                }
                false
            }
        }
    }

    async fn open_first_socket(self: &Arc<Self>) -> Result<()> {
        let auth = self.ctx.credentials.load_auth_state(&self.tenant_id).await?;
        let session = self
            .ctx
            .connector
            .connect(&self.tenant_id, Arc::clone(&auth))
            .await?;

        let mut inner = self.inner.lock().await;
        if inner.shutting_down {
            drop(inner);
            session.socket.close().await;
            bail!("connection was shut down during setup");
        }
        inner.auth = Some(auth);
        self.install_socket(&mut inner, session);
        inner.lease_renewal = Some(self.spawn_lease_renewal());
        info!(
            tenant_id = %self.tenant_id,
            worker_id = %self.ctx.lock.worker_id(),
            "session: socket opened, waiting for network"
        );
        Ok(())
    }

    fn install_socket(self: &Arc<Self>, inner: &mut ConnectionInner, session: SocketSession) {
        inner.generation += 1;
        inner.socket = Some(session.socket);
        inner.event_pump = Some(self.spawn_event_pump(inner.generation, session.events));
    }

    fn spawn_event_pump(
        self: &Arc<Self>,
        generation: u64,
        mut events: mpsc::Receiver<SocketEvent>,
    ) -> ScheduledTask {
        let weak = Arc::downgrade(self);
        ScheduledTask::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(conn) = weak.upgrade() else {
                    return;
                };
                let closed = matches!(event, SocketEvent::Closed(_));
                conn.handle_socket_event(generation, event).await;
                if closed {
                    return;
                }
            }
            if let Some(conn) = weak.upgrade() {
                conn.handle_close(generation, CloseInfo::connection_lost())
                    .await;
            }
        })
    }

    fn spawn_lease_renewal(self: &Arc<Self>) -> ScheduledTask {
        let weak = Arc::downgrade(self);
        self.ctx.lock.spawn_renewal(
            self.tenant_id.clone(),
            self.ctx.settings.renewal_interval(),
            move || {
                if let Some(conn) = weak.upgrade() {
                    tokio::spawn(async move { conn.handle_lease_lost().await });
                }
            },
        )
    }

    async fn handle_socket_event(self: &Arc<Self>, generation: u64, event: SocketEvent) {
        match event {
            SocketEvent::PairingCode(code) => self.on_pairing_code(generation, code).await,
            SocketEvent::Open => self.on_open(generation).await,
            SocketEvent::Closed(info) => self.handle_close(generation, info).await,
            SocketEvent::CredentialsUpdated(creds) => {
                self.on_credentials_updated(generation, *creds).await
            }
            SocketEvent::MessageStatus {
                message_id,
                remote_target,
                status,
            } => {
                self.on_message_status(&message_id, &remote_target, &status)
                    .await
            }
            SocketEvent::Inbound(message) => self.on_inbound(generation, message).await,
        }
    }

    async fn on_pairing_code(&self, generation: u64, code: String) {
        {
            let mut inner = self.inner.lock().await;
            if !inner.is_current(generation) {
                return;
            }
            inner.pairing_code = Some(code.clone());
        }
        info!(
            tenant_id = %self.tenant_id,
            code_len = code.len(),
            "session: pairing code available"
        );
        self.publish(SessionEvent::PairingCodeAvailable {
            tenant_id: self.tenant_id.clone(),
            code,
        });
    }

    async fn on_open(self: &Arc<Self>, generation: u64) {
        {
            let mut inner = self.inner.lock().await;
            if !inner.is_current(generation) {
                return;
            }
            inner.state = ConnectionState::Open;
            inner.reconnect_attempts = 0;
            inner.pairing_code = None;
            inner.last_open_at = Some(Utc::now());
            inner.reconnect_timer = None;
            inner.stability_timer = Some(self.spawn_stability_timer(generation));
            info!(
                tenant_id = %self.tenant_id,
                pending = inner.pending.len(),
                "session: connection open"
            );
        }
        self.publish(SessionEvent::Connected {
            tenant_id: self.tenant_id.clone(),
        });
    }

    fn spawn_stability_timer(self: &Arc<Self>, generation: u64) -> ScheduledTask {
        let weak = Arc::downgrade(self);
        ScheduledTask::after(self.ctx.settings.stability_delay, move || async move {
            if let Some(conn) = weak.upgrade() {
                conn.drain_backlog(generation).await;
            }
        })
    }

    /// Flushes the backlog in order over the socket of `generation`.
    async fn drain_backlog(&self, generation: u64) {
        {
            let mut inner = self.inner.lock().await;
            if !inner.is_current(generation)
                || inner.state != ConnectionState::Open
                || inner.draining == Some(generation)
            {
                return;
            }
            inner.draining = Some(generation);
        }

        let mut delivered = 0usize;
        loop {
            let next = {
                let mut inner = self.inner.lock().await;
                if !inner.is_current(generation) || inner.state != ConnectionState::Open {
                    None
                } else {
                    match inner.socket.clone() {
                        Some(socket) => inner.pending.pop_front().map(|item| (socket, item)),
                        None => None,
                    }
                }
            };
            let Some((socket, item)) = next else {
                break;
            };

            match socket.send(&item.target, &item.content).await {
                Ok(ack) => {
                    self.inner
                        .lock()
                        .await
                        .routes
                        .record(ack.message_id.clone(), item.target.clone());
                    debug!(
                        tenant_id = %self.tenant_id,
                        message_id = %ack.message_id,
                        waited_ms = millis_u64(item.enqueued_at.elapsed()),
                        "session: queued message delivered"
                    );
                    let receipt = SendReceipt {
                        target: item.target.clone(),
                        message_id: Some(ack.message_id),
                        queued: true,
                    };
                    item.resolve(Ok(receipt));
                    delivered += 1;
                }
                Err(SocketError::ConnectionLost) => {
                    warn!(
                        tenant_id = %self.tenant_id,
                        "session: connection lost mid-drain, message re-queued"
                    );
                    let mut inner = self.inner.lock().await;
                    if let Some(err) = inner.rejection() {
                        drop(inner);
                        item.resolve(Err(err));
                    } else {
                        inner.pending.push_front(item);
                    }
                    break;
                }
                Err(err) => {
                    warn!(
                        tenant_id = %self.tenant_id,
                        target = %item.target,
                        error = %err,
                        "session: queued message rejected by network"
                    );
                    item.resolve(Err(SendError::Network(err.to_string())));
                }
            }

            if !self.ctx.settings.inter_send_delay.is_zero() {
                tokio::time::sleep(self.ctx.settings.inter_send_delay).await;
            }
        }

        let mut inner = self.inner.lock().await;
        if inner.draining == Some(generation) {
            inner.draining = None;
        }
        if delivered > 0 {
            info!(
                tenant_id = %self.tenant_id,
                delivered,
                remaining = inner.pending.len(),
                "session: backlog drained"
            );
        }
    }

    async fn handle_close(self: &Arc<Self>, generation: u64, info: CloseInfo) {
        let kind = info.classify();
        let mut inner = self.inner.lock().await;
        if !inner.is_current(generation) || inner.state == ConnectionState::ClosedTransient {
            return;
        }
        let was_open = inner.state == ConnectionState::Open;
        inner.socket = None;
        inner.stability_timer = None;

        match kind {
            CloseKind::Terminal(reason) => {
                inner.state = ConnectionState::ClosedTerminal;
                inner.terminal_reason = Some(reason);
                inner.reconnect_timer = None;
                inner.pairing_code = None;
                let backlog = mem::take(&mut inner.pending);
                let clear_credentials = match reason {
                    TerminalReason::LoggedOut => true,
                    TerminalReason::Superseded => self.ctx.settings.clear_auth_on_conflict,
                    _ => false,
                };
                if clear_credentials {
                    inner.auth = None;
                }
                drop(inner);

                warn!(
                    tenant_id = %self.tenant_id,
                    code = ?info.code,
                    reason = ?reason,
                    pending = backlog.len(),
                    "session: terminal close, tenant must pair again"
                );
                fail_backlog(backlog, SendError::Terminal(reason));
                if clear_credentials {
                    if let Err(err) = self.ctx.credentials.clear(&self.tenant_id).await {
                        error!(
                            tenant_id = %self.tenant_id,
                            error = %err,
                            "session: failed to clear credentials after terminal close"
                        );
                    }
                }
                self.publish(SessionEvent::Disconnected {
                    tenant_id: self.tenant_id.clone(),
                    code: info.code,
                    will_retry: false,
                });
                self.publish(SessionEvent::Terminal {
                    tenant_id: self.tenant_id.clone(),
                    reason,
                });
            }
            CloseKind::Transient => {
                info!(
                    tenant_id = %self.tenant_id,
                    code = ?info.code,
                    message = %info.message,
                    was_open,
                    "session: connection closed"
                );
                self.schedule_reconnect(inner, info.code).await;
            }
        }
    }

    async fn schedule_reconnect(
        self: &Arc<Self>,
        mut inner: MutexGuard<'_, ConnectionInner>,
        code: Option<u16>,
    ) {
        let settings = &self.ctx.settings;
        if inner.reconnect_attempts >= settings.max_reconnect_attempts {
            inner.state = ConnectionState::ClosedTerminal;
            inner.terminal_reason = Some(TerminalReason::MaxReconnectAttempts);
            inner.retired = true;
            inner.lease_renewal = None;
            inner.reconnect_timer = None;
            inner.auth = None;
            let attempts = inner.reconnect_attempts;
            let backlog = mem::take(&mut inner.pending);
            drop(inner);

            error!(
                tenant_id = %self.tenant_id,
                attempts,
                pending = backlog.len(),
                "session: reconnect attempts exhausted, giving up"
            );
            fail_backlog(backlog, SendError::MaxReconnectAttempts);
            if let Err(err) = self.ctx.lock.release(&self.tenant_id).await {
                warn!(tenant_id = %self.tenant_id, error = %err, "session: lock release after giving up errored");
            }
            self.publish(SessionEvent::Disconnected {
                tenant_id: self.tenant_id.clone(),
                code,
                will_retry: false,
            });
            self.publish(SessionEvent::Terminal {
                tenant_id: self.tenant_id.clone(),
                reason: TerminalReason::MaxReconnectAttempts,
            });
            return;
        }

        inner.reconnect_attempts += 1;
        let attempt = inner.reconnect_attempts;
        let delay = reconnect_delay(
            attempt,
            settings.base_reconnect_delay,
            settings.max_reconnect_delay,
            settings.reconnect_jitter,
        );
        inner.state = ConnectionState::ClosedTransient;
        let weak = Arc::downgrade(self);
        inner.reconnect_timer = Some(ScheduledTask::after(delay, move || async move {
            if let Some(conn) = weak.upgrade() {
                conn.reconnect().await;
            }
        }));
        drop(inner);

        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        info!(
            tenant_id = %self.tenant_id,
            attempt,
            delay_ms,
            "session: reconnect scheduled"
        );
        self.publish(SessionEvent::Disconnected {
            tenant_id: self.tenant_id.clone(),
            code,
            will_retry: true,
        });
        self.publish(SessionEvent::ReconnectScheduled {
            tenant_id: self.tenant_id.clone(),
            attempt,
            delay_ms,
        });
    }

    /// Reopens the socket with the cached auth state; the lease stays put.
    fn reconnect(self: Arc<Self>) -> BoxFuture<'static, ()> {
        async move {
            let (auth, attempt) = {
                let mut inner = self.inner.lock().await;
                inner.reconnect_timer = None;
                if inner.shutting_down || inner.state != ConnectionState::ClosedTransient {
                    return;
                }
                inner.state = ConnectionState::Connecting;
                (inner.auth.clone(), inner.reconnect_attempts)
            };

            let auth = match auth {
                Some(auth) => Ok(auth),
                None => self.ctx.credentials.load_auth_state(&self.tenant_id).await,
            };
            info!(tenant_id = %self.tenant_id, attempt, "session: reconnecting");
            let connected = match auth {
                Ok(auth) => self
                    .ctx
                    .connector
                    .connect(&self.tenant_id, Arc::clone(&auth))
                    .await
                    .map(|session| (auth, session)),
                Err(err) => Err(err),
            };

            match connected {
                Ok((auth, session)) => {
                    let mut inner = self.inner.lock().await;
                    if inner.shutting_down || inner.state != ConnectionState::Connecting {
                        drop(inner);
                        session.socket.close().await;
                        return;
                    }
                    inner.auth = Some(auth);
                    self.install_socket(&mut inner, session);
                }
                Err(err) => {
                    warn!(
                        tenant_id = %self.tenant_id,
                        attempt,
                        error = %err,
                        "session: reconnect failed"
                    );
                    let inner = self.inner.lock().await;
                    if !inner.shutting_down && inner.state == ConnectionState::Connecting {
                        self.schedule_reconnect(inner, None).await;
                    }
                }
            }
        }
        .boxed()
    }

    async fn handle_lease_lost(&self) {
        let (socket, backlog) = {
            let mut inner = self.inner.lock().await;
            if inner.shutting_down || inner.state == ConnectionState::ClosedTerminal {
                return;
            }
            inner.state = ConnectionState::ClosedTerminal;
            inner.terminal_reason = Some(TerminalReason::LeaseLost);
            inner.retired = true;
            inner.cancel_timers();
            inner.auth = None;
            (inner.socket.take(), mem::take(&mut inner.pending))
        };

        error!(
            tenant_id = %self.tenant_id,
            worker_id = %self.ctx.lock.worker_id(),
            pending = backlog.len(),
            "session: lease lost, stopping without releasing"
        );
        fail_backlog(backlog, SendError::NotConnected);
        if let Some(socket) = socket {
            socket.close().await;
        }
        self.publish(SessionEvent::Terminal {
            tenant_id: self.tenant_id.clone(),
            reason: TerminalReason::LeaseLost,
        });
    }

    async fn on_credentials_updated(&self, generation: u64, creds: Credentials) {
        let auth = {
            let inner = self.inner.lock().await;
            if !inner.is_current(generation) {
                return;
            }
            inner.auth.clone()
        };
        let Some(auth) = auth else {
            return;
        };
        match auth.replace_credentials(creds).await {
            Ok(()) => info!(tenant_id = %self.tenant_id, "session: rotated credentials saved"),
            Err(err) => error!(
                tenant_id = %self.tenant_id,
                error = %err,
                "session: failed to save rotated credentials"
            ),
        }
    }

    async fn on_message_status(&self, message_id: &str, remote_target: &str, status: &str) {
        let check = self.inner.lock().await.routes.check(message_id, remote_target);
        match check {
            RouteCheck::Mismatch { expected } => warn!(
                tenant_id = %self.tenant_id,
                message_id,
                expected = %expected,
                remote_target,
                status,
                "session: routing mismatch on delivery status"
            ),
            RouteCheck::Matches | RouteCheck::Unknown => debug!(
                tenant_id = %self.tenant_id,
                message_id,
                status,
                "session: delivery status"
            ),
        }
    }

    async fn on_inbound(&self, generation: u64, message: InboundMessage) {
        if !self.inner.lock().await.is_current(generation) {
            return;
        }
        if message.from_me {
            debug!(
                tenant_id = %self.tenant_id,
                event_id = %message.event_id,
                "session: ignoring echo of own message"
            );
            return;
        }

        let first_seen = self
            .ctx
            .storage
            .mark_inbound_processed(
                &self.tenant_id,
                &message.event_id,
                self.ctx.settings.inbound_dedupe_ttl_seconds,
                now_ms(),
            )
            .await;
        match first_seen {
            Ok(false) => {
                debug!(
                    tenant_id = %self.tenant_id,
                    event_id = %message.event_id,
                    "session: duplicate inbound event dropped"
                );
                return;
            }
            Ok(true) => {}
            Err(err) => warn!(
                tenant_id = %self.tenant_id,
                error = %err,
                "session: inbound de-duplication unavailable, forwarding anyway"
            ),
        }
        debug!(
            tenant_id = %self.tenant_id,
            event_id = %message.event_id,
            trace_id = %message.trace_id,
            "session: inbound message forwarded"
        );
        self.publish(SessionEvent::InboundMessage {
            tenant_id: self.tenant_id.clone(),
            message,
        });
    }

    /// Sends now when open with an empty backlog, otherwise queues behind
    /// it until the next flush or the queue deadline.
    pub async fn send_message(
        self: &Arc<Self>,
        target: &str,
        content: OutboundContent,
    ) -> Result<SendReceipt, SendError> {
        let target = normalize_target(target, &self.ctx.settings.address_domain);

        let immediate = {
            let inner = self.inner.lock().await;
            if let Some(err) = inner.rejection() {
                return Err(err);
            }
            if inner.state == ConnectionState::Open
                && inner.pending.is_empty()
                && inner.draining.is_none()
            {
                inner.socket.clone()
            } else {
                None
            }
        };

        if let Some(socket) = immediate {
            match socket.send(&target, &content).await {
                Ok(ack) => {
                    self.inner
                        .lock()
                        .await
                        .routes
                        .record(ack.message_id.clone(), target.clone());
                    debug!(
                        tenant_id = %self.tenant_id,
                        message_id = %ack.message_id,
                        kind = content.kind(),
                        "session: message sent"
                    );
                    return Ok(SendReceipt {
                        target,
                        message_id: Some(ack.message_id),
                        queued: false,
                    });
                }
                Err(err) => warn!(
                    tenant_id = %self.tenant_id,
                    error = %err,
                    "session: immediate send failed, queuing"
                ),
            }
        }

        let (receiver, kick) = {
            let mut inner = self.inner.lock().await;
            if let Some(err) = inner.rejection() {
                return Err(err);
            }
            let (responder, receiver) = oneshot::channel();
            let id = self.next_pending_id.fetch_add(1, Ordering::Relaxed);
            inner.pending.push_back(PendingMessage {
                id,
                target,
                content,
                enqueued_at: Instant::now(),
                responder,
                _deadline: self.spawn_deadline(id),
            });
            debug!(
                tenant_id = %self.tenant_id,
                state = inner.state.as_str(),
                pending = inner.pending.len(),
                "session: message queued"
            );

            let kick = match inner.state {
                ConnectionState::ClosedTransient if inner.reconnect_timer.is_none() => {
                    Kick::Reconnect
                }
                ConnectionState::Open
                    if inner.draining.is_none()
                        && inner
                            .stability_timer
                            .as_ref()
                            .map_or(true, ScheduledTask::is_finished) =>
                {
                    Kick::Drain(inner.generation)
                }
                _ => Kick::None,
            };
            (receiver, kick)
        };

        match kick {
            Kick::Reconnect => {
                tokio::spawn(Arc::clone(self).reconnect());
            }
            Kick::Drain(generation) => {
                let conn = Arc::clone(self);
                tokio::spawn(async move { conn.drain_backlog(generation).await });
            }
            Kick::None => {}
        }

        receiver.await.unwrap_or(Err(SendError::NotConnected))
    }

    fn spawn_deadline(self: &Arc<Self>, id: u64) -> ScheduledTask {
        let weak = Arc::downgrade(self);
        ScheduledTask::after(self.ctx.settings.queue_timeout, move || async move {
            if let Some(conn) = weak.upgrade() {
                conn.expire_pending(id).await;
            }
        })
    }

    async fn expire_pending(&self, id: u64) {
        let expired = {
            let mut inner = self.inner.lock().await;
            let position = inner.pending.iter().position(|item| item.id == id);
            position.and_then(|index| inner.pending.remove(index))
        };
        if let Some(item) = expired {
            warn!(
                tenant_id = %self.tenant_id,
                target = %item.target,
                waited_ms = millis_u64(item.enqueued_at.elapsed()),
                "session: queued message timed out"
            );
            item.resolve(Err(SendError::Timeout));
        }
    }

    /// Closes the socket, releases the lease and drops cached credentials.
    /// Calling it again is a no-op.
    pub async fn disconnect(&self) -> Result<()> {
        let (socket, backlog) = {
            let mut inner = self.inner.lock().await;
            if inner.shutting_down {
                return Ok(());
            }
            inner.shutting_down = true;
            inner.cancel_timers();
            inner.state = ConnectionState::ClosedTerminal;
            inner.auth = None;
            inner.pairing_code = None;
            (inner.socket.take(), mem::take(&mut inner.pending))
        };

        fail_backlog(backlog, SendError::NotConnected);
        if let Some(socket) = socket {
            socket.close().await;
        }
        self.ctx.lock.release(&self.tenant_id).await?;
        info!(tenant_id = %self.tenant_id, "session: disconnected");
        Ok(())
    }

    pub async fn status(&self) -> SessionStatus {
        let inner = self.inner.lock().await;
        SessionStatus {
            tenant_id: self.tenant_id.clone(),
            worker_id: self.ctx.lock.worker_id().clone(),
            connection_state: inner.state,
            is_connected: inner.state == ConnectionState::Open,
            qr_available: inner.pairing_code.is_some(),
            pending_messages: inner.pending.len(),
            reconnect_attempts: inner.reconnect_attempts,
            terminal_reason: inner.terminal_reason,
            last_open_at: inner.last_open_at,
        }
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.lock().await.state
    }

    pub async fn pairing_code(&self) -> Option<String> {
        self.inner.lock().await.pairing_code.clone()
    }

    /// Whether the connection gave up its slot (lease lost or reconnects
    /// exhausted) and should be dropped from the registry.
    pub async fn is_retired(&self) -> bool {
        self.inner.lock().await.retired
    }

    fn publish(&self, event: SessionEvent) {
        let _ = self.ctx.events.send(event);
    }
}

fn millis_u64(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

fn fail_backlog(backlog: VecDeque<PendingMessage>, err: SendError) {
    for item in backlog {
        item.resolve(Err(err.clone()));
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
