// crates/progress-client/src/channel/actor.rs
//! Background task that owns the hub WebSocket.
//!
//! All connection state (socket, group memberships, in-flight invocations,
//! lease count, reconnect schedule) lives here and is only touched from this
//! task. `JobChannel` handles talk to it through [`Command`]s.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval_at, sleep_until, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use todo_progress_core::hub_protocol::{self, HubMessage, JOIN_GROUP_METHOD, LEAVE_GROUP_METHOD};

use super::handlers::HandlerRegistry;
use super::{Command, ConnectionState, Reply};
use crate::config::ChannelConfig;
use crate::error::ChannelError;

type HubSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// An invocation waiting for its completion record.
enum PendingCall {
    Join(String),
    Leave(String, oneshot::Sender<()>),
}

struct Pending {
    call: PendingCall,
    deadline: Instant,
}

/// Why the connected loop returned.
enum LinkExit {
    /// Transport dropped; reconnect.
    Lost(String),
    /// Hub sent `Close` without allowing a reconnect.
    ClosedByServer(Option<String>),
    /// Last lease released with no memberships left.
    Idle,
    Shutdown,
}

enum Flow {
    Continue,
    Lost(String),
    Idle,
    Stop,
}

enum Wake {
    Retry,
    Command(Option<Command>),
}

struct Backoff {
    attempt: u32,
    delay: Duration,
    next_at: Instant,
}

async fn sleep_until_some(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Delay before the next reconnect attempt: doubles each time, capped.
fn next_delay(previous: Option<Duration>, config: &ChannelConfig) -> Duration {
    match previous {
        None => config.initial_reconnect_delay,
        Some(delay) => (delay * 2).min(config.max_reconnect_delay),
    }
}

pub(crate) struct ChannelActor {
    hub_url: String,
    config: ChannelConfig,
    commands: mpsc::UnboundedReceiver<Command>,
    state: watch::Sender<ConnectionState>,
    errors: Arc<watch::Sender<Option<String>>>,
    handlers: Arc<HandlerRegistry>,
    socket: Option<HubSocket>,
    groups: BTreeSet<String>,
    join_waiters: HashMap<String, Vec<Reply>>,
    pending: HashMap<String, Pending>,
    next_invocation: u64,
    leases: usize,
    backoff: Option<Backoff>,
}

impl ChannelActor {
    pub(crate) fn new(
        hub_url: String,
        config: ChannelConfig,
        commands: mpsc::UnboundedReceiver<Command>,
        state: watch::Sender<ConnectionState>,
        errors: Arc<watch::Sender<Option<String>>>,
        handlers: Arc<HandlerRegistry>,
    ) -> Self {
        Self {
            hub_url,
            config,
            commands,
            state,
            errors,
            handlers,
            socket: None,
            groups: BTreeSet::new(),
            join_waiters: HashMap::new(),
            pending: HashMap::new(),
            next_invocation: 0,
            leases: 0,
            backoff: None,
        }
    }

    pub(crate) async fn run(mut self) {
        debug!(hub_url = %self.hub_url, "job channel started");

        loop {
            if self.socket.is_some() {
                match self.drive().await {
                    LinkExit::Lost(reason) => self.on_link_lost(reason),
                    LinkExit::ClosedByServer(error) => self.on_server_close(error),
                    LinkExit::Idle => self.close_idle().await,
                    LinkExit::Shutdown => break,
                }
                continue;
            }

            let wake = match self.backoff.as_ref().map(|b| b.next_at) {
                Some(at) => tokio::select! {
                    _ = sleep_until(at) => Wake::Retry,
                    cmd = self.commands.recv() => Wake::Command(cmd),
                },
                None => Wake::Command(self.commands.recv().await),
            };

            match wake {
                Wake::Retry => self.reconnect().await,
                Wake::Command(None) => break,
                Wake::Command(Some(cmd)) => match self.handle_command(cmd).await {
                    Flow::Continue => {}
                    Flow::Lost(reason) => self.on_link_lost(reason),
                    Flow::Idle => self.close_idle().await,
                    Flow::Stop => break,
                },
            }
        }

        self.stop().await;
    }

    /// Connected loop: commands, inbound records, keep-alive and the
    /// server-silence deadline.
    async fn drive(&mut self) -> LinkExit {
        let period = self.config.keep_alive_interval;
        let mut keep_alive = interval_at(Instant::now() + period, period);
        keep_alive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_inbound = Instant::now();

        loop {
            let Some(socket) = self.socket.as_mut() else {
                return LinkExit::Lost("socket missing".into());
            };
            let deadline = last_inbound + self.config.server_timeout;
            let expiry = self.pending.values().map(|p| p.deadline).min();

            tokio::select! {
                cmd = self.commands.recv() => {
                    let Some(cmd) = cmd else {
                        return LinkExit::Shutdown;
                    };
                    match self.handle_command(cmd).await {
                        Flow::Continue => {}
                        Flow::Lost(reason) => return LinkExit::Lost(reason),
                        Flow::Idle => return LinkExit::Idle,
                        Flow::Stop => return LinkExit::Shutdown,
                    }
                }
                frame = socket.next() => {
                    last_inbound = Instant::now();
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(exit) = self.handle_records(text.as_str()) {
                                return exit;
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            return LinkExit::Lost(format!("socket closed by hub: {frame:?}"));
                        }
                        Some(Ok(Message::Binary(_))) => {
                            warn!("ignoring binary frame from job hub");
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return LinkExit::Lost(e.to_string()),
                        None => return LinkExit::Lost("socket stream ended".into()),
                    }
                }
                _ = keep_alive.tick() => {
                    if let Err(reason) = self.send(&HubMessage::Ping).await {
                        return LinkExit::Lost(reason);
                    }
                }
                _ = sleep_until(deadline) => {
                    return LinkExit::Lost(format!(
                        "no message from hub for {}ms",
                        self.config.server_timeout.as_millis()
                    ));
                }
                _ = sleep_until_some(expiry) => self.expire_pending(),
            }
        }
    }

    async fn handle_command(&mut self, cmd: Command) -> Flow {
        match cmd {
            Command::Connect { reply } => {
                if self.socket.is_some() {
                    let _ = reply.send(Ok(()));
                    return Flow::Continue;
                }
                let result = self.establish().await;
                let _ = reply.send(result);
                Flow::Continue
            }
            Command::Join { group, reply } => self.join(group, reply).await,
            Command::Leave { group, reply } => self.leave(group, reply).await,
            Command::Acquire => {
                self.leases += 1;
                Flow::Continue
            }
            Command::Release => {
                self.leases = self.leases.saturating_sub(1);
                if self.leases == 0 && self.groups.is_empty() {
                    Flow::Idle
                } else {
                    Flow::Continue
                }
            }
            Command::Shutdown => Flow::Stop,
        }
    }

    async fn join(&mut self, group: String, reply: Reply) -> Flow {
        if self.socket.is_none() {
            if let Err(e) = self.establish().await {
                let err = match e {
                    ChannelError::Connection(reason) => ChannelError::NotConnected(reason),
                    other => other,
                };
                let _ = reply.send(Err(err));
                return Flow::Continue;
            }
        }

        let in_flight = self.join_in_flight(&group);
        if self.groups.contains(&group) && !in_flight {
            let _ = reply.send(Ok(()));
            return Flow::Continue;
        }

        self.groups.insert(group.clone());
        self.join_waiters.entry(group.clone()).or_default().push(reply);
        if in_flight {
            return Flow::Continue;
        }

        debug!(%group, "joining job group");
        match self.invoke(JOIN_GROUP_METHOD, &group, PendingCall::Join(group.clone())).await {
            Ok(()) => Flow::Continue,
            Err(reason) => Flow::Lost(reason),
        }
    }

    async fn leave(&mut self, group: String, reply: oneshot::Sender<()>) -> Flow {
        let was_member = self.groups.remove(&group);
        if let Some(waiters) = self.join_waiters.remove(&group) {
            for waiter in waiters {
                let _ = waiter.send(Err(ChannelError::Invocation {
                    method: JOIN_GROUP_METHOD.to_string(),
                    message: "group left before the join completed".to_string(),
                }));
            }
        }

        if !was_member || self.socket.is_none() {
            let _ = reply.send(());
            return Flow::Continue;
        }

        debug!(%group, "leaving job group");
        match self
            .invoke(LEAVE_GROUP_METHOD, &group, PendingCall::Leave(group.clone(), reply))
            .await
        {
            Ok(()) => Flow::Continue,
            Err(reason) => Flow::Lost(reason),
        }
    }

    /// Open the socket, run the handshake and re-join remembered groups.
    async fn establish(&mut self) -> Result<(), ChannelError> {
        if self.backoff.is_none() {
            self.set_state(ConnectionState::Connecting);
        }

        let result = match self.open().await {
            Ok((socket, rest)) => {
                self.socket = Some(socket);
                if self.handle_records(&rest).is_some() {
                    Err(ChannelError::Connection(
                        "hub closed the connection right after the handshake".into(),
                    ))
                } else {
                    self.rejoin().await.map_err(ChannelError::Connection)
                }
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                self.backoff = None;
                self.set_state(ConnectionState::Connected);
                info!(hub_url = %self.hub_url, groups = self.groups.len(), "connected to job hub");
                Ok(())
            }
            Err(e) => {
                self.socket = None;
                self.drop_pending();
                self.record_error(e.to_string());
                if self.backoff.is_none() {
                    self.set_state(ConnectionState::Disconnected);
                }
                Err(e)
            }
        }
    }

    async fn open(&self) -> Result<(HubSocket, String), ChannelError> {
        let url = self.hub_url.clone();
        let limit = self.config.handshake_timeout;

        let handshake = async move {
            let (mut socket, _) = connect_async(url)
                .await
                .map_err(|e| ChannelError::Connection(e.to_string()))?;
            socket
                .send(Message::Text(hub_protocol::handshake_request().into()))
                .await
                .map_err(|e| ChannelError::Connection(e.to_string()))?;

            loop {
                match socket.next().await {
                    Some(Ok(Message::Text(text))) => {
                        let rest = hub_protocol::parse_handshake_response(text.as_str())
                            .map_err(|e| ChannelError::Connection(e.to_string()))?;
                        return Ok((socket, rest.to_string()));
                    }
                    Some(Ok(Message::Close(frame))) => {
                        return Err(ChannelError::Connection(format!(
                            "hub closed the socket during handshake: {frame:?}"
                        )));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(ChannelError::Connection(e.to_string())),
                    None => {
                        return Err(ChannelError::Connection(
                            "hub closed the socket during handshake".into(),
                        ))
                    }
                }
            }
        };

        match timeout(limit, handshake).await {
            Ok(result) => result,
            Err(_) => Err(ChannelError::Connection(format!(
                "handshake timed out after {}ms",
                limit.as_millis()
            ))),
        }
    }

    async fn rejoin(&mut self) -> Result<(), String> {
        let groups: Vec<String> = self.groups.iter().cloned().collect();
        for group in groups {
            if self.join_in_flight(&group) {
                continue;
            }
            info!(%group, "re-joining job group");
            self.invoke(JOIN_GROUP_METHOD, &group, PendingCall::Join(group.clone()))
                .await?;
        }
        Ok(())
    }

    async fn reconnect(&mut self) {
        let attempt = self.backoff.as_ref().map_or(1, |b| b.attempt + 1);
        info!(attempt, hub_url = %self.hub_url, "reconnecting to job hub");

        if self.establish().await.is_ok() {
            return;
        }

        if self
            .config
            .max_reconnect_attempts
            .is_some_and(|max| attempt >= max)
        {
            warn!(attempt, "giving up reconnecting to job hub");
            self.backoff = None;
            self.set_state(ConnectionState::Disconnected);
            self.fail_join_waiters(ChannelError::NotConnected(
                "reconnect attempts exhausted".into(),
            ));
            return;
        }

        let delay = next_delay(self.backoff.as_ref().map(|b| b.delay), &self.config);
        warn!(attempt, backoff_ms = delay.as_millis() as u64, "job hub reconnect failed");
        self.backoff = Some(Backoff {
            attempt,
            delay,
            next_at: Instant::now() + delay,
        });
    }

    fn handle_records(&mut self, frame: &str) -> Option<LinkExit> {
        for record in hub_protocol::decode_records(frame) {
            match record {
                Ok(HubMessage::Invocation { target, arguments, .. }) => {
                    if self.handlers.dispatch(&target, &arguments) == 0 {
                        debug!(%target, "no handler registered for hub event");
                    }
                }
                Ok(HubMessage::Completion {
                    invocation_id,
                    error,
                    ..
                }) => self.complete(&invocation_id, error),
                Ok(HubMessage::Ping) => {}
                Ok(HubMessage::Close {
                    error,
                    allow_reconnect,
                }) => {
                    return Some(if allow_reconnect {
                        LinkExit::Lost(error.unwrap_or_else(|| "hub asked for a reconnect".into()))
                    } else {
                        LinkExit::ClosedByServer(error)
                    });
                }
                Ok(HubMessage::Other(kind)) => debug!(kind, "ignoring hub message"),
                Err(e) => warn!(error = %e, "dropping malformed hub record"),
            }
        }
        None
    }

    fn complete(&mut self, invocation_id: &str, error: Option<String>) {
        match self.pending.remove(invocation_id).map(|p| p.call) {
            Some(PendingCall::Join(group)) => match error {
                None => {
                    debug!(%group, "joined job group");
                    for waiter in self.join_waiters.remove(&group).unwrap_or_default() {
                        let _ = waiter.send(Ok(()));
                    }
                }
                Some(message) => {
                    warn!(%group, %message, "hub rejected group join");
                    self.fail_join(&group, message);
                }
            },
            Some(PendingCall::Leave(group, reply)) => {
                match error {
                    None => debug!(%group, "left job group"),
                    Some(message) => warn!(%group, %message, "hub rejected group leave"),
                }
                let _ = reply.send(());
            }
            None => debug!(%invocation_id, "completion for unknown invocation"),
        }
    }

    /// Give up on invocations the hub never completed.
    fn expire_pending(&mut self) {
        let now = Instant::now();
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        let limit = self.config.invocation_timeout.as_millis();

        for id in expired {
            let Some(pending) = self.pending.remove(&id) else {
                continue;
            };
            match pending.call {
                PendingCall::Join(group) => {
                    warn!(%group, invocation_id = %id, "group join got no completion");
                    self.fail_join(&group, format!("no completion within {limit}ms"));
                }
                PendingCall::Leave(group, reply) => {
                    warn!(%group, invocation_id = %id, "group leave got no completion");
                    let _ = reply.send(());
                }
            }
        }
    }

    fn fail_join(&mut self, group: &str, message: String) {
        self.groups.remove(group);
        self.record_error(format!("Could not join job group {group}: {message}"));
        for waiter in self.join_waiters.remove(group).unwrap_or_default() {
            let _ = waiter.send(Err(ChannelError::Invocation {
                method: JOIN_GROUP_METHOD.to_string(),
                message: message.clone(),
            }));
        }
    }

    async fn invoke(&mut self, method: &str, group: &str, call: PendingCall) -> Result<(), String> {
        let id = self.next_invocation.to_string();
        self.next_invocation += 1;
        let message = HubMessage::invocation(id.clone(), method, vec![json!(group)]);
        let deadline = Instant::now() + self.config.invocation_timeout;
        self.pending.insert(id, Pending { call, deadline });
        self.send(&message).await
    }

    async fn send(&mut self, message: &HubMessage) -> Result<(), String> {
        let Some(socket) = self.socket.as_mut() else {
            return Err("not connected".into());
        };
        socket
            .send(Message::Text(hub_protocol::encode(message).into()))
            .await
            .map_err(|e| e.to_string())
    }

    fn join_in_flight(&self, group: &str) -> bool {
        self.pending
            .values()
            .any(|p| matches!(&p.call, PendingCall::Join(g) if g == group))
    }

    fn on_link_lost(&mut self, reason: String) {
        self.socket = None;
        self.drop_pending();
        warn!(%reason, groups = self.groups.len(), "job hub connection lost");
        self.record_error(format!("Connection lost: {reason}"));

        if self.leases == 0 && self.groups.is_empty() {
            self.backoff = None;
            self.set_state(ConnectionState::Disconnected);
            return;
        }

        let delay = next_delay(None, &self.config);
        self.backoff = Some(Backoff {
            attempt: 0,
            delay,
            next_at: Instant::now() + delay,
        });
        self.set_state(ConnectionState::Reconnecting);
    }

    fn on_server_close(&mut self, error: Option<String>) {
        self.socket = None;
        self.drop_pending();
        self.backoff = None;
        let reason = error.unwrap_or_else(|| "no reason given".into());
        warn!(%reason, "job hub closed the connection");
        self.record_error(format!("Hub closed the connection: {reason}"));
        self.set_state(ConnectionState::Disconnected);
        self.fail_join_waiters(ChannelError::NotConnected(reason));
    }

    async fn close_idle(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            if let Err(e) = socket.close(None).await {
                debug!(error = %e, "closing idle hub socket");
            }
            info!("job channel idle, connection closed");
        }
        self.drop_pending();
        self.backoff = None;
        self.set_state(ConnectionState::Disconnected);
    }

    async fn stop(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            let _ = socket.close(None).await;
        }
        self.drop_pending();
        self.fail_join_waiters(ChannelError::Closed);
        self.set_state(ConnectionState::Disconnected);
        debug!("job channel stopped");
    }

    /// Forget in-flight invocations. Leaves count as done; join waiters stay
    /// queued until the group is re-joined or given up.
    fn drop_pending(&mut self) {
        for (_, pending) in self.pending.drain() {
            if let PendingCall::Leave(_, reply) = pending.call {
                let _ = reply.send(());
            }
        }
    }

    fn fail_join_waiters(&mut self, error: ChannelError) {
        for (_, waiters) in self.join_waiters.drain() {
            for waiter in waiters {
                let _ = waiter.send(Err(error.clone()));
            }
        }
    }

    fn record_error(&self, message: String) {
        self.errors.send_replace(Some(message));
    }

    fn set_state(&self, next: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            debug!(from = ?*current, to = ?next, "job channel state");
            *current = next;
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = ChannelConfig {
            initial_reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(5),
            ..ChannelConfig::default()
        };
        let first = next_delay(None, &config);
        let second = next_delay(Some(first), &config);
        let third = next_delay(Some(second), &config);
        let fourth = next_delay(Some(third), &config);
        assert_eq!(first, Duration::from_secs(1));
        assert_eq!(second, Duration::from_secs(2));
        assert_eq!(third, Duration::from_secs(4));
        assert_eq!(fourth, Duration::from_secs(5));
    }
}
