// crates/progress-client/src/channel/mod.rs
//! Shared push channel to the job-status hub.
//!
//! [`JobChannel`] is a cheap, cloneable handle. The WebSocket itself is owned
//! by a single background task (see `actor`), so every state change is
//! serialized there. The connection opens lazily on the first `connect()` or
//! `join_group()` and closes when the last [`ChannelLease`] is dropped with no
//! group memberships left.

mod actor;
mod handlers;

use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;

use crate::config::ChannelConfig;
use crate::error::ChannelError;
use actor::ChannelActor;
use handlers::HandlerRegistry;

pub use handlers::EventSubscription;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        };
        f.write_str(label)
    }
}

pub(crate) type Reply = oneshot::Sender<Result<(), ChannelError>>;

pub(crate) enum Command {
    Connect { reply: Reply },
    Join { group: String, reply: Reply },
    Leave { group: String, reply: oneshot::Sender<()> },
    Acquire,
    Release,
    Shutdown,
}

struct Shared {
    hub_url: String,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    errors: Arc<watch::Sender<Option<String>>>,
    handlers: Arc<HandlerRegistry>,
}

/// Handle to the shared hub connection.
#[derive(Clone)]
pub struct JobChannel {
    shared: Arc<Shared>,
}

impl fmt::Debug for JobChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobChannel")
            .field("hub_url", &self.shared.hub_url)
            .field("state", &self.state())
            .finish()
    }
}

impl JobChannel {
    /// Spawn the channel task. Must be called inside a tokio runtime.
    /// Nothing is dialed until the first `connect()` / `join_group()`.
    pub fn start(hub_url: impl Into<String>, config: ChannelConfig) -> Self {
        let hub_url = hub_url.into();
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (errors, _) = watch::channel(None);
        let errors = Arc::new(errors);
        let handlers = Arc::new(HandlerRegistry::default());

        let actor = ChannelActor::new(
            hub_url.clone(),
            config,
            command_rx,
            state_tx,
            Arc::clone(&errors),
            Arc::clone(&handlers),
        );
        tokio::spawn(actor.run());

        Self {
            shared: Arc::new(Shared {
                hub_url,
                commands,
                state: state_rx,
                errors,
                handlers,
            }),
        }
    }

    /// Open the connection if it is not open yet.
    pub async fn connect(&self) -> Result<(), ChannelError> {
        self.request(|reply| Command::Connect { reply }).await
    }

    /// Join a notification group, connecting first when needed.
    pub async fn join_group(&self, group: &str) -> Result<(), ChannelError> {
        let group = group.to_string();
        self.request(|reply| Command::Join { group, reply }).await
    }

    /// Leave a group. Best effort: failures are logged by the channel task
    /// and never returned.
    pub async fn leave_group(&self, group: &str) {
        if let Some(done) = self.send_leave(group) {
            let _ = done.await;
        }
    }

    /// Queue a leave without waiting for the hub to confirm it. Commands
    /// sent afterwards, such as a new join of the same group, are handled
    /// after it.
    pub(crate) fn request_leave(&self, group: &str) {
        let _ = self.send_leave(group);
    }

    fn send_leave(&self, group: &str) -> Option<oneshot::Receiver<()>> {
        let (reply, done) = oneshot::channel();
        let cmd = Command::Leave {
            group: group.to_string(),
            reply,
        };
        if self.shared.commands.send(cmd).is_err() {
            debug!(%group, "leave on a closed channel");
            return None;
        }
        Some(done)
    }

    /// Subscribe to a named push event. Registrations survive reconnects.
    pub fn on_event(&self, event: &str) -> EventSubscription {
        self.shared.handlers.register(event)
    }

    /// Claim the shared connection. The claim is released when the lease
    /// is dropped.
    pub fn acquire(&self) -> ChannelLease {
        let _ = self.shared.commands.send(Command::Acquire);
        ChannelLease {
            commands: self.shared.commands.clone(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.clone()
    }

    /// Last channel-level error, kept until cleared.
    pub fn last_error(&self) -> Option<String> {
        self.shared.errors.borrow().clone()
    }

    pub fn subscribe_errors(&self) -> watch::Receiver<Option<String>> {
        self.shared.errors.subscribe()
    }

    pub fn clear_error(&self) {
        self.shared.errors.send_replace(None);
    }

    /// Stop the channel task and close the socket. Pending and later
    /// requests fail with [`ChannelError::Closed`].
    pub fn shutdown(&self) {
        let _ = self.shared.commands.send(Command::Shutdown);
    }

    async fn request(&self, make: impl FnOnce(Reply) -> Command) -> Result<(), ChannelError> {
        let (reply, response) = oneshot::channel();
        self.shared
            .commands
            .send(make(reply))
            .map_err(|_| ChannelError::Closed)?;
        response.await.unwrap_or(Err(ChannelError::Closed))
    }
}

/// Reference-counted claim on the shared connection.
#[derive(Debug)]
pub struct ChannelLease {
    commands: mpsc::UnboundedSender<Command>,
}

impl Drop for ChannelLease {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Release);
    }
}
