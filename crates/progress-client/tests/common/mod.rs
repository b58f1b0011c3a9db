//! In-process job hub for integration tests.
//!
//! Speaks enough of the hub protocol for the client: handshake, group
//! join/leave with completions, and `JobStatusUpdate` pushes. Tests can
//! reject handshakes or joins, drop every connection, and wait on the hub's
//! bookkeeping.
#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use todo_progress_client::{
    ChannelConfig, ConnectionState, JobChannel, JobTracker, RefreshCallback, TrackerConfig,
    TrackerView,
};
use todo_progress_core::hub_protocol::{
    self, HubMessage, JOIN_GROUP_METHOD, LEAVE_GROUP_METHOD, STATUS_EVENT,
};
use todo_progress_core::{JobId, JobOutcome, JobState, JobStatus};

pub const WAIT: Duration = Duration::from_secs(5);

enum Outbound {
    Frame(String),
    Drop,
}

#[derive(Default)]
struct Inner {
    next_connection: u64,
    connections: HashMap<u64, mpsc::UnboundedSender<Outbound>>,
    groups: HashMap<String, BTreeSet<u64>>,
    joins: Vec<String>,
    leaves: Vec<String>,
    handshakes: usize,
    reject_handshake: Option<String>,
    reject_joins: Option<String>,
    ignore_joins: bool,
    silent_handshake: bool,
}

#[derive(Clone)]
struct Shared {
    inner: Arc<Mutex<Inner>>,
    changed: Arc<watch::Sender<u64>>,
}

impl Shared {
    fn update<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        let result = f(&mut self.inner.lock().unwrap());
        self.changed.send_modify(|n| *n += 1);
        result
    }

    fn read<R>(&self, f: impl FnOnce(&Inner) -> R) -> R {
        f(&self.inner.lock().unwrap())
    }
}

pub struct FakeHub {
    addr: SocketAddr,
    shared: Shared,
    server: JoinHandle<()>,
}

impl FakeHub {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (changed, _) = watch::channel(0);
        let shared = Shared {
            inner: Arc::default(),
            changed: Arc::new(changed),
        };
        let app = Router::new()
            .route("/hubs/todo-progress", get(upgrade))
            .with_state(shared.clone());
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self {
            addr,
            shared,
            server,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}/hubs/todo-progress", self.addr)
    }

    pub fn reject_handshakes(&self, error: &str) {
        let error = error.to_string();
        self.shared.update(|i| i.reject_handshake = Some(error));
    }

    pub fn reject_joins(&self, error: &str) {
        let error = error.to_string();
        self.shared.update(|i| i.reject_joins = Some(error));
    }

    /// Record joins but never send their completion.
    pub fn ignore_joins(&self) {
        self.shared.update(|i| i.ignore_joins = true);
    }

    /// Read the handshake request and never answer it.
    pub fn silent_handshakes(&self, silent: bool) {
        self.shared.update(|i| i.silent_handshake = silent);
    }

    /// Push a status to the members of `group`. Returns how many
    /// connections it was sent to.
    pub fn push_status(&self, group: &str, status: &JobStatus) -> usize {
        let frame = status_frame(status);
        self.shared.read(|i| {
            let Some(members) = i.groups.get(group) else {
                return 0;
            };
            members
                .iter()
                .filter_map(|id| i.connections.get(id))
                .filter(|tx| tx.send(Outbound::Frame(frame.clone())).is_ok())
                .count()
        })
    }

    /// Push a status to every connection, ignoring group membership.
    pub fn broadcast_status(&self, status: &JobStatus) -> usize {
        self.broadcast_raw(status_frame(status))
    }

    pub fn broadcast_raw(&self, frame: String) -> usize {
        self.shared.read(|i| {
            i.connections
                .values()
                .filter(|tx| tx.send(Outbound::Frame(frame.clone())).is_ok())
                .count()
        })
    }

    /// Send a hub `Close` record to every connection.
    pub fn close_all(&self, error: &str, allow_reconnect: bool) {
        self.broadcast_raw(hub_protocol::encode(&HubMessage::Close {
            error: Some(error.to_string()),
            allow_reconnect,
        }));
    }

    /// Drop every socket without a close handshake.
    pub fn drop_connections(&self) {
        self.shared.read(|i| {
            for tx in i.connections.values() {
                let _ = tx.send(Outbound::Drop);
            }
        });
    }

    pub fn connection_count(&self) -> usize {
        self.shared.read(|i| i.connections.len())
    }

    pub fn handshakes(&self) -> usize {
        self.shared.read(|i| i.handshakes)
    }

    pub fn members(&self, group: &str) -> usize {
        self.shared.read(|i| i.groups.get(group).map_or(0, BTreeSet::len))
    }

    pub fn joins(&self) -> Vec<String> {
        self.shared.read(|i| i.joins.clone())
    }

    pub fn leaves(&self) -> Vec<String> {
        self.shared.read(|i| i.leaves.clone())
    }

    pub async fn wait_for_connections(&self, n: usize) {
        self.wait_until(&format!("{n} connection(s)"), |i| i.connections.len() == n)
            .await;
    }

    pub async fn wait_for_handshakes(&self, n: usize) {
        self.wait_until(&format!("{n} handshake(s)"), |i| i.handshakes >= n)
            .await;
    }

    /// Wait until `group` has been joined `n` times in total.
    pub async fn wait_for_joins(&self, group: &str, n: usize) {
        self.wait_until(&format!("{n} join(s) of {group}"), |i| {
            i.joins.iter().filter(|g| g.as_str() == group).count() >= n
        })
        .await;
    }

    pub async fn wait_for_members(&self, group: &str, n: usize) {
        self.wait_until(&format!("{n} member(s) in {group}"), |i| {
            i.groups.get(group).map_or(0, BTreeSet::len) == n
        })
        .await;
    }

    pub async fn wait_for_leave(&self, group: &str) {
        self.wait_until(&format!("leave of {group}"), |i| {
            i.leaves.iter().any(|g| g == group)
        })
        .await;
    }

    async fn wait_until(&self, what: &str, cond: impl Fn(&Inner) -> bool) {
        let mut changed = self.shared.changed.subscribe();
        let wait = async {
            loop {
                if self.shared.read(&cond) {
                    return;
                }
                if changed.changed().await.is_err() {
                    return;
                }
            }
        };
        tokio::time::timeout(WAIT, wait)
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
    }
}

impl Drop for FakeHub {
    fn drop(&mut self) {
        self.drop_connections();
        self.server.abort();
    }
}

async fn upgrade(ws: WebSocketUpgrade, State(shared): State<Shared>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_client(socket, shared))
}

async fn serve_client(socket: WebSocket, shared: Shared) {
    let (mut sink, mut stream) = socket.split();

    let Some(Ok(Message::Text(first))) = stream.next().await else {
        return;
    };
    if hub_protocol::parse_handshake_request(first.as_str()).is_err() {
        return;
    }
    if shared.read(|i| i.silent_handshake) {
        while let Some(Ok(_)) = stream.next().await {}
        return;
    }
    if let Some(error) = shared.read(|i| i.reject_handshake.clone()) {
        let reply = format!("{}\u{1e}", json!({ "error": error }));
        let _ = sink.send(Message::Text(reply.into())).await;
        return;
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let id = shared.update(|i| {
        i.handshakes += 1;
        let id = i.next_connection;
        i.next_connection += 1;
        i.connections.insert(id, tx);
        id
    });

    if sink.send(Message::Text("{}\u{1e}".into())).await.is_ok() {
        loop {
            tokio::select! {
                outbound = rx.recv() => match outbound {
                    Some(Outbound::Frame(frame)) => {
                        if sink.send(Message::Text(frame.into())).await.is_err() {
                            break;
                        }
                    }
                    Some(Outbound::Drop) | None => break,
                },
                inbound = stream.next() => match inbound {
                    Some(Ok(Message::Text(text))) => {
                        for reply in handle_records(&shared, id, text.as_str()) {
                            if sink.send(Message::Text(reply.into())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                },
            }
        }
    }

    shared.update(|i| {
        i.connections.remove(&id);
        for members in i.groups.values_mut() {
            members.remove(&id);
        }
    });
}

/// Apply client invocations, returning the completion records to send.
fn handle_records(shared: &Shared, connection: u64, frame: &str) -> Vec<String> {
    let mut replies = Vec::new();
    for record in hub_protocol::decode_records(frame) {
        let Ok(HubMessage::Invocation {
            invocation_id,
            target,
            arguments,
        }) = record
        else {
            continue;
        };
        let group = arguments
            .first()
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        if target == JOIN_GROUP_METHOD && shared.read(|i| i.ignore_joins) {
            shared.update(|i| i.joins.push(group.clone()));
            continue;
        }

        let error = if target == JOIN_GROUP_METHOD {
            shared.update(|i| {
                i.joins.push(group.clone());
                match &i.reject_joins {
                    Some(error) => Some(error.clone()),
                    None => {
                        i.groups.entry(group.clone()).or_default().insert(connection);
                        None
                    }
                }
            })
        } else if target == LEAVE_GROUP_METHOD {
            shared.update(|i| {
                i.leaves.push(group.clone());
                if let Some(members) = i.groups.get_mut(&group) {
                    members.remove(&connection);
                }
                None
            })
        } else {
            Some(format!("Unknown hub method {target}"))
        };

        if let Some(invocation_id) = invocation_id {
            replies.push(hub_protocol::encode(&HubMessage::Completion {
                invocation_id,
                result: None,
                error,
            }));
        }
    }
    replies
}

fn status_frame(status: &JobStatus) -> String {
    hub_protocol::encode(&HubMessage::Invocation {
        invocation_id: None,
        target: STATUS_EVENT.to_string(),
        arguments: vec![serde_json::to_value(status).unwrap()],
    })
}

pub fn status(job_id: &str, state: JobState, processed: u64, total: u64) -> JobStatus {
    JobStatus {
        job_id: JobId::from(job_id),
        state,
        processed_count: processed,
        total_count: total,
        error_message: None,
        created_at: Utc::now(),
        completed_at: None,
    }
}

pub fn failed(job_id: &str, message: Option<&str>) -> JobStatus {
    JobStatus {
        error_message: message.map(str::to_string),
        completed_at: Some(Utc::now()),
        ..status(job_id, JobState::Failed, 0, 0)
    }
}

/// Short timings so reconnects and disposal happen quickly.
pub fn fast_channel_config() -> ChannelConfig {
    ChannelConfig {
        handshake_timeout: Duration::from_secs(2),
        initial_reconnect_delay: Duration::from_millis(50),
        max_reconnect_delay: Duration::from_millis(200),
        ..ChannelConfig::default()
    }
}

pub fn fast_tracker_config() -> TrackerConfig {
    TrackerConfig {
        dispose_grace: Duration::from_millis(150),
        stall_warning_after: None,
    }
}

pub async fn wait_for_state(channel: &JobChannel, state: ConnectionState) {
    let mut states = channel.subscribe_state();
    tokio::time::timeout(WAIT, states.wait_for(|s| *s == state))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for channel state {state}"))
        .unwrap();
}

pub async fn wait_for_view(tracker: &JobTracker, what: &str, pred: impl Fn(&TrackerView) -> bool) -> TrackerView {
    let mut views = tracker.subscribe();
    let view = tokio::time::timeout(WAIT, views.wait_for(|v| pred(v)))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
        .unwrap()
        .clone();
    view
}

/// Refresh callback that forwards every outcome to a channel.
pub struct RecordingRefresh(mpsc::UnboundedSender<JobOutcome>);

impl RecordingRefresh {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<JobOutcome>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self(tx)), rx)
    }
}

#[async_trait]
impl RefreshCallback for RecordingRefresh {
    async fn refresh(&self, outcome: &JobOutcome) {
        let _ = self.0.send(outcome.clone());
    }
}
