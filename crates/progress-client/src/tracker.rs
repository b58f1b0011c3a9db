// crates/progress-client/src/tracker.rs
//! Per-job progress tracking on top of the shared [`JobChannel`].
//!
//! A [`JobTracker`] follows at most one job at a time:
//!
//! ```text
//! Idle --track(Some(id))--> Subscribing --joined--> Active --terminal--> Done
//!   ^                                                                     |
//!   +--------------------------- track(None) / track(other) --------------+
//! ```
//!
//! Each tracked job gets its own task, which joins the job's group and then
//! consumes its events. The task is the only writer of the job's session
//! besides `track()`, and every write checks that the view still belongs to
//! that job, so a superseded job can never touch the next one's state.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use todo_progress_core::hub_protocol::STATUS_EVENT;
use todo_progress_core::{Applied, JobId, JobOutcome, JobSession, JobStatus};

use crate::channel::{ChannelLease, EventSubscription, JobChannel};
use crate::config::TrackerConfig;
use crate::error::ChannelError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerPhase {
    Idle,
    Subscribing,
    Active,
    Done,
}

/// Everything the UI reads from a tracker. Published as one value so phase,
/// session and stall flag always change together.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackerView {
    pub phase: TrackerPhase,
    pub session: Option<JobSession>,
    /// No event arrived within `stall_warning_after` of joining.
    pub stalled: bool,
}

impl TrackerView {
    fn idle() -> Self {
        Self {
            phase: TrackerPhase::Idle,
            session: None,
            stalled: false,
        }
    }

    fn owned_by(&self, job_id: &JobId) -> bool {
        self.session.as_ref().is_some_and(|s| &s.job_id == job_id)
    }
}

/// Invoked once when a tracked job reaches Completed or Failed.
#[async_trait]
pub trait RefreshCallback: Send + Sync {
    async fn refresh(&self, outcome: &JobOutcome);
}

/// Refresh callback that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRefresh;

#[async_trait]
impl RefreshCallback for NoRefresh {
    async fn refresh(&self, _outcome: &JobOutcome) {}
}

struct LiveSession {
    job_id: JobId,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct JobTracker {
    channel: JobChannel,
    config: TrackerConfig,
    refresh: Arc<dyn RefreshCallback>,
    view: Arc<watch::Sender<TrackerView>>,
    live: tokio::sync::Mutex<Option<LiveSession>>,
    last_error: Mutex<Option<ChannelError>>,
}

impl JobTracker {
    pub fn new(channel: JobChannel, config: TrackerConfig, refresh: Arc<dyn RefreshCallback>) -> Self {
        let (view, _) = watch::channel(TrackerView::idle());
        Self {
            channel,
            config,
            refresh,
            view: Arc::new(view),
            live: tokio::sync::Mutex::new(None),
            last_error: Mutex::new(None),
        }
    }

    /// Start tracking `job_id`, or stop tracking with `None`.
    ///
    /// A previously tracked job is torn down first (group left, session
    /// discarded). Tracking the job that is already tracked is a no-op.
    ///
    /// Returns once the job's group is joined. The join runs without holding
    /// the tracker, so a later `track()` can supersede a job that is still
    /// subscribing; the superseded call then returns `Ok(())`.
    pub async fn track(&self, job_id: Option<JobId>) -> Result<(), ChannelError> {
        let (job_id, joined) = {
            let mut live = self.live.lock().await;

            if let (Some(current), Some(next)) = (live.as_ref(), job_id.as_ref()) {
                let owned = self.view.borrow().owned_by(next);
                if &current.job_id == next && owned {
                    debug!(job_id = %next, "job already tracked");
                    return Ok(());
                }
            }

            if let Some(previous) = live.take() {
                self.teardown(previous).await;
            }

            let Some(job_id) = job_id else {
                self.view.send_replace(TrackerView::idle());
                return Ok(());
            };

            info!(job_id = %job_id, "tracking job");
            let lease = self.channel.acquire();
            // Registered before the join so nothing sent right after it is missed.
            let events = self.channel.on_event(STATUS_EVENT);
            self.view.send_replace(TrackerView {
                phase: TrackerPhase::Subscribing,
                session: Some(JobSession::new(job_id.clone())),
                stalled: false,
            });

            let cancel = CancellationToken::new();
            let (joined_tx, joined_rx) = oneshot::channel();
            let task = SessionTask {
                job_id: job_id.clone(),
                channel: self.channel.clone(),
                events,
                lease,
                view: Arc::clone(&self.view),
                refresh: Arc::clone(&self.refresh),
                config: self.config.clone(),
                cancel: cancel.clone(),
            };
            *live = Some(LiveSession {
                job_id: job_id.clone(),
                cancel,
                task: tokio::spawn(task.run(joined_tx)),
            });
            (job_id, joined_rx)
        };

        match joined.await {
            Ok(Ok(())) => {
                self.set_error(None);
                Ok(())
            }
            Ok(Err(e)) => {
                self.set_error(Some(e.clone()));
                Err(e)
            }
            Err(_) => {
                debug!(job_id = %job_id, "tracking superseded before the join completed");
                Ok(())
            }
        }
    }

    async fn teardown(&self, previous: LiveSession) {
        debug!(job_id = %previous.job_id, "discarding tracked job");
        previous.cancel.cancel();
        // Later events for the old job find no owned session.
        self.view.send_replace(TrackerView::idle());
        if let Err(e) = previous.task.await {
            warn!(job_id = %previous.job_id, error = %e, "job session task ended abnormally");
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<TrackerView> {
        self.view.subscribe()
    }

    pub fn view(&self) -> TrackerView {
        self.view.borrow().clone()
    }

    pub fn session(&self) -> Option<JobSession> {
        self.view.borrow().session.clone()
    }

    pub fn phase(&self) -> TrackerPhase {
        self.view.borrow().phase
    }

    pub fn is_tracking(&self) -> bool {
        matches!(self.phase(), TrackerPhase::Subscribing | TrackerPhase::Active)
    }

    pub fn is_stalled(&self) -> bool {
        self.view.borrow().stalled
    }

    /// The tracker's last join failure, else the channel's last notice.
    pub fn last_channel_error(&self) -> Option<String> {
        let own = match self.last_error.lock() {
            Ok(guard) => guard.as_ref().map(ToString::to_string),
            Err(e) => {
                tracing::error!("Mutex poisoned reading tracker error: {e}");
                None
            }
        };
        own.or_else(|| self.channel.last_error())
    }

    pub fn channel(&self) -> &JobChannel {
        &self.channel
    }

    fn set_error(&self, error: Option<ChannelError>) {
        match self.last_error.lock() {
            Ok(mut guard) => *guard = error,
            Err(e) => tracing::error!("Mutex poisoned recording tracker error: {e}"),
        }
    }
}

impl Drop for JobTracker {
    fn drop(&mut self) {
        // The task leaves the group and releases its lease on its own.
        if let Some(live) = self.live.get_mut().take() {
            live.cancel.cancel();
        }
    }
}

/// Event loop of one tracked job.
struct SessionTask {
    job_id: JobId,
    channel: JobChannel,
    events: EventSubscription,
    lease: ChannelLease,
    view: Arc<watch::Sender<TrackerView>>,
    refresh: Arc<dyn RefreshCallback>,
    config: TrackerConfig,
    cancel: CancellationToken,
}

impl SessionTask {
    async fn run(mut self, joined: oneshot::Sender<Result<(), ChannelError>>) {
        let join = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            result = self.channel.join_group(self.job_id.as_str()) => Some(result),
        };

        match join {
            Some(Ok(())) => {
                self.activate();
                let _ = joined.send(Ok(()));
                if self.follow().await {
                    // Grace period: trailing duplicates still land on a live handler.
                    tokio::select! {
                        _ = sleep(self.config.dispose_grace) => {}
                        _ = self.cancel.cancelled() => {}
                    }
                }
            }
            Some(Err(e)) => {
                warn!(job_id = %self.job_id, error = %e, "could not join job group");
                self.reset();
                let _ = joined.send(Err(e));
            }
            None => debug!(job_id = %self.job_id, "tracking cancelled while subscribing"),
        }

        self.dispose().await;
    }

    async fn dispose(self) {
        if self.cancel.is_cancelled() {
            // Whoever cancelled is waiting on this task; the hub's answer is not needed.
            self.channel.request_leave(self.job_id.as_str());
        } else {
            self.channel.leave_group(self.job_id.as_str()).await;
        }
        drop(self.events);
        drop(self.lease);
        debug!(job_id = %self.job_id, "job subscription disposed");
    }

    fn activate(&self) {
        let job_id = &self.job_id;
        self.view.send_if_modified(|view| {
            if view.owned_by(job_id) && view.phase == TrackerPhase::Subscribing {
                view.phase = TrackerPhase::Active;
                true
            } else {
                false
            }
        });
        debug!(job_id = %job_id, "joined job group");
    }

    fn reset(&self) {
        let job_id = &self.job_id;
        self.view.send_if_modified(|view| {
            if view.owned_by(job_id) {
                *view = TrackerView::idle();
                true
            } else {
                false
            }
        });
    }

    /// Consume status events until the job settles (`true`) or tracking is
    /// cancelled (`false`).
    async fn follow(&mut self) -> bool {
        let stall_at = self.config.stall_warning_after.map(|after| Instant::now() + after);
        let mut heard = false;

        loop {
            let stall_deadline = if heard { None } else { stall_at };
            let stall = async move {
                match stall_deadline {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return false,
                arguments = self.events.recv() => {
                    let Some(arguments) = arguments else {
                        warn!(job_id = %self.job_id, "status event stream closed");
                        return false;
                    };
                    match self.on_status(arguments) {
                        StatusEffect::Ignored => {}
                        StatusEffect::Progressed => heard = true,
                        StatusEffect::Settled(outcome) => {
                            self.notify(outcome);
                            return true;
                        }
                    }
                }
                _ = stall => {
                    heard = true;
                    warn!(
                        job_id = %self.job_id,
                        "no progress events since joining the job group, the job may have finished before the subscription"
                    );
                    let job_id = &self.job_id;
                    self.view.send_if_modified(|view| {
                        if view.owned_by(job_id) && !view.stalled {
                            view.stalled = true;
                            true
                        } else {
                            false
                        }
                    });
                }
            }
        }
    }

    fn on_status(&self, mut arguments: Vec<Value>) -> StatusEffect {
        if arguments.is_empty() {
            warn!(job_id = %self.job_id, "status event without payload");
            return StatusEffect::Ignored;
        }
        let status: JobStatus = match serde_json::from_value(arguments.swap_remove(0)) {
            Ok(status) => status,
            Err(e) => {
                warn!(job_id = %self.job_id, error = %e, "malformed job status payload");
                return StatusEffect::Ignored;
            }
        };
        if status.job_id != self.job_id {
            return StatusEffect::Ignored;
        }

        let job_id = &self.job_id;
        let mut effect = StatusEffect::Ignored;
        self.view.send_if_modified(|view| {
            if !view.owned_by(job_id) {
                return false;
            }
            let Some(session) = view.session.as_mut() else {
                return false;
            };
            match session.apply(&status) {
                Applied::Progress => {
                    info!(
                        job_id = %job_id,
                        state = session.state.label(),
                        processed = session.processed_count,
                        total = session.total_count,
                        "job progress"
                    );
                    effect = StatusEffect::Progressed;
                }
                Applied::Settled(state) => {
                    info!(job_id = %job_id, state = state.label(), "job settled");
                    effect = match session.outcome() {
                        Some(outcome) => StatusEffect::Settled(outcome),
                        None => StatusEffect::Progressed,
                    };
                    view.phase = TrackerPhase::Done;
                }
                Applied::Rejected(reason) => {
                    debug!(job_id = %job_id, ?reason, "ignoring job status");
                    return false;
                }
            }
            view.stalled = false;
            true
        });
        effect
    }

    fn notify(&self, outcome: JobOutcome) {
        let refresh = Arc::clone(&self.refresh);
        tokio::spawn(async move {
            refresh.refresh(&outcome).await;
        });
    }
}

enum StatusEffect {
    Ignored,
    Progressed,
    Settled(JobOutcome),
}
