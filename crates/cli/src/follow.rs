// crates/cli/src/follow.rs
//! Follow one job to its end with a progress bar.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use todo_progress_client::{
    ClientConfig, JobChannel, JobTracker, ListRefresh, NoRefresh, Reconciler, RefreshCallback,
    TodoApi, TrackerPhase,
};
use todo_progress_core::{JobId, JobOutcome, JobState, ListId};

use crate::render;

/// How long to wait for the post-job list reload before giving up on it.
const REFRESH_WAIT: Duration = Duration::from_secs(10);
const BAR_LENGTH: u64 = 100;

/// Runs the real refresh, then reports that it finished.
struct AnnounceRefresh {
    inner: Arc<dyn RefreshCallback>,
    done: mpsc::UnboundedSender<JobOutcome>,
}

#[async_trait]
impl RefreshCallback for AnnounceRefresh {
    async fn refresh(&self, outcome: &JobOutcome) {
        self.inner.refresh(outcome).await;
        let _ = self.done.send(outcome.clone());
    }
}

pub async fn follow(config: &ClientConfig, job_id: JobId, list: Option<ListId>) -> Result<ExitCode> {
    let channel = JobChannel::start(config.hub_url.clone(), config.channel.clone());
    let reconciler = Reconciler::new(TodoApi::new(config.api_base_url.clone()));

    let inner: Arc<dyn RefreshCallback> = match list {
        Some(list_id) => Arc::new(ListRefresh::new(list_id, reconciler.clone())),
        None => Arc::new(NoRefresh),
    };
    let (done, mut refreshed) = mpsc::unbounded_channel();
    let tracker = JobTracker::new(
        channel.clone(),
        config.tracker.clone(),
        Arc::new(AnnounceRefresh { inner, done }),
    );

    let bar = ProgressBar::new(BAR_LENGTH);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("  {spinner} [{bar:30}] {percent:>3}% {msg}")?
            .progress_chars("=> "),
    );
    bar.enable_steady_tick(Duration::from_millis(100));
    bar.set_message("subscribing");

    // Subscribe first: the job may settle while the list is loading.
    let subscribing = tracker.track(Some(job_id.clone()));
    tokio::pin!(subscribing);
    let subscribed = tokio::select! {
        result = &mut subscribing => result,
        _ = tokio::signal::ctrl_c() => {
            bar.abandon_with_message("cancelled");
            tracker.track(None).await?;
            channel.shutdown();
            return Ok(ExitCode::from(130));
        }
    };
    if let Err(e) = subscribed {
        bar.finish_and_clear();
        return Err(e).with_context(|| format!("subscribing to job {job_id}"));
    }
    if let Some(list_id) = list {
        reconciler.select_list(Some(list_id)).await;
    }

    let mut views = tracker.subscribe();
    let mut states = channel.subscribe_state();
    let mut errors = channel.subscribe_errors();

    let session = loop {
        let view = views.borrow_and_update().clone();
        if let Some(session) = &view.session {
            bar.set_position(render::bar_position(session, BAR_LENGTH));
        }
        bar.set_message(render::progress_message(&view, channel.state()));

        match view.phase {
            TrackerPhase::Done => break view.session,
            TrackerPhase::Idle => {
                bar.finish_and_clear();
                bail!("tracking of job {job_id} stopped");
            }
            TrackerPhase::Subscribing | TrackerPhase::Active => {}
        }

        tokio::select! {
            Ok(()) = views.changed() => {}
            Ok(()) = states.changed() => {
                debug!(state = %*states.borrow_and_update(), "hub connection");
            }
            Ok(()) = errors.changed() => {
                if let Some(notice) = errors.borrow_and_update().clone() {
                    bar.println(format!("  ! {notice}"));
                }
            }
            _ = tokio::signal::ctrl_c() => {
                bar.abandon_with_message("cancelled");
                tracker.track(None).await?;
                channel.shutdown();
                return Ok(ExitCode::from(130));
            }
        }
    };

    bar.finish_and_clear();
    let session = session.context("job settled without a session")?;
    eprintln!("{}", render::outcome_line(&session));

    if let Some(list_id) = list {
        match tokio::time::timeout(REFRESH_WAIT, refreshed.recv()).await {
            Ok(Some(_)) => {
                let snapshot = reconciler.snapshot();
                if let Some(error) = &snapshot.last_error {
                    eprintln!("  ! Could not reload list {list_id}: {error}");
                } else {
                    print!("{}", render::items(&snapshot.items));
                }
            }
            _ => warn!(list_id, "list reload did not finish"),
        }
    }

    channel.shutdown();
    Ok(match session.state {
        JobState::Completed => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    })
}
