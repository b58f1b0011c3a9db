// crates/progress-client/src/reconciler.rs
//! Keeps the list/item view in step with finished bulk jobs.
//!
//! Job completion and data refresh are decoupled: the tracker only reports
//! that a job settled, the [`Reconciler`] decides what to re-fetch.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

use todo_progress_core::{JobOutcome, ListId, TodoItem, TodoList};

use crate::api::TodoApi;
use crate::tracker::RefreshCallback;

/// What the UI renders.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ViewSnapshot {
    pub lists: Vec<TodoList>,
    pub selected_list: Option<ListId>,
    /// Items of `selected_list`.
    pub items: Vec<TodoItem>,
    pub refreshed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// A bulk job on `list_id` finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettledList {
    pub success: bool,
    pub list_id: ListId,
}

#[derive(Clone)]
pub struct Reconciler {
    api: TodoApi,
    view: Arc<watch::Sender<ViewSnapshot>>,
    /// Refreshes run one at a time, in the order they were requested.
    in_flight: Arc<Mutex<()>>,
}

impl Reconciler {
    pub fn new(api: TodoApi) -> Self {
        let (view, _) = watch::channel(ViewSnapshot::default());
        Self {
            api,
            view: Arc::new(view),
            in_flight: Arc::new(Mutex::new(())),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ViewSnapshot> {
        self.view.subscribe()
    }

    pub fn snapshot(&self) -> ViewSnapshot {
        self.view.borrow().clone()
    }

    /// Change the selected list (or clear it) and load its items.
    pub async fn select_list(&self, list_id: Option<ListId>) {
        self.view.send_modify(|view| {
            if view.selected_list != list_id {
                view.selected_list = list_id;
                view.items.clear();
            }
        });
        self.refresh(list_id).await;
    }

    /// Re-fetch lists and the selected list's items.
    pub async fn reload(&self) {
        let selected = self.view.borrow().selected_list;
        self.refresh(selected).await;
    }

    /// Refresh after a bulk job settled. List counters are always reloaded;
    /// items only when the job's list is still the selected one.
    pub async fn on_job_settled(&self, settled: SettledList) {
        info!(
            list_id = settled.list_id,
            success = settled.success,
            "refreshing lists after bulk job"
        );
        let selected = self.view.borrow().selected_list;
        self.refresh(selected.filter(|id| *id == settled.list_id)).await;
    }

    async fn refresh(&self, items_for: Option<ListId>) {
        let _turn = self.in_flight.lock().await;
        let lists = self.api.lists().await;
        let items = match items_for {
            Some(list_id) => Some((list_id, self.api.items(list_id).await)),
            None => None,
        };

        self.view.send_modify(|view| {
            let mut errors = Vec::new();
            match lists {
                Ok(lists) => view.lists = lists,
                Err(e) => {
                    warn!(error = %e, "failed to reload todo lists");
                    errors.push(e.to_string());
                }
            }
            if let Some((list_id, result)) = items {
                // Selection may have moved while the request was in flight.
                if view.selected_list == Some(list_id) {
                    match result {
                        Ok(items) => view.items = items,
                        Err(e) => {
                            warn!(list_id, error = %e, "failed to reload todo items");
                            errors.push(e.to_string());
                        }
                    }
                }
            }
            view.refreshed_at = Some(Utc::now());
            view.last_error = (!errors.is_empty()).then(|| errors.join("; "));
        });
    }
}

/// Refresh callback that reconciles one list when its job settles.
#[derive(Clone)]
pub struct ListRefresh {
    list_id: ListId,
    reconciler: Reconciler,
}

impl ListRefresh {
    pub fn new(list_id: ListId, reconciler: Reconciler) -> Self {
        Self {
            list_id,
            reconciler,
        }
    }
}

#[async_trait]
impl RefreshCallback for ListRefresh {
    async fn refresh(&self, outcome: &JobOutcome) {
        self.reconciler
            .on_job_settled(SettledList {
                success: outcome.success,
                list_id: self.list_id,
            })
            .await;
    }
}
