//! Session lifecycle: one change-feed subscription plus one reconciled
//! collection, acquired together when the dashboard becomes visible and
//! released together when it is hidden.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::reconciler::{ReplaceReport, SnapshotReconciler};
use crate::source::{market_today, BatchFilter, ChangeFeed, DataSource, DataSourceError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Visible,
    Hidden,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum SessionStatus {
    Inactive,
    Live { since: DateTime<Utc> },
    FetchFailed { message: String },
    SubscriptionFailed { message: String },
    FeedClosed,
}

impl SessionStatus {
    pub fn status_line(&self) -> String {
        match self {
            Self::Inactive => "Paused while the dashboard is hidden".to_string(),
            Self::Live { since } => format!("Live since {}", since.format("%H:%M:%S UTC")),
            Self::FetchFailed { message } => format!("Error loading data: {message}"),
            Self::SubscriptionFailed { message } => {
                format!("Live updates unavailable: {message}")
            }
            Self::FeedClosed => "Live updates stopped; showing last known data".to_string(),
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, Self::Live { .. })
    }
}

/// Shared, readable session status for render layers.
#[derive(Clone)]
pub struct StatusBoard {
    inner: Arc<RwLock<SessionStatus>>,
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self {
            inner: Arc::new(RwLock::new(SessionStatus::Inactive)),
        }
    }
}

impl StatusBoard {
    pub fn get(&self) -> SessionStatus {
        self.inner
            .read()
            .expect("status lock should not be poisoned")
            .clone()
    }

    pub fn set(&self, status: SessionStatus) {
        *self
            .inner
            .write()
            .expect("status lock should not be poisoned") = status;
    }
}

/// A live change-feed pump. Dropping the handle releases the subscription.
pub struct SubscriptionHandle {
    table: String,
    task: JoinHandle<()>,
}

impl SubscriptionHandle {
    fn spawn(feed: ChangeFeed, reconciler: SnapshotReconciler, status: StatusBoard) -> Self {
        let table = feed.table().to_string();
        let task = tokio::spawn(pump_feed(feed, reconciler, status));
        Self { table, task }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Abort the pump and wait until it has stopped applying events.
    pub async fn release(mut self) {
        self.task.abort();
        let _ = (&mut self.task).await;
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn pump_feed(mut feed: ChangeFeed, reconciler: SnapshotReconciler, status: StatusBoard) {
    while let Some(event) = feed.recv().await {
        // Rejections are logged by the reconciler; keep consuming.
        let _ = reconciler.apply_event(event);
    }

    warn!(
        component = "session",
        event = "session.feed.closed",
        table = %feed.table()
    );
    status.set(SessionStatus::FeedClosed);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub table: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            table: "instruments".to_string(),
        }
    }
}

pub struct LiveSession<S: DataSource> {
    source: Arc<S>,
    config: SessionConfig,
    reconciler: SnapshotReconciler,
    status: StatusBoard,
    subscription: Option<SubscriptionHandle>,
    active: bool,
}

impl<S: DataSource> LiveSession<S> {
    pub fn new(source: Arc<S>, config: SessionConfig) -> Self {
        Self {
            source,
            config,
            reconciler: SnapshotReconciler::new(),
            status: StatusBoard::default(),
            subscription: None,
            active: false,
        }
    }

    pub fn reconciler(&self) -> SnapshotReconciler {
        self.reconciler.clone()
    }

    pub fn status(&self) -> StatusBoard {
        self.status.clone()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn has_subscription(&self) -> bool {
        self.subscription.is_some()
    }

    /// Subscribe, bulk load, then start applying feed events.
    ///
    /// The subscription is opened before the bulk read so events racing the
    /// fetch queue up and land after `replace_all`.
    pub async fn activate(&mut self) -> SessionStatus {
        self.activate_on(market_today()).await
    }

    pub async fn activate_on(&mut self, today: NaiveDate) -> SessionStatus {
        if let Some(previous) = self.subscription.take() {
            previous.release().await;
        }
        self.active = true;

        let feed = match self.source.subscribe(&self.config.table).await {
            Ok(feed) => Some(feed),
            Err(err) => {
                warn!(
                    component = "session",
                    event = "session.subscribe.error",
                    table = %self.config.table,
                    error = %err
                );
                self.status.set(SessionStatus::SubscriptionFailed {
                    message: err.to_string(),
                });
                None
            }
        };

        let fetched = self.refresh_on(today).await;

        if let Some(feed) = feed {
            self.subscription = Some(SubscriptionHandle::spawn(
                feed,
                self.reconciler.clone(),
                self.status.clone(),
            ));
            if fetched.is_ok() {
                self.status.set(SessionStatus::Live { since: Utc::now() });
            }
        }

        info!(
            component = "session",
            event = "session.activate",
            table = %self.config.table,
            instruments = self.reconciler.len(),
            subscribed = self.subscription.is_some(),
            status = %self.status.get().status_line()
        );
        self.status.get()
    }

    /// Bulk reload only. A failed fetch leaves the collection as it was.
    pub async fn refresh(&mut self) -> Result<ReplaceReport, DataSourceError> {
        self.refresh_on(market_today()).await
    }

    pub async fn refresh_on(&mut self, today: NaiveDate) -> Result<ReplaceReport, DataSourceError> {
        let filter = BatchFilter::maturing_after_tomorrow(self.config.table.clone(), today);
        match self.source.fetch_batch(&filter).await {
            Ok(rows) => {
                let report = self.reconciler.replace_all_raw(rows);
                let recovered = matches!(self.status.get(), SessionStatus::FetchFailed { .. })
                    && self.subscription.is_some();
                if recovered {
                    self.status.set(SessionStatus::Live { since: Utc::now() });
                }
                Ok(report)
            }
            Err(err) => {
                warn!(
                    component = "session",
                    event = "session.fetch.error",
                    table = %self.config.table,
                    error = %err
                );
                self.status.set(SessionStatus::FetchFailed {
                    message: err.to_string(),
                });
                Err(err)
            }
        }
    }

    pub async fn deactivate(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.release().await;
        }
        self.reconciler.clear();
        self.status.set(SessionStatus::Inactive);
        self.active = false;

        info!(
            component = "session",
            event = "session.deactivate",
            table = %self.config.table
        );
    }

    pub async fn on_visibility(&mut self, visibility: Visibility) {
        match (visibility, self.active) {
            (Visibility::Hidden, true) => self.deactivate().await,
            (Visibility::Visible, false) => {
                self.activate().await;
            }
            _ => {}
        }
    }
}

/// Activate `session`, then follow visibility commands until the sender side
/// is dropped.
pub async fn run_lifecycle<S: DataSource>(
    mut session: LiveSession<S>,
    mut commands: mpsc::Receiver<Visibility>,
) {
    session.activate().await;
    while let Some(visibility) = commands.recv().await {
        session.on_visibility(visibility).await;
    }
    session.deactivate().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_lines_are_human_readable() {
        assert_eq!(
            SessionStatus::FetchFailed {
                message: "timeout".to_string()
            }
            .status_line(),
            "Error loading data: timeout"
        );
        assert!(SessionStatus::Inactive.status_line().contains("hidden"));
        assert!(!SessionStatus::FeedClosed.is_live());
    }

    #[test]
    fn status_serializes_with_phase_tag() {
        let json = serde_json::to_value(SessionStatus::SubscriptionFailed {
            message: "denied".to_string(),
        })
        .unwrap();
        assert_eq!(json["phase"], "subscription_failed");
        assert_eq!(json["message"], "denied");
    }
}
