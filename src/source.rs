//! Backend capability consumed by a live session: one bulk read plus a change
//! feed of single-row upserts.

use std::future::Future;
use std::sync::Mutex;

use chrono::{Days, NaiveDate, Utc};
use chrono_tz::America::Argentina::Buenos_Aires;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use crate::instrument::RawInstrument;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFilter {
    pub table: String,
    /// Only instruments maturing strictly after this date are returned.
    pub maturing_after: NaiveDate,
}

impl BatchFilter {
    pub fn maturing_after_tomorrow(table: impl Into<String>, today: NaiveDate) -> Self {
        Self {
            table: table.into(),
            maturing_after: today.checked_add_days(Days::new(1)).unwrap_or(today),
        }
    }

    pub fn admits(&self, maturity: NaiveDate) -> bool {
        maturity > self.maturing_after
    }
}

/// The market's calendar date, which is what "tomorrow" is measured against.
pub fn market_today() -> NaiveDate {
    Utc::now().with_timezone(&Buenos_Aires).date_naive()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub table: String,
    pub kind: ChangeKind,
    pub record: RawInstrument,
}

#[derive(Debug, Error)]
pub enum DataSourceError {
    #[error("data source transport error: {0}")]
    Transport(String),
    #[error("data source query error: {0}")]
    Query(String),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("invalid table name: {0}")]
    InvalidTable(String),
    #[error("background task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SubscriptionError {
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("subscription rejected: {0}")]
    Rejected(String),
}

pub trait DataSource: Send + Sync + 'static {
    fn fetch_batch(
        &self,
        filter: &BatchFilter,
    ) -> impl Future<Output = Result<Vec<RawInstrument>, DataSourceError>> + Send;

    fn subscribe(
        &self,
        table: &str,
    ) -> impl Future<Output = Result<ChangeFeed, SubscriptionError>> + Send;
}

/// Receiving end of a table subscription.
#[derive(Debug)]
pub struct ChangeFeed {
    table: String,
    receiver: mpsc::UnboundedReceiver<ChangeEvent>,
}

impl ChangeFeed {
    pub fn table(&self) -> &str {
        &self.table
    }

    /// `None` once the source has dropped the subscription.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ChangeEvent> {
        self.receiver.try_recv().ok()
    }
}

/// Subscriber registry shared by the bundled sources.
#[derive(Debug, Default)]
pub struct FeedHub {
    subscribers: Mutex<Vec<(String, mpsc::UnboundedSender<ChangeEvent>)>>,
}

impl FeedHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, table: &str) -> ChangeFeed {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .expect("feed hub lock should not be poisoned")
            .push((table.to_string(), sender));

        ChangeFeed {
            table: table.to_string(),
            receiver,
        }
    }

    /// Fan `event` out to live subscribers of its table. Returns how many
    /// subscribers received it.
    pub fn publish(&self, event: ChangeEvent) -> usize {
        let mut subscribers = self
            .subscribers
            .lock()
            .expect("feed hub lock should not be poisoned");
        subscribers.retain(|(_, sender)| !sender.is_closed());

        let mut delivered = 0;
        for (table, sender) in subscribers.iter() {
            if *table == event.table && sender.send(event.clone()).is_ok() {
                delivered += 1;
            }
        }

        debug!(
            component = "feed",
            event = "feed.publish",
            table = %event.table,
            kind = ?event.kind,
            delivered
        );
        delivered
    }

    pub fn subscriber_count(&self, table: &str) -> usize {
        self.subscribers
            .lock()
            .expect("feed hub lock should not be poisoned")
            .iter()
            .filter(|(t, sender)| t == table && !sender.is_closed())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(table: &str) -> ChangeEvent {
        ChangeEvent {
            table: table.to_string(),
            kind: ChangeKind::Update,
            record: RawInstrument {
                ticker: Some("AL30".to_string()),
                ..RawInstrument::default()
            },
        }
    }

    #[test]
    fn tomorrow_cutoff_is_strict() {
        let today = NaiveDate::from_ymd_opt(2026, 10, 18).unwrap();
        let filter = BatchFilter::maturing_after_tomorrow("instruments", today);
        assert_eq!(
            filter.maturing_after,
            NaiveDate::from_ymd_opt(2026, 10, 19).unwrap()
        );
        assert!(!filter.admits(NaiveDate::from_ymd_opt(2026, 10, 19).unwrap()));
        assert!(filter.admits(NaiveDate::from_ymd_opt(2026, 10, 20).unwrap()));
    }

    #[test]
    fn hub_routes_by_table_and_prunes_closed_subscribers() {
        let hub = FeedHub::new();
        let mut bonds = hub.subscribe("bonds");
        let letters = hub.subscribe("letters");

        assert_eq!(hub.publish(event("bonds")), 1);
        assert_eq!(bonds.try_recv().unwrap().record.ticker.as_deref(), Some("AL30"));

        drop(letters);
        assert_eq!(hub.subscriber_count("letters"), 0);
        assert_eq!(hub.publish(event("letters")), 0);
    }
}
