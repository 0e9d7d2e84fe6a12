//! In-process data source: the test fake and the demo backend.

use std::future::{ready, Future};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use tokio::task::JoinHandle;
use tracing::info;

use crate::instrument::{InstrumentSnapshot, RawInstrument};
use crate::source::{
    BatchFilter, ChangeEvent, ChangeFeed, ChangeKind, DataSource, DataSourceError, FeedHub,
    SubscriptionError,
};

pub struct InMemoryDataSource {
    table: String,
    rows: RwLock<Vec<RawInstrument>>,
    hub: FeedHub,
    fetch_failure: Mutex<Option<String>>,
    subscribe_failure: Mutex<Option<String>>,
}

impl InMemoryDataSource {
    pub fn new(table: impl Into<String>, rows: Vec<RawInstrument>) -> Self {
        Self {
            table: table.into(),
            rows: RwLock::new(rows),
            hub: FeedHub::new(),
            fetch_failure: Mutex::new(None),
            subscribe_failure: Mutex::new(None),
        }
    }

    pub fn from_snapshots(table: impl Into<String>, rows: &[InstrumentSnapshot]) -> Self {
        Self::new(table, rows.iter().map(InstrumentSnapshot::to_raw).collect())
    }

    pub fn demo(table: impl Into<String>, today: NaiveDate) -> Self {
        Self::from_snapshots(table, &demo_records(today))
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Upsert into the stored rows and push the change to subscribers.
    pub fn publish(&self, kind: ChangeKind, record: RawInstrument) -> usize {
        {
            let mut rows = self
                .rows
                .write()
                .expect("in-memory rows lock should not be poisoned");
            let existing = record
                .ticker_hint()
                .and_then(|ticker| rows.iter().position(|row| row.ticker_hint() == Some(ticker)));
            match existing {
                Some(pos) => rows[pos] = record.clone(),
                None => rows.push(record.clone()),
            }
        }

        self.hub.publish(ChangeEvent {
            table: self.table.clone(),
            kind,
            record,
        })
    }

    /// Replace stored rows without notifying subscribers, as a backfill would.
    pub fn replace_rows(&self, rows: Vec<RawInstrument>) {
        *self
            .rows
            .write()
            .expect("in-memory rows lock should not be poisoned") = rows;
    }

    pub fn fail_next_fetch(&self, message: impl Into<String>) {
        *self
            .fetch_failure
            .lock()
            .expect("failure lock should not be poisoned") = Some(message.into());
    }

    pub fn fail_subscriptions(&self, message: Option<String>) {
        *self
            .subscribe_failure
            .lock()
            .expect("failure lock should not be poisoned") = message;
    }

    pub fn subscriber_count(&self) -> usize {
        self.hub.subscriber_count(&self.table)
    }

    fn fetch_now(&self, filter: &BatchFilter) -> Result<Vec<RawInstrument>, DataSourceError> {
        if let Some(message) = self
            .fetch_failure
            .lock()
            .expect("failure lock should not be poisoned")
            .take()
        {
            return Err(DataSourceError::Transport(message));
        }
        if filter.table != self.table {
            return Err(DataSourceError::Query(format!(
                "relation \"{}\" does not exist",
                filter.table
            )));
        }

        let rows = self
            .rows
            .read()
            .expect("in-memory rows lock should not be poisoned");
        Ok(rows
            .iter()
            .filter(|row| row.maturity().is_some_and(|date| filter.admits(date)))
            .cloned()
            .collect())
    }

    fn subscribe_now(&self, table: &str) -> Result<ChangeFeed, SubscriptionError> {
        if let Some(message) = self
            .subscribe_failure
            .lock()
            .expect("failure lock should not be poisoned")
            .clone()
        {
            return Err(SubscriptionError::Rejected(message));
        }
        if table != self.table {
            return Err(SubscriptionError::UnknownTable(table.to_string()));
        }
        Ok(self.hub.subscribe(table))
    }
}

impl DataSource for InMemoryDataSource {
    fn fetch_batch(
        &self,
        filter: &BatchFilter,
    ) -> impl Future<Output = Result<Vec<RawInstrument>, DataSourceError>> + Send {
        ready(self.fetch_now(filter))
    }

    fn subscribe(
        &self,
        table: &str,
    ) -> impl Future<Output = Result<ChangeFeed, SubscriptionError>> + Send {
        ready(self.subscribe_now(table))
    }
}

/// A representative board of peso letters, CER bonds and hard-dollar sovereigns.
pub fn demo_records(today: NaiveDate) -> Vec<InstrumentSnapshot> {
    // (ticker, segment, maturity, price, tir, modified duration)
    let rows: [(&str, &str, (i32, u32, u32), f64, f64, Option<f64>); 16] = [
        ("S16E7", "LECAP", (2027, 1, 16), 107.10, 0.312, None),
        ("S26F7", "LECAP", (2027, 2, 26), 104.85, 0.318, None),
        ("S30A7", "LECAP", (2027, 4, 30), 101.20, 0.325, None),
        ("T30J7", "BONCAP", (2027, 6, 30), 112.40, 0.331, None),
        ("T15E8", "BONCAP", (2028, 1, 15), 97.55, 0.339, None),
        ("TY30P", "BONTE", (2030, 5, 30), 88.10, 0.352, None),
        ("TTJ27", "DUAL TAMAR", (2027, 6, 30), 114.90, 0.336, None),
        ("TZX27", "CER", (2027, 6, 30), 263.50, 0.071, None),
        ("TZXD7", "CER", (2027, 12, 15), 198.20, 0.082, None),
        ("TX28", "CER", (2028, 11, 9), 1_420.0, 0.094, None),
        ("D30J7", "DOLLAR LINKED", (2027, 6, 30), 102.30, 0.021, None),
        ("AL30", "BONAR", (2030, 7, 9), 64.80, 0.118, Some(1.65)),
        ("AL35", "BONAR", (2035, 7, 9), 59.10, 0.121, Some(5.40)),
        ("GD30", "GLOBAL", (2030, 7, 9), 66.20, 0.101, Some(1.68)),
        ("GD38", "GLOBAL", (2038, 1, 9), 68.40, 0.112, Some(6.10)),
        ("GD46", "GLOBAL", (2046, 7, 9), 62.90, 0.115, Some(7.90)),
    ];

    rows.iter()
        .filter_map(|&(ticker, segment, (y, m, d), price, tir, duration)| {
            let maturity = NaiveDate::from_ymd_opt(y, m, d)?;
            let days = (maturity - today).num_days();
            let mut record = InstrumentSnapshot::new(ticker, segment, maturity);
            record.price = Some(price);
            record.yield_to_maturity = Some(tir);
            record.days_to_maturity = Some(days as f64);
            record.modified_duration = duration;
            record.tna = Some(tir_to_tna(tir));
            record.tem = Some((1.0 + tir).powf(1.0 / 12.0) - 1.0);
            Some(record)
        })
        .collect()
}

fn tir_to_tna(tir: f64) -> f64 {
    ((1.0 + tir).powf(30.0 / 365.0) - 1.0) * 365.0 / 30.0
}

/// Drive a deterministic stream of yield updates through `source`.
pub fn spawn_demo_feed(source: Arc<InMemoryDataSource>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticks = tokio::time::interval(interval);
        let mut step: u64 = 0;
        info!(
            component = "demo_feed",
            event = "demo_feed.start",
            interval_ms = interval.as_millis() as u64
        );

        loop {
            ticks.tick().await;
            let rows = source
                .rows
                .read()
                .expect("in-memory rows lock should not be poisoned")
                .clone();
            if rows.is_empty() {
                continue;
            }

            let mut record = rows[(step as usize) % rows.len()].clone();
            let drift = 0.002 * ((step as f64) * 0.7).sin();
            record.yield_to_maturity = record.yield_to_maturity.map(|tir| (tir + drift).max(0.0));
            record.price = record.price.map(|price| price * (1.0 - drift / 4.0));
            record.used_previous_close = Some(false);
            record.last_updated = Some(Utc::now().to_rfc3339());

            source.publish(ChangeKind::Update, record);
            step = step.wrapping_add(1);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 18).unwrap()
    }

    #[tokio::test]
    async fn fetch_filters_out_instruments_maturing_by_tomorrow() {
        let mut expiring = InstrumentSnapshot::new(
            "S19O6",
            "LECAP",
            NaiveDate::from_ymd_opt(2026, 10, 19).unwrap(),
        );
        expiring.yield_to_maturity = Some(0.3);
        let mut later = expiring.clone();
        later.ticker = "S20O6".to_string();
        later.maturity_date = NaiveDate::from_ymd_opt(2026, 10, 20).unwrap();

        let source = InMemoryDataSource::from_snapshots("instruments", &[expiring, later]);
        let rows = source
            .fetch_batch(&BatchFilter::maturing_after_tomorrow("instruments", today()))
            .await
            .unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].ticker.as_deref(), Some("S20O6"));
    }

    #[tokio::test]
    async fn injected_failures_surface_once_for_fetch_and_persist_for_subscribe() {
        let source = InMemoryDataSource::demo("instruments", today());
        let filter = BatchFilter::maturing_after_tomorrow("instruments", today());

        source.fail_next_fetch("connection reset");
        assert!(matches!(
            source.fetch_batch(&filter).await,
            Err(DataSourceError::Transport(_))
        ));
        assert!(source.fetch_batch(&filter).await.is_ok());

        source.fail_subscriptions(Some("realtime disabled".to_string()));
        assert!(matches!(
            source.subscribe("instruments").await,
            Err(SubscriptionError::Rejected(_))
        ));
        source.fail_subscriptions(None);
        assert!(matches!(
            source.subscribe("letters").await,
            Err(SubscriptionError::UnknownTable(_))
        ));
    }

    #[tokio::test]
    async fn publish_updates_rows_and_reaches_subscribers() {
        let source = InMemoryDataSource::demo("instruments", today());
        let mut feed = source.subscribe("instruments").await.unwrap();

        let mut record = demo_records(today())[0].to_raw();
        record.yield_to_maturity = Some(0.5);
        assert_eq!(source.publish(ChangeKind::Update, record), 1);

        let event = feed.recv().await.unwrap();
        assert_eq!(event.kind, ChangeKind::Update);
        assert_eq!(event.record.yield_to_maturity, Some(0.5));

        let rows = source
            .fetch_batch(&BatchFilter::maturing_after_tomorrow("instruments", today()))
            .await
            .unwrap();
        assert_eq!(rows.len(), demo_records(today()).len());
        assert!(rows.iter().any(|row| row.yield_to_maturity == Some(0.5)));
    }

    #[test]
    fn demo_records_are_unique_and_fit_ready() {
        let records = demo_records(today());
        let mut tickers: Vec<&str> = records.iter().map(|r| r.ticker.as_str()).collect();
        tickers.sort_unstable();
        tickers.dedup();
        assert_eq!(tickers.len(), records.len());
        assert!(records.iter().all(|r| r.days_to_maturity.unwrap() > 0.0));
    }
}
