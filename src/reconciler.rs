//! Ticker-keyed instrument collection fed by a bulk load and a change feed.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::instrument::{InstrumentSnapshot, MalformedRecordError, RawInstrument};
use crate::segments::SegmentFilter;
use crate::source::ChangeEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Inserted,
    Replaced,
    /// Same ticker, identical values.
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReplaceReport {
    pub accepted: usize,
    pub rejected: usize,
    pub installed: usize,
}

#[derive(Debug, Default)]
struct TickerTable {
    rows: Vec<InstrumentSnapshot>,
    index: HashMap<String, usize>,
}

impl TickerTable {
    /// Records with a blank ticker are returned as rejections.
    fn from_records(records: Vec<InstrumentSnapshot>) -> (Self, Vec<MalformedRecordError>) {
        let mut table = Self::default();
        let mut rejected = Vec::new();
        for record in records {
            match normalize_ticker(record) {
                Ok(record) => {
                    table.upsert(record);
                }
                Err(err) => rejected.push(err),
            }
        }
        (table, rejected)
    }

    /// `record.ticker` must already be trimmed and non-empty.
    fn upsert(&mut self, record: InstrumentSnapshot) -> UpdateOutcome {
        match self.index.get(&record.ticker) {
            Some(&pos) if self.rows[pos] == record => UpdateOutcome::Unchanged,
            Some(&pos) => {
                self.rows[pos] = record;
                UpdateOutcome::Replaced
            }
            None => {
                self.index.insert(record.ticker.clone(), self.rows.len());
                self.rows.push(record);
                UpdateOutcome::Inserted
            }
        }
    }
}

/// Shared handle to the authoritative collection for one session.
///
/// Every mutation is applied under the write lock with a fully built record,
/// so readers never observe a half-applied update.
#[derive(Clone)]
pub struct SnapshotReconciler {
    inner: Arc<RwLock<TickerTable>>,
    changes: Arc<watch::Sender<u64>>,
}

impl Default for SnapshotReconciler {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotReconciler {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            inner: Arc::new(RwLock::new(TickerTable::default())),
            changes: Arc::new(changes),
        }
    }

    /// Discard current state and install `records`; duplicate tickers keep the
    /// last occurrence. Records without a ticker are logged and skipped.
    pub fn replace_all(&self, records: Vec<InstrumentSnapshot>) -> usize {
        let (table, rejected) = TickerTable::from_records(records);
        for err in &rejected {
            log_rejected("bulk", err);
        }
        let installed = table.rows.len();
        {
            let mut guard = self
                .inner
                .write()
                .expect("reconciler lock should not be poisoned");
            *guard = table;
        }
        self.bump();
        installed
    }

    /// Validate a bulk payload and install the rows that pass.
    pub fn replace_all_raw(&self, raws: Vec<RawInstrument>) -> ReplaceReport {
        let mut report = ReplaceReport::default();
        let mut records = Vec::with_capacity(raws.len());

        for raw in raws {
            match raw.validate() {
                Ok(record) => {
                    report.accepted += 1;
                    records.push(record);
                }
                Err(err) => {
                    report.rejected += 1;
                    log_rejected("bulk", &err);
                }
            }
        }

        report.installed = self.replace_all(records);
        info!(
            component = "reconciler",
            event = "reconciler.replace_all",
            accepted = report.accepted,
            rejected = report.rejected,
            installed = report.installed
        );
        report
    }

    /// Upsert one record by trimmed ticker. A blank ticker is rejected and
    /// leaves the collection untouched.
    pub fn apply_update(
        &self,
        record: InstrumentSnapshot,
    ) -> Result<UpdateOutcome, MalformedRecordError> {
        let record = normalize_ticker(record).inspect_err(|err| log_rejected("update", err))?;
        let outcome = {
            let mut guard = self
                .inner
                .write()
                .expect("reconciler lock should not be poisoned");
            guard.upsert(record)
        };

        if outcome != UpdateOutcome::Unchanged {
            self.bump();
        }
        Ok(outcome)
    }

    pub fn apply_raw(&self, raw: RawInstrument) -> Result<UpdateOutcome, MalformedRecordError> {
        match raw.validate() {
            Ok(record) => {
                let ticker = record.ticker.clone();
                let outcome = self.apply_update(record)?;
                debug!(
                    component = "reconciler",
                    event = "reconciler.record.applied",
                    ticker = %ticker,
                    outcome = ?outcome
                );
                Ok(outcome)
            }
            Err(err) => {
                log_rejected("feed", &err);
                Err(err)
            }
        }
    }

    pub fn apply_event(&self, event: ChangeEvent) -> Result<UpdateOutcome, MalformedRecordError> {
        self.apply_raw(event.record)
    }

    pub fn snapshot(&self) -> Vec<InstrumentSnapshot> {
        self.inner
            .read()
            .expect("reconciler lock should not be poisoned")
            .rows
            .clone()
    }

    pub fn view(&self, filter: &SegmentFilter) -> Vec<InstrumentSnapshot> {
        self.inner
            .read()
            .expect("reconciler lock should not be poisoned")
            .rows
            .iter()
            .filter(|record| filter.matches(record))
            .cloned()
            .collect()
    }

    pub fn get(&self, ticker: &str) -> Option<InstrumentSnapshot> {
        let guard = self
            .inner
            .read()
            .expect("reconciler lock should not be poisoned");
        guard
            .index
            .get(ticker.trim())
            .map(|&pos| guard.rows[pos].clone())
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .expect("reconciler lock should not be poisoned")
            .rows
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        {
            let mut guard = self
                .inner
                .write()
                .expect("reconciler lock should not be poisoned");
            *guard = TickerTable::default();
        }
        self.bump();
    }

    /// Monotonic counter bumped on every observable change.
    pub fn version(&self) -> u64 {
        *self.changes.borrow()
    }

    pub fn subscribe_changes(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    fn bump(&self) {
        self.changes.send_modify(|version| *version += 1);
    }
}

fn normalize_ticker(
    mut record: InstrumentSnapshot,
) -> Result<InstrumentSnapshot, MalformedRecordError> {
    let trimmed = record.ticker.trim();
    if trimmed.is_empty() {
        return Err(MalformedRecordError::MissingTicker);
    }
    if trimmed.len() != record.ticker.len() {
        record.ticker = trimmed.to_string();
    }
    Ok(record)
}

fn log_rejected(origin: &'static str, err: &MalformedRecordError) {
    warn!(
        component = "reconciler",
        event = "reconciler.record.rejected",
        origin,
        reason = %err
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn rec(ticker: &str, tir: f64) -> InstrumentSnapshot {
        let mut record = InstrumentSnapshot::new(
            ticker,
            "LECAP",
            NaiveDate::from_ymd_opt(2027, 2, 26).unwrap(),
        );
        record.yield_to_maturity = Some(tir);
        record
    }

    #[test]
    fn update_replaces_in_place_and_appends_new_tickers() {
        let reconciler = SnapshotReconciler::new();
        reconciler.replace_all(vec![rec("S26F7", 0.30), rec("S30A7", 0.31)]);

        assert_eq!(
            reconciler.apply_update(rec("S26F7", 0.29)),
            Ok(UpdateOutcome::Replaced)
        );
        assert_eq!(
            reconciler.apply_update(rec("S31G7", 0.32)),
            Ok(UpdateOutcome::Inserted)
        );

        let tickers: Vec<String> = reconciler
            .snapshot()
            .into_iter()
            .map(|r| r.ticker)
            .collect();
        assert_eq!(tickers, vec!["S26F7", "S30A7", "S31G7"]);
        assert_eq!(reconciler.get("S26F7").unwrap().yield_to_maturity, Some(0.29));
    }

    #[test]
    fn unchanged_update_does_not_bump_version() {
        let reconciler = SnapshotReconciler::new();
        reconciler.apply_update(rec("S26F7", 0.30)).unwrap();
        let version = reconciler.version();

        assert_eq!(
            reconciler.apply_update(rec("S26F7", 0.30)),
            Ok(UpdateOutcome::Unchanged)
        );
        assert_eq!(reconciler.version(), version);
    }

    #[test]
    fn malformed_raw_leaves_collection_untouched() {
        let reconciler = SnapshotReconciler::new();
        reconciler.replace_all(vec![rec("S26F7", 0.30)]);
        let version = reconciler.version();

        let err = reconciler.apply_raw(RawInstrument::default()).unwrap_err();
        assert_eq!(err, MalformedRecordError::MissingTicker);
        assert_eq!(reconciler.snapshot(), vec![rec("S26F7", 0.30)]);
        assert_eq!(reconciler.version(), version);
    }

    #[test]
    fn replace_all_raw_counts_rejections() {
        let reconciler = SnapshotReconciler::new();
        let report = reconciler.replace_all_raw(vec![
            rec("S26F7", 0.30).to_raw(),
            RawInstrument::default(),
            rec("S26F7", 0.28).to_raw(),
        ]);

        assert_eq!(
            report,
            ReplaceReport {
                accepted: 2,
                rejected: 1,
                installed: 1
            }
        );
        assert_eq!(reconciler.get("S26F7").unwrap().yield_to_maturity, Some(0.28));
    }

    #[test]
    fn tickers_are_trimmed_and_blank_tickers_rejected() {
        let reconciler = SnapshotReconciler::new();
        assert_eq!(
            reconciler.apply_update(rec("AL30", 0.11)),
            Ok(UpdateOutcome::Inserted)
        );
        assert_eq!(
            reconciler.apply_update(rec("AL30 ", 0.12)),
            Ok(UpdateOutcome::Replaced)
        );
        let version = reconciler.version();
        assert_eq!(
            reconciler.apply_update(rec("  ", 0.13)),
            Err(MalformedRecordError::MissingTicker)
        );

        assert_eq!(reconciler.len(), 1);
        assert_eq!(reconciler.version(), version);
        let row = reconciler.get("AL30").unwrap();
        assert_eq!(row.ticker, "AL30");
        assert_eq!(row.yield_to_maturity, Some(0.12));
    }

    #[test]
    fn replace_all_skips_blank_tickers_and_merges_padded_ones() {
        let reconciler = SnapshotReconciler::new();
        let installed =
            reconciler.replace_all(vec![rec(" S26F7", 0.30), rec("", 0.31), rec("S26F7", 0.29)]);

        assert_eq!(installed, 1);
        assert_eq!(reconciler.snapshot(), vec![rec("S26F7", 0.29)]);
    }

    #[test]
    fn view_filters_by_segment() {
        let reconciler = SnapshotReconciler::new();
        let mut cer = rec("TZX27", 0.08);
        cer.segment = "CER".to_string();
        reconciler.replace_all(vec![rec("S26F7", 0.30), cer]);

        let view = reconciler.view(&SegmentFilter::tag("CER"));
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].ticker, "TZX27");
    }
}
