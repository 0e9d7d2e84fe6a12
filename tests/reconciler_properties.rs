use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use bondboard::{
    fit, ChangeEvent, ChangeKind, InstrumentSnapshot, RawInstrument, SegmentFilter,
    SnapshotReconciler, UpdateOutcome, XAxis,
};
use chrono::NaiveDate;

fn cer(ticker: &str, days: f64, tir: f64) -> InstrumentSnapshot {
    let mut record = InstrumentSnapshot::new(
        ticker,
        "CER",
        NaiveDate::from_ymd_opt(2027, 6, 30).unwrap(),
    );
    record.days_to_maturity = Some(days);
    record.yield_to_maturity = Some(tir);
    record
}

fn update_event(record: &InstrumentSnapshot) -> ChangeEvent {
    ChangeEvent {
        table: "instruments".to_string(),
        kind: ChangeKind::Update,
        record: record.to_raw(),
    }
}

/// Plain OLS of y on ln(x), computed independently of the crate.
fn expected_line(points: &[(f64, f64)]) -> (f64, f64) {
    let n = points.len() as f64;
    let mean_lx = points.iter().map(|(x, _)| x.ln()).sum::<f64>() / n;
    let mean_y = points.iter().map(|(_, y)| y).sum::<f64>() / n;
    let cov: f64 = points
        .iter()
        .map(|(x, y)| (x.ln() - mean_lx) * (y - mean_y))
        .sum();
    let var: f64 = points.iter().map(|(x, _)| (x.ln() - mean_lx).powi(2)).sum();
    let slope = cov / var;
    (slope, mean_y - slope * mean_lx)
}

#[test]
fn tickers_stay_unique_across_bulk_and_feed() {
    let reconciler = SnapshotReconciler::new();
    reconciler.replace_all(vec![cer("TZX27", 250.0, 0.07), cer("TZX27", 250.0, 0.071)]);
    assert_eq!(reconciler.len(), 1);

    for tir in [0.072, 0.073, 0.074] {
        reconciler
            .apply_event(update_event(&cer("TZX27", 250.0, tir)))
            .unwrap();
    }
    reconciler.apply_update(cer("TZXD7", 420.0, 0.08)).unwrap();

    let snapshot = reconciler.snapshot();
    assert_eq!(snapshot.len(), 2);
    let tzx27: Vec<_> = snapshot.iter().filter(|r| r.ticker == "TZX27").collect();
    assert_eq!(tzx27.len(), 1);
    assert_eq!(tzx27[0].yield_to_maturity, Some(0.074));
}

#[test]
fn applying_the_same_update_twice_is_idempotent() {
    let reconciler = SnapshotReconciler::new();
    reconciler.replace_all(vec![cer("TZX27", 250.0, 0.07), cer("TX28", 750.0, 0.09)]);

    let update = cer("TX28", 750.0, 0.095);
    assert_eq!(
        reconciler.apply_update(update.clone()),
        Ok(UpdateOutcome::Replaced)
    );
    let once = reconciler.snapshot();
    let version = reconciler.version();

    assert_eq!(reconciler.apply_update(update), Ok(UpdateOutcome::Unchanged));
    assert_eq!(reconciler.snapshot(), once);
    assert_eq!(reconciler.version(), version);
}

#[test]
fn replace_all_discards_every_previous_ticker() {
    let reconciler = SnapshotReconciler::new();
    reconciler.replace_all(vec![cer("TZX27", 250.0, 0.07), cer("TX28", 750.0, 0.09)]);
    reconciler.apply_update(cer("TZXD7", 420.0, 0.08)).unwrap();

    reconciler.replace_all(vec![cer("TX26", 30.0, 0.05)]);

    let tickers: Vec<String> = reconciler.snapshot().into_iter().map(|r| r.ticker).collect();
    assert_eq!(tickers, vec!["TX26"]);
    assert!(reconciler.get("TZXD7").is_none());
}

#[test]
fn malformed_feed_records_are_skipped_without_side_effects() {
    let reconciler = SnapshotReconciler::new();
    reconciler.replace_all(vec![cer("TZX27", 250.0, 0.07)]);
    let before = reconciler.snapshot();

    let missing_segment = RawInstrument {
        ticker: Some("TZX28".to_string()),
        maturity_date: Some("2028-06-30".to_string()),
        yield_to_maturity: Some(0.09),
        ..RawInstrument::default()
    };
    let bad_date = RawInstrument {
        ticker: Some("TZX27".to_string()),
        segment: Some("CER".to_string()),
        maturity_date: Some("30/06/2027".to_string()),
        ..RawInstrument::default()
    };

    assert!(reconciler.apply_raw(missing_segment).is_err());
    assert!(reconciler.apply_raw(bad_date).is_err());
    assert_eq!(reconciler.snapshot(), before);
}

#[test]
fn cer_curve_follows_a_live_update() {
    let reconciler = SnapshotReconciler::new();
    reconciler.replace_all(vec![
        cer("TX26", 30.0, 0.05),
        cer("TZX27", 90.0, 0.08),
        cer("TX28", 200.0, 0.03),
    ]);

    let filter = SegmentFilter::tag("CER");
    let before = fit(&reconciler.snapshot(), &filter, XAxis::DaysToMaturity);
    let (slope, intercept) = expected_line(&[(30.0, 0.05), (90.0, 0.08), (200.0, 0.03)]);
    assert_eq!(
        before.iter().map(|p| p.x).collect::<Vec<_>>(),
        vec![30.0, 90.0, 200.0]
    );
    for point in &before {
        assert!((point.fitted_y - (slope * point.x.ln() + intercept)).abs() < 1e-12);
    }

    reconciler
        .apply_event(update_event(&cer("TZX27", 90.0, 0.10)))
        .unwrap();

    let after = fit(&reconciler.snapshot(), &filter, XAxis::DaysToMaturity);
    let (slope, intercept) = expected_line(&[(30.0, 0.05), (90.0, 0.10), (200.0, 0.03)]);
    assert_eq!(reconciler.len(), 3);
    assert_eq!(after.len(), 3);
    for point in &after {
        assert!((point.fitted_y - (slope * point.x.ln() + intercept)).abs() < 1e-12);
    }
    assert_ne!(before, after);
}

/// Every field of the row is derived from one counter so a torn write shows
/// up as mismatched fields.
fn generation(k: u32) -> InstrumentSnapshot {
    let mut record = cer("TZX27", f64::from(k), f64::from(k) / 1_000.0);
    record.price = Some(f64::from(k) * 10.0);
    record.modified_duration = Some(f64::from(k) / 100.0);
    record
}

#[test]
fn readers_never_observe_a_partially_applied_update() {
    let reconciler = SnapshotReconciler::new();
    reconciler.replace_all(vec![generation(1), cer("TX28", 750.0, 0.09)]);
    let done = Arc::new(AtomicBool::new(false));

    let writer = {
        let reconciler = reconciler.clone();
        let done = Arc::clone(&done);
        thread::spawn(move || {
            for k in 2..=5_000 {
                reconciler.apply_update(generation(k)).unwrap();
            }
            done.store(true, Ordering::SeqCst);
        })
    };

    let mut reads = 0;
    let mut last_seen = 1.0;
    while !done.load(Ordering::SeqCst) || reads == 0 {
        let snapshot = reconciler.snapshot();
        assert_eq!(snapshot.len(), 2);
        let row = snapshot.iter().find(|r| r.ticker == "TZX27").unwrap();
        let k = row.days_to_maturity.unwrap();
        assert_eq!(row.yield_to_maturity, Some(k / 1_000.0));
        assert_eq!(row.price, Some(k * 10.0));
        assert_eq!(row.modified_duration, Some(k / 100.0));
        assert!(k >= last_seen, "update went backwards: {k} after {last_seen}");
        last_seen = k;
        reads += 1;
    }

    writer.join().unwrap();
    assert_eq!(reconciler.get("TZX27"), Some(generation(5_000)));
}
