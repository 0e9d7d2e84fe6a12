//! CSV export of the reconciled board.

use std::io::Write;

use serde::Serialize;

use crate::instrument::{InstrumentSnapshot, MATURITY_DATE_FORMAT};

#[derive(Debug, Serialize)]
struct ExportRow<'a> {
    ticker: &'a str,
    segment: &'a str,
    maturity_date: String,
    price: Option<f64>,
    tir: Option<f64>,
    tna: Option<f64>,
    tem: Option<f64>,
    days_to_maturity: Option<f64>,
    modified_duration: Option<f64>,
    parity: Option<f64>,
    used_previous_close: bool,
    last_updated: Option<String>,
}

impl<'a> From<&'a InstrumentSnapshot> for ExportRow<'a> {
    fn from(record: &'a InstrumentSnapshot) -> Self {
        Self {
            ticker: &record.ticker,
            segment: &record.segment,
            maturity_date: record.maturity_date.format(MATURITY_DATE_FORMAT).to_string(),
            price: record.price,
            tir: record.yield_to_maturity,
            tna: record.tna,
            tem: record.tem,
            days_to_maturity: record.days_to_maturity,
            modified_duration: record.modified_duration,
            parity: record.parity,
            used_previous_close: record.used_previous_close,
            last_updated: record.last_updated.map(|ts| ts.to_rfc3339()),
        }
    }
}

/// Write `rows` as CSV with a header line. Missing values are empty cells.
pub fn write_snapshot_csv<W: Write>(
    rows: &[InstrumentSnapshot],
    writer: W,
) -> Result<(), csv::Error> {
    let mut out = csv::Writer::from_writer(writer);
    if rows.is_empty() {
        out.write_record(EXPORT_HEADERS)?;
    }
    for record in rows {
        out.serialize(ExportRow::from(record))?;
    }
    out.flush()?;
    Ok(())
}

pub const EXPORT_HEADERS: [&str; 12] = [
    "ticker",
    "segment",
    "maturity_date",
    "price",
    "tir",
    "tna",
    "tem",
    "days_to_maturity",
    "modified_duration",
    "parity",
    "used_previous_close",
    "last_updated",
];

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn header_matches_serialized_field_order() {
        let mut record = InstrumentSnapshot::new(
            "TZX27",
            "CER",
            NaiveDate::from_ymd_opt(2027, 6, 30).unwrap(),
        );
        record.price = Some(263.5);
        record.yield_to_maturity = Some(0.071);

        let mut buf = Vec::new();
        write_snapshot_csv(&[record], &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let mut lines = text.lines();

        assert_eq!(lines.next().unwrap(), EXPORT_HEADERS.join(","));
        assert_eq!(
            lines.next().unwrap(),
            "TZX27,CER,2027-06-30,263.5,0.071,,,,,,false,"
        );
        assert!(lines.next().is_none());
    }

    #[test]
    fn empty_board_still_writes_header() {
        let mut buf = Vec::new();
        write_snapshot_csv(&[], &mut buf).unwrap();
        assert_eq!(String::from_utf8(buf).unwrap().trim_end(), EXPORT_HEADERS.join(","));
    }
}
