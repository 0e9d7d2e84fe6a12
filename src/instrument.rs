//! Instrument rows as they flow from the backend into the dashboard.
//!
//! `RawInstrument` mirrors the loosely-typed payload the backend and its change
//! feed deliver. `InstrumentSnapshot` is the validated row the rest of the crate
//! works with; conversion happens once, at the boundary.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::segments::XAxis;

pub const MATURITY_DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentSnapshot {
    pub ticker: String,
    pub segment: String,
    pub maturity_date: NaiveDate,
    pub price: Option<f64>,
    pub yield_to_maturity: Option<f64>,
    pub days_to_maturity: Option<f64>,
    pub modified_duration: Option<f64>,
    pub tna: Option<f64>,
    pub tem: Option<f64>,
    pub parity: Option<f64>,
    pub used_previous_close: bool,
    pub last_updated: Option<DateTime<Utc>>,
}

impl InstrumentSnapshot {
    pub fn new(
        ticker: impl Into<String>,
        segment: impl Into<String>,
        maturity_date: NaiveDate,
    ) -> Self {
        Self {
            ticker: ticker.into(),
            segment: segment.into(),
            maturity_date,
            price: None,
            yield_to_maturity: None,
            days_to_maturity: None,
            modified_duration: None,
            tna: None,
            tem: None,
            parity: None,
            used_previous_close: false,
            last_updated: None,
        }
    }

    pub fn x_value(&self, axis: XAxis) -> Option<f64> {
        match axis {
            XAxis::DaysToMaturity => self.days_to_maturity,
            XAxis::ModifiedDuration => self.modified_duration,
        }
    }

    /// `(x, yield)` when both are usable for a log-X regression.
    pub fn curve_coordinates(&self, axis: XAxis) -> Option<(f64, f64)> {
        let x = self.x_value(axis)?;
        let y = self.yield_to_maturity?;
        (x.is_finite() && x > 0.0 && y.is_finite()).then_some((x, y))
    }

    pub fn to_raw(&self) -> RawInstrument {
        RawInstrument {
            ticker: Some(self.ticker.clone()),
            segment: Some(self.segment.clone()),
            maturity_date: Some(self.maturity_date.format(MATURITY_DATE_FORMAT).to_string()),
            price: self.price,
            yield_to_maturity: self.yield_to_maturity,
            days_to_maturity: self.days_to_maturity,
            modified_duration: self.modified_duration,
            tna: self.tna,
            tem: self.tem,
            parity: self.parity,
            used_previous_close: Some(self.used_previous_close),
            last_updated: self.last_updated.map(|ts| ts.to_rfc3339()),
        }
    }
}

/// Wire shape of an instrument row. Every field is optional here; `validate`
/// decides what the dashboard can live with.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawInstrument {
    #[serde(default, alias = "symbol")]
    pub ticker: Option<String>,
    #[serde(default, alias = "tipo")]
    pub segment: Option<String>,
    #[serde(default, alias = "vencimiento")]
    pub maturity_date: Option<String>,
    #[serde(default, alias = "precio")]
    pub price: Option<f64>,
    #[serde(default, alias = "tir")]
    pub yield_to_maturity: Option<f64>,
    #[serde(default, alias = "dias_al_vencimiento")]
    pub days_to_maturity: Option<f64>,
    #[serde(default, alias = "duration_modificada")]
    pub modified_duration: Option<f64>,
    #[serde(default)]
    pub tna: Option<f64>,
    #[serde(default)]
    pub tem: Option<f64>,
    #[serde(default, alias = "paridad")]
    pub parity: Option<f64>,
    #[serde(default, alias = "usa_cierre_anterior")]
    pub used_previous_close: Option<bool>,
    #[serde(default, alias = "actualizado")]
    pub last_updated: Option<String>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MalformedRecordError {
    #[error("record has no ticker")]
    MissingTicker,
    #[error("record {ticker} is missing field {field}")]
    MissingField { ticker: String, field: &'static str },
    #[error("record {ticker} has invalid {field} value '{value}'")]
    InvalidField {
        ticker: String,
        field: &'static str,
        value: String,
    },
}

impl RawInstrument {
    pub fn ticker_hint(&self) -> Option<&str> {
        self.ticker
            .as_deref()
            .map(str::trim)
            .filter(|ticker| !ticker.is_empty())
    }

    pub fn validate(self) -> Result<InstrumentSnapshot, MalformedRecordError> {
        let ticker = self
            .ticker_hint()
            .map(str::to_string)
            .ok_or(MalformedRecordError::MissingTicker)?;

        let segment = self
            .segment
            .as_deref()
            .map(str::trim)
            .filter(|segment| !segment.is_empty())
            .map(str::to_string)
            .ok_or_else(|| MalformedRecordError::MissingField {
                ticker: ticker.clone(),
                field: "segment",
            })?;

        let raw_maturity = self
            .maturity_date
            .as_deref()
            .map(str::trim)
            .filter(|raw| !raw.is_empty())
            .ok_or_else(|| MalformedRecordError::MissingField {
                ticker: ticker.clone(),
                field: "maturity_date",
            })?;
        let maturity_date = parse_maturity_date(raw_maturity).ok_or_else(|| {
            MalformedRecordError::InvalidField {
                ticker: ticker.clone(),
                field: "maturity_date",
                value: raw_maturity.to_string(),
            }
        })?;

        let last_updated = match self.last_updated.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => Some(parse_timestamp(raw).ok_or_else(|| {
                MalformedRecordError::InvalidField {
                    ticker: ticker.clone(),
                    field: "last_updated",
                    value: raw.to_string(),
                }
            })?),
        };

        Ok(InstrumentSnapshot {
            ticker,
            segment,
            maturity_date,
            price: self.price,
            yield_to_maturity: self.yield_to_maturity,
            days_to_maturity: self.days_to_maturity,
            modified_duration: self.modified_duration,
            tna: self.tna,
            tem: self.tem,
            parity: self.parity,
            used_previous_close: self.used_previous_close.unwrap_or(false),
            last_updated,
        })
    }

    pub fn maturity(&self) -> Option<NaiveDate> {
        self.maturity_date.as_deref().and_then(parse_maturity_date)
    }
}

impl TryFrom<RawInstrument> for InstrumentSnapshot {
    type Error = MalformedRecordError;

    fn try_from(raw: RawInstrument) -> Result<Self, Self::Error> {
        raw.validate()
    }
}

pub fn parse_maturity_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    // Backends sometimes ship timestamps for date columns.
    let date_part = raw.get(..10).unwrap_or(raw);
    NaiveDate::parse_from_str(date_part, MATURITY_DATE_FORMAT).ok()
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}
