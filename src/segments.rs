//! Curve segment configuration and the filters applied before fitting.

use serde::{Deserialize, Serialize};

use crate::instrument::InstrumentSnapshot;

/// Which field plots on the X axis of a curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum XAxis {
    DaysToMaturity,
    ModifiedDuration,
}

impl XAxis {
    pub fn label(self) -> &'static str {
        match self {
            Self::DaysToMaturity => "Days to maturity",
            Self::ModifiedDuration => "Modified duration",
        }
    }
}

/// A named family of segment tags fitted as one curve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurveSegmentGroup {
    pub name: String,
    pub segments: Vec<String>,
    pub x_axis: XAxis,
}

impl CurveSegmentGroup {
    pub fn new(name: impl Into<String>, segments: &[&str], x_axis: XAxis) -> Self {
        Self {
            name: name.into(),
            segments: segments.iter().map(|s| (*s).to_string()).collect(),
            x_axis,
        }
    }

    pub fn contains(&self, segment: &str) -> bool {
        self.segments
            .iter()
            .any(|tag| tag.eq_ignore_ascii_case(segment.trim()))
    }

    pub fn filter(&self) -> SegmentFilter {
        SegmentFilter::AnyOf(self.segments.clone())
    }
}

pub fn default_segment_groups() -> Vec<CurveSegmentGroup> {
    vec![
        CurveSegmentGroup::new(
            "LECAPs y Similares",
            &["LECAP", "BONCAP", "BONTE", "DUAL TAMAR"],
            XAxis::DaysToMaturity,
        ),
        CurveSegmentGroup::new("Bonos CER", &["CER"], XAxis::DaysToMaturity),
        CurveSegmentGroup::new("Dollar Linked", &["DOLLAR LINKED"], XAxis::DaysToMaturity),
        CurveSegmentGroup::new(
            "Soberanos en Dólares",
            &["BONAR", "GLOBAL"],
            XAxis::ModifiedDuration,
        ),
    ]
}

pub fn find_group<'a>(
    groups: &'a [CurveSegmentGroup],
    name: &str,
) -> Option<&'a CurveSegmentGroup> {
    let name = name.trim();
    groups
        .iter()
        .find(|group| group.name.eq_ignore_ascii_case(name))
}

pub fn group_for_segment<'a>(
    groups: &'a [CurveSegmentGroup],
    segment: &str,
) -> Option<&'a CurveSegmentGroup> {
    groups.iter().find(|group| group.contains(segment))
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SegmentFilter {
    /// Aggregate over every segment.
    #[default]
    Any,
    Tag(String),
    AnyOf(Vec<String>),
}

impl SegmentFilter {
    pub fn tag(tag: impl Into<String>) -> Self {
        Self::Tag(tag.into())
    }

    pub fn matches(&self, record: &InstrumentSnapshot) -> bool {
        let segment = record.segment.trim();
        match self {
            Self::Any => true,
            Self::Tag(tag) => tag.trim().eq_ignore_ascii_case(segment),
            Self::AnyOf(tags) => tags.iter().any(|tag| tag.trim().eq_ignore_ascii_case(segment)),
        }
    }
}

/// Inclusive X range selected by the user; open ends are unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DomainWindow {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl DomainWindow {
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn between(min: f64, max: f64) -> Self {
        Self {
            min: Some(min),
            max: Some(max),
        }
    }

    pub fn contains(&self, x: f64) -> bool {
        self.min.map_or(true, |min| x >= min) && self.max.map_or(true, |max| x <= max)
    }

    /// Records whose X is missing are left for the positivity filter to drop.
    pub fn admits(&self, record: &InstrumentSnapshot, axis: XAxis) -> bool {
        match record.x_value(axis) {
            Some(x) => self.contains(x),
            None => self.min.is_none() && self.max.is_none(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn record(segment: &str) -> InstrumentSnapshot {
        InstrumentSnapshot::new(
            "X",
            segment,
            NaiveDate::from_ymd_opt(2027, 3, 1).unwrap(),
        )
    }

    #[test]
    fn default_groups_cover_lecap_family() {
        let groups = default_segment_groups();
        let lecaps = find_group(&groups, "lecaps y similares").unwrap();
        assert!(lecaps.contains("DUAL TAMAR"));
        assert!(lecaps.contains("boncap"));
        assert_eq!(lecaps.x_axis, XAxis::DaysToMaturity);

        let usd = group_for_segment(&groups, "GLOBAL").unwrap();
        assert_eq!(usd.x_axis, XAxis::ModifiedDuration);
        assert!(group_for_segment(&groups, "PROVINCIAL").is_none());
    }

    #[test]
    fn segment_filter_variants() {
        let cer = record("CER");
        assert!(SegmentFilter::Any.matches(&cer));
        assert!(SegmentFilter::tag("cer").matches(&cer));
        assert!(!SegmentFilter::tag("LECAP").matches(&cer));
        assert!(SegmentFilter::AnyOf(vec!["LECAP".into(), "CER".into()]).matches(&cer));
    }

    #[test]
    fn domain_window_is_inclusive_and_open_ended() {
        let window = DomainWindow::between(30.0, 200.0);
        assert!(window.contains(30.0));
        assert!(window.contains(200.0));
        assert!(!window.contains(201.0));

        let open_max = DomainWindow {
            min: Some(10.0),
            max: None,
        };
        assert!(open_max.contains(10_000.0));
        assert!(DomainWindow::unbounded().contains(-1.0));
    }

    #[test]
    fn bounded_window_drops_records_without_x() {
        let rec = record("CER");
        assert!(DomainWindow::unbounded().admits(&rec, XAxis::DaysToMaturity));
        assert!(!DomainWindow::between(0.0, 10.0).admits(&rec, XAxis::DaysToMaturity));
    }
}
