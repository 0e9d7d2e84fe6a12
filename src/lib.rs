//! Bondboard core crate.
//!
//! Current implemented scope:
//! - instrument model and boundary validation
//! - live snapshot reconciliation (bulk load + change feed)
//! - per-segment log-linear curve fitting
//! - in-memory and SQLite data sources
//! - dashboard routes, CSV export and visibility-driven session lifecycle

mod config;
mod curve;
mod dashboard;
mod export;
mod instrument;
mod memory_source;
mod observability;
mod reconciler;
mod segments;
mod session;
mod source;
mod sqlite_source;

pub use config::{
    server_config_from_env, ConfigError, ServerConfig, SourceKind, DEFAULT_DASHBOARD_ADDR,
    DEFAULT_DEMO_FEED_MS, DEFAULT_TABLE,
};
pub use curve::{
    fit, fit_in_window, fit_line, segment_curve, CurveObservation, DegenerateFit, SegmentCurve,
    TrendLine, TrendPoint,
};
pub use dashboard::{
    build_curves, dashboard_router, format_row_cells, render_dashboard_html, BoardQuery,
    BoardSnapshot, CurvesQuery, DashboardState, VisibilityCommand, DASHBOARD_HEADERS,
};
pub use export::{write_snapshot_csv, EXPORT_HEADERS};
pub use instrument::{
    parse_maturity_date, InstrumentSnapshot, MalformedRecordError, RawInstrument,
    MATURITY_DATE_FORMAT,
};
pub use memory_source::{demo_records, spawn_demo_feed, InMemoryDataSource};
pub use observability::{
    init_logging, log_app_bind, log_app_start, log_source_selected, logging_config_from_env,
    LogFormat, LoggingConfig, LoggingInitError,
};
pub use reconciler::{ReplaceReport, SnapshotReconciler, UpdateOutcome};
pub use segments::{
    default_segment_groups, find_group, group_for_segment, CurveSegmentGroup, DomainWindow,
    SegmentFilter, XAxis,
};
pub use session::{
    run_lifecycle, LiveSession, SessionConfig, SessionStatus, StatusBoard, SubscriptionHandle,
    Visibility,
};
pub use source::{
    market_today, BatchFilter, ChangeEvent, ChangeFeed, ChangeKind, DataSource, DataSourceError,
    FeedHub, SubscriptionError,
};
pub use sqlite_source::SqliteDataSource;
