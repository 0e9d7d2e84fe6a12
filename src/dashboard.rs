//! Render sink: the board as HTML, JSON, curve payloads and CSV, plus the
//! visibility hook that drives the live session.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::curve::{segment_curve, SegmentCurve};
use crate::export::write_snapshot_csv;
use crate::instrument::{InstrumentSnapshot, MATURITY_DATE_FORMAT};
use crate::reconciler::SnapshotReconciler;
use crate::segments::{
    default_segment_groups, find_group, CurveSegmentGroup, DomainWindow, SegmentFilter,
};
use crate::session::{SessionStatus, StatusBoard, Visibility};

pub const DASHBOARD_HEADERS: [&str; 10] = [
    "Ticker",
    "Segment",
    "Maturity",
    "Price",
    "TIR",
    "TNA",
    "TEM",
    "Days",
    "Mod. Duration",
    "Parity",
];

/// Query string shared by the HTML, snapshot and export routes. `segment`
/// wins over `group` when both are present.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct BoardQuery {
    pub segment: Option<String>,
    pub group: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CurvesQuery {
    pub group: Option<String>,
    pub x_min: Option<f64>,
    pub x_max: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct VisibilityCommand {
    pub state: Visibility,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BoardSnapshot {
    pub status: SessionStatus,
    pub status_line: String,
    pub version: u64,
    pub rows: Vec<InstrumentSnapshot>,
}

#[derive(Clone)]
pub struct DashboardState {
    reconciler: SnapshotReconciler,
    status: StatusBoard,
    groups: Arc<Vec<CurveSegmentGroup>>,
    lifecycle: Option<mpsc::Sender<Visibility>>,
}

impl DashboardState {
    pub fn new(reconciler: SnapshotReconciler, status: StatusBoard) -> Self {
        Self {
            reconciler,
            status,
            groups: Arc::new(default_segment_groups()),
            lifecycle: None,
        }
    }

    pub fn with_groups(mut self, groups: Vec<CurveSegmentGroup>) -> Self {
        self.groups = Arc::new(groups);
        self
    }

    /// Forward `POST /dashboard/visibility` to a running lifecycle driver.
    pub fn with_lifecycle(mut self, commands: mpsc::Sender<Visibility>) -> Self {
        self.lifecycle = Some(commands);
        self
    }

    /// Rows matching `filter`, ordered by maturity then ticker.
    pub fn board(&self, filter: &SegmentFilter) -> BoardSnapshot {
        let status = self.status.get();
        let mut rows = self.reconciler.view(filter);
        rows.sort_by(|a, b| {
            a.maturity_date
                .cmp(&b.maturity_date)
                .then_with(|| a.ticker.cmp(&b.ticker))
        });

        BoardSnapshot {
            status_line: status.status_line(),
            status,
            version: self.reconciler.version(),
            rows,
        }
    }

    fn resolve_filter(&self, query: &BoardQuery) -> Result<SegmentFilter, Response> {
        if let Some(segment) = non_blank(&query.segment) {
            return Ok(SegmentFilter::tag(segment));
        }
        match non_blank(&query.group) {
            None => Ok(SegmentFilter::Any),
            Some(name) => find_group(&self.groups, name)
                .map(CurveSegmentGroup::filter)
                .ok_or_else(|| unknown_group(name)),
        }
    }
}

pub fn dashboard_router(state: DashboardState) -> Router {
    Router::new()
        .route("/dashboard", get(get_dashboard_html))
        .route("/dashboard/snapshot", get(get_board_snapshot))
        .route("/dashboard/curves", get(get_curves))
        .route("/dashboard/export.csv", get(get_export_csv))
        .route("/dashboard/visibility", post(post_visibility))
        .with_state(state)
}

/// Curves for `groups` over the current board, restricted to `window`.
pub fn build_curves(
    records: &[InstrumentSnapshot],
    groups: &[CurveSegmentGroup],
    window: &DomainWindow,
) -> Vec<SegmentCurve> {
    groups
        .iter()
        .map(|group| segment_curve(records, group, window))
        .collect()
}

/// Display cells in `DASHBOARD_HEADERS` order; missing values render as `-`.
pub fn format_row_cells(record: &InstrumentSnapshot) -> [String; 10] {
    [
        record.ticker.clone(),
        record.segment.clone(),
        record.maturity_date.format(MATURITY_DATE_FORMAT).to_string(),
        fixed_or_dash(record.price, 2),
        percent_or_dash(record.yield_to_maturity),
        percent_or_dash(record.tna),
        percent_or_dash(record.tem),
        fixed_or_dash(record.days_to_maturity, 0),
        fixed_or_dash(record.modified_duration, 2),
        fixed_or_dash(record.parity, 2),
    ]
}

pub fn render_dashboard_html(
    snapshot: &BoardSnapshot,
    groups: &[CurveSegmentGroup],
    selected_group: Option<&str>,
) -> String {
    let now_utc = Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string();
    let status_class = if snapshot.status.is_live() {
        "status-live"
    } else {
        "status-degraded"
    };

    let mut out = String::new();
    out.push_str("<!DOCTYPE html><html><head><meta charset=\"utf-8\">\n");
    out.push_str("<meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\n");
    out.push_str("<title>Bondboard</title>\n");
    out.push_str("<style>:root{--bg:#f3f5f4;--card:#fff;--ink:#16221d;--muted:#5b6b63;--line:#d6ddd9;--head:#123a2c;--neg:#b3261e;--prev:#8a6d00}*{box-sizing:border-box}body{margin:0;color:var(--ink);font-family:\"Inter\",\"Segoe UI\",sans-serif;background:var(--bg);min-height:100vh}.shell{max-width:1280px;margin:0 auto;padding:20px 16px}.hero{background:linear-gradient(135deg,#0f3326,#24604a);color:#f4faf7;border-radius:14px;padding:16px 20px}.hero h1{margin:0 0 6px;font-size:1.5rem}.hero-meta{display:flex;gap:16px;flex-wrap:wrap;font-size:.9rem;color:#d4e8de}.status-live{color:#b8f5d0}.status-degraded{color:#ffd9a0}.filters{margin-top:14px;font-size:.9rem}.card{margin-top:14px;background:var(--card);border:1px solid var(--line);border-radius:14px;overflow:hidden}.table-wrap{overflow:auto;max-height:78vh}table{width:100%;border-collapse:collapse;min-width:960px}thead th{position:sticky;top:0;background:var(--head);color:#eef6f2;font-size:.78rem;text-transform:uppercase;letter-spacing:.04em;padding:9px 10px;text-align:right}thead th:nth-child(-n+3){text-align:left}tbody td{font-size:.85rem;padding:8px 10px;border-bottom:1px solid var(--line);white-space:nowrap;text-align:right;font-variant-numeric:tabular-nums}tbody td:nth-child(-n+3){text-align:left}tbody tr:nth-child(even){background:#f9fbfa}.prev-close{color:var(--prev);font-style:italic}.yield-neg{color:var(--neg);font-weight:600}.legend{padding:9px 14px;border-top:1px solid var(--line);font-size:.8rem;color:var(--muted)}</style>\n");
    out.push_str("</head><body><main class=\"shell\">\n");
    out.push_str("<section class=\"hero\"><h1>Bondboard</h1><div class=\"hero-meta\">\n");
    out.push_str(&format!(
        "<span id=\"status-line\" class=\"{status_class}\">{}</span>",
        escape_html(&snapshot.status_line)
    ));
    out.push_str(&format!("<span>Instruments: {}</span>", snapshot.rows.len()));
    out.push_str(&format!("<span>Version: {}</span>", snapshot.version));
    out.push_str(&format!("<span>Generated: {}</span>", escape_html(&now_utc)));
    out.push_str("</div></section>\n");

    out.push_str(
        "<form id=\"filters-form\" class=\"filters\" method=\"get\" action=\"/dashboard\">",
    );
    out.push_str(
        "<label>Curve <select name=\"group\"><option value=\"\">All segments</option>",
    );
    for group in groups {
        let selected = selected_group.is_some_and(|name| name.eq_ignore_ascii_case(&group.name));
        out.push_str(&format!(
            "<option value=\"{0}\"{1}>{0}</option>",
            escape_html(&group.name),
            if selected { " selected" } else { "" }
        ));
    }
    out.push_str("</select></label></form>\n");

    out.push_str(
        "<section class=\"card\"><div class=\"table-wrap\"><table id=\"board-table\">\n<thead><tr>",
    );
    for header in DASHBOARD_HEADERS {
        out.push_str("<th>");
        out.push_str(&escape_html(header));
        out.push_str("</th>");
    }
    out.push_str("</tr></thead><tbody id=\"board-body\">\n");

    for record in &snapshot.rows {
        let cells = format_row_cells(record);
        out.push_str(&format!("<tr data-ticker=\"{}\">", escape_html(&record.ticker)));
        for (idx, cell) in cells.iter().enumerate() {
            let class = cell_class(record, idx);
            if class.is_empty() {
                out.push_str("<td>");
            } else {
                out.push_str(&format!("<td class=\"{class}\">"));
            }
            out.push_str(&escape_html(cell));
            out.push_str("</td>");
        }
        out.push_str("</tr>\n");
    }

    out.push_str("</tbody></table></div>");
    out.push_str("<div class=\"legend\">Prices in <span class=\"prev-close\">italics</span> ");
    out.push_str("are previous closes. Yields are effective annual rates.</div></section>");
    out.push_str(DASHBOARD_SCRIPT);
    out.push_str("</main></body></html>\n");
    out
}

const DASHBOARD_SCRIPT: &str = "<script>\
const form=document.getElementById('filters-form');\
form.querySelector('select').addEventListener('change',()=>form.submit());\
function sendVisibility(){const state=document.visibilityState==='visible'?'visible':'hidden';\
fetch('/dashboard/visibility',{method:'POST',headers:{'content-type':'application/json'},body:JSON.stringify({state}),keepalive:true}).catch(()=>{});}\
async function refresh(){if(document.visibilityState!=='visible')return;\
try{const res=await fetch(location.pathname+location.search,{cache:'no-store'});if(!res.ok)return;\
const doc=new DOMParser().parseFromString(await res.text(),'text/html');\
for(const id of ['board-body','status-line']){const next=doc.getElementById(id);const cur=document.getElementById(id);if(next&&cur)cur.replaceWith(next);}}catch(_){}}\
document.addEventListener('visibilitychange',()=>{sendVisibility();refresh();});\
setInterval(refresh, 2000);\
</script>";

fn cell_class(record: &InstrumentSnapshot, idx: usize) -> &'static str {
    match idx {
        3 if record.used_previous_close => "prev-close",
        4 if record.yield_to_maturity.is_some_and(|y| y < 0.0) => "yield-neg",
        _ => "",
    }
}

fn fixed_or_dash(value: Option<f64>, decimals: usize) -> String {
    match value {
        Some(v) if v.is_finite() => format!("{v:.decimals$}"),
        _ => "-".to_string(),
    }
}

fn percent_or_dash(value: Option<f64>) -> String {
    match value {
        Some(v) if v.is_finite() => format!("{:.2}%", v * 100.0),
        _ => "-".to_string(),
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn unknown_group(name: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": format!("unknown segment group: {name}") })),
    )
        .into_response()
}

fn escape_html(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

async fn get_dashboard_html(
    State(state): State<DashboardState>,
    Query(query): Query<BoardQuery>,
) -> Response {
    let filter = match state.resolve_filter(&query) {
        Ok(filter) => filter,
        Err(response) => return response,
    };
    let snapshot = state.board(&filter);
    Html(render_dashboard_html(
        &snapshot,
        &state.groups,
        non_blank(&query.group),
    ))
    .into_response()
}

async fn get_board_snapshot(
    State(state): State<DashboardState>,
    Query(query): Query<BoardQuery>,
) -> Response {
    let filter = match state.resolve_filter(&query) {
        Ok(filter) => filter,
        Err(response) => return response,
    };
    let snapshot = state.board(&filter);
    info!(
        component = "dashboard",
        event = "http.snapshot.request",
        rows = snapshot.rows.len(),
        version = snapshot.version,
        filter = ?filter
    );
    Json(snapshot).into_response()
}

async fn get_curves(
    State(state): State<DashboardState>,
    Query(query): Query<CurvesQuery>,
) -> Response {
    let groups: Vec<CurveSegmentGroup> = match non_blank(&query.group) {
        None => state.groups.as_ref().clone(),
        Some(name) => match find_group(&state.groups, name) {
            Some(group) => vec![group.clone()],
            None => return unknown_group(name),
        },
    };
    let window = DomainWindow {
        min: query.x_min,
        max: query.x_max,
    };

    let records = state.reconciler.snapshot();
    let curves = build_curves(&records, &groups, &window);
    info!(
        component = "dashboard",
        event = "http.curves.request",
        groups = curves.len(),
        instruments = records.len()
    );
    Json(curves).into_response()
}

async fn get_export_csv(
    State(state): State<DashboardState>,
    Query(query): Query<BoardQuery>,
) -> Response {
    let filter = match state.resolve_filter(&query) {
        Ok(filter) => filter,
        Err(response) => return response,
    };
    let snapshot = state.board(&filter);

    let mut body = Vec::new();
    if let Err(err) = write_snapshot_csv(&snapshot.rows, &mut body) {
        error!(
            component = "dashboard",
            event = "http.export.error",
            error = %err
        );
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    info!(
        component = "dashboard",
        event = "http.export.request",
        rows = snapshot.rows.len()
    );
    (
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"bondboard.csv\"",
            ),
        ],
        body,
    )
        .into_response()
}

async fn post_visibility(
    State(state): State<DashboardState>,
    Json(command): Json<VisibilityCommand>,
) -> StatusCode {
    let Some(lifecycle) = state.lifecycle.as_ref() else {
        warn!(
            component = "dashboard",
            event = "http.visibility.unavailable",
            state = ?command.state
        );
        return StatusCode::SERVICE_UNAVAILABLE;
    };

    match lifecycle.send(command.state).await {
        Ok(()) => {
            info!(
                component = "dashboard",
                event = "http.visibility.command",
                state = ?command.state
            );
            StatusCode::ACCEPTED
        }
        Err(_) => {
            warn!(
                component = "dashboard",
                event = "http.visibility.unavailable",
                state = ?command.state
            );
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}
