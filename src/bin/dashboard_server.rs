use std::{sync::Arc, time::Duration};

use bondboard::{
    dashboard_router, demo_records, init_logging, log_app_bind, log_app_start,
    log_source_selected, logging_config_from_env, market_today, run_lifecycle,
    server_config_from_env, spawn_demo_feed, DashboardState, DataSource, InMemoryDataSource,
    InstrumentSnapshot, LiveSession, ServerConfig, SessionConfig, SourceKind, SqliteDataSource,
    Visibility,
};
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start(&logging_cfg);

    let cfg = server_config_from_env()?;
    log_source_selected(&cfg);

    let state = match &cfg.source {
        SourceKind::Demo => {
            let source = Arc::new(InMemoryDataSource::demo(cfg.table.clone(), market_today()));
            if cfg.demo_feed_interval_ms > 0 {
                spawn_demo_feed(
                    Arc::clone(&source),
                    Duration::from_millis(cfg.demo_feed_interval_ms),
                );
            }
            start_session(source, &cfg)
        }
        SourceKind::Sqlite { path } => {
            let source = SqliteDataSource::open(path, &cfg.table)?;
            if source.count()? == 0 {
                let seed: Vec<_> = demo_records(market_today())
                    .iter()
                    .map(InstrumentSnapshot::to_raw)
                    .collect();
                source.seed(&seed)?;
            }
            start_session(Arc::new(source), &cfg)
        }
    };

    let app = dashboard_router(state);
    let listener = tokio::net::TcpListener::bind(cfg.bind_addr).await?;
    let bound_addr = listener.local_addr()?;

    log_app_bind(bound_addr);
    axum::serve(listener, app).await?;

    Ok(())
}

fn start_session<S: DataSource>(source: Arc<S>, cfg: &ServerConfig) -> DashboardState {
    let session = LiveSession::new(
        source,
        SessionConfig {
            table: cfg.table.clone(),
        },
    );
    let state = DashboardState::new(session.reconciler(), session.status());

    let (commands, receiver) = mpsc::channel::<Visibility>(16);
    tokio::spawn(run_lifecycle(session, receiver));
    state.with_lifecycle(commands)
}
