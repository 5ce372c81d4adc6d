use std::{net::SocketAddr, sync::Arc};

use healthlake::{
    dashboard_router, init_logging, log_app_start, log_dashboard_bind, log_dashboard_source,
    logging_config_from_env, parse_bool, DashboardSource, DashboardSourceChoice,
    InMemoryDashboardSource, PipelineConfig, SqliteDashboardSource,
};

const USE_DEMO_VAR: &str = "HEALTHLAKE_DASHBOARD_USE_DEMO";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start("dashboard_server", &logging_cfg);

    let addr: SocketAddr = std::env::var("HEALTHLAKE_DASHBOARD_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
        .parse()?;

    let source = source_from_env()?;
    let app = dashboard_router(source);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    log_dashboard_bind(bound_addr);
    axum::serve(listener, app).await?;

    Ok(())
}

fn source_from_env() -> Result<Arc<dyn DashboardSource>, Box<dyn std::error::Error>> {
    let force_demo = std::env::var(USE_DEMO_VAR)
        .ok()
        .as_deref()
        .and_then(parse_bool)
        .unwrap_or(false);

    if force_demo {
        log_dashboard_source(DashboardSourceChoice::Demo {
            reason: USE_DEMO_VAR,
        });
        return Ok(Arc::new(InMemoryDashboardSource::demo()));
    }

    let cfg = PipelineConfig::from_env()?;
    log_dashboard_source(DashboardSourceChoice::Sqlite {
        store_path: &cfg.store_path,
        result_table: &cfg.result_table,
    });
    Ok(Arc::new(SqliteDashboardSource::new(
        cfg.store_path,
        cfg.result_table,
    )))
}
