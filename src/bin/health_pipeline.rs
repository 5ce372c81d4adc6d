use healthlake::{
    init_logging, log_app_start, log_run_summary, logging_config_from_env, run_pipeline,
    PipelineConfig,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start("health_pipeline", &logging_cfg);

    let cfg = PipelineConfig::from_env()?;
    let run = run_pipeline(&cfg)?;
    log_run_summary(&run);

    Ok(())
}
