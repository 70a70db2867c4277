use std::process::ExitCode;

use retail_metrics::{
    engine_config_from_env, init_logging, log_run_outcome, log_run_start,
    logging_config_from_env, MetricsEngine,
};

fn main() -> ExitCode {
    let logging_cfg = logging_config_from_env();
    if let Err(err) = init_logging(&logging_cfg) {
        eprintln!("logging init failed: {err}");
        return ExitCode::FAILURE;
    }

    let config = engine_config_from_env();
    log_run_start(&logging_cfg, &config);

    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("daily metrics run failed: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(config: retail_metrics::EngineConfig) -> Result<(), Box<dyn std::error::Error>> {
    let mut engine = MetricsEngine::open(config)?;
    let outcome = engine.run()?;
    log_run_outcome(&outcome);
    engine.close()?;

    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}
