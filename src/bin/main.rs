use std::{process::ExitCode, sync::Arc};

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tandemd::{
    cli::{Cli, Commands, parse_args},
    config::{load_config, parse_duration},
    error::SupervisorError,
    health::{self, AggregateStatus},
    registry::ServiceRegistry,
    supervisor::Supervisor,
};

fn main() -> ExitCode {
    let args = parse_args();
    init_logging(&args);

    let result = match args.command {
        Commands::Run { config } => run_supervisor(&config),
        Commands::Check { config } => check_config(&config),
        Commands::Health { url, timeout } => return query_health(&url, &timeout),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(args: &Cli) {
    let filter = if let Some(level) = args.log_level {
        EnvFilter::new(level.as_str())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn run_supervisor(config_path: &str) -> Result<(), SupervisorError> {
    let config = load_config(Some(config_path))?;
    let supervisor = Supervisor::new(config)?;

    register_signal_handler(Arc::clone(&supervisor));

    if let Err(err) = supervisor.start() {
        error!("Startup failed: {err}");
        supervisor.shutdown();
        supervisor.wait();
        return Err(err);
    }

    supervisor.wait();
    Ok(())
}

/// SIGTERM and SIGINT both trigger the shutdown coordinator; a second signal
/// while draining is a no-op. All other signals keep their fatal defaults.
fn register_signal_handler(supervisor: Arc<Supervisor>) {
    if let Err(err) = ctrlc::set_handler(move || {
        info!("Termination signal received");
        supervisor.shutdown();
    }) {
        error!("Failed to register signal handler: {err}");
    }
}

fn check_config(config_path: &str) -> Result<(), SupervisorError> {
    let config = load_config(Some(config_path))?;
    let registry = ServiceRegistry::from_config(config)?;

    println!("Configuration OK: {} services", registry.len());
    println!("Start order: {}", registry.start_order().join(" -> "));
    Ok(())
}

fn query_health(url: &str, timeout: &str) -> ExitCode {
    let timeout = match parse_duration("timeout", timeout) {
        Ok(timeout) => timeout,
        Err(err) => {
            eprintln!("Error: {err}");
            return ExitCode::FAILURE;
        }
    };

    match health::check_endpoint(url, timeout) {
        Ok(report) => {
            println!("status: {}", report.status.as_ref());
            for service in &report.services {
                let pid = service
                    .pid
                    .map(|pid| pid.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!("  {} {} (pid {})", service.id, service.status.as_ref(), pid);
            }

            if report.status == AggregateStatus::Unhealthy {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(err) => {
            eprintln!("Error: health endpoint unreachable: {err}");
            ExitCode::FAILURE
        }
    }
}
