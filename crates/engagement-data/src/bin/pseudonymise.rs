//! Runs the pseudonymisation pipeline.
//!
//! Settings come from `ENGAGEMENT_*` environment variables, an optional
//! config file and command-line flags; see [`engagement_data::Settings`].
//! Logs are JSON lines filtered by `RUST_LOG`.

use std::env;
use std::io::{self, Write};
use std::process::ExitCode;

use engagement_data::{PipelineError, Settings, run};
use ortho_config::OrthoConfig;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

fn main() -> ExitCode {
    if let Err(e) = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .try_init()
    {
        warn!(error = %e, "tracing init failed");
    }

    match execute() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "run failed");
            if let Err(write_err) = writeln!(io::stderr().lock(), "{err}") {
                drop(write_err);
            }
            ExitCode::FAILURE
        }
    }
}

fn execute() -> Result<(), PipelineError> {
    let settings =
        Settings::load_from_iter(env::args_os()).map_err(|err| PipelineError::Settings {
            message: err.to_string(),
        })?;
    let summary = run(&settings)?;
    info!(
        workflows = summary.workflows,
        rows = summary.rows,
        projects = summary.projects,
        "outputs written"
    );
    Ok(())
}
