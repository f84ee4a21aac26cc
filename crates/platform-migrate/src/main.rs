use platform_migrate::{build_cli, init_logging, run};
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    let matches = build_cli().get_matches();
    init_logging(matches.get_flag("json-logs"));

    match run(&matches).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => {
            tracing::warn!("Some resources were not migrated");
            ExitCode::FAILURE
        }
        Err(error) => {
            tracing::error!(error = %format!("{error:#}"), "Migration run aborted");
            ExitCode::FAILURE
        }
    }
}
