use std::process::ExitCode;

use clap::Parser;
use trip_ledger_cli::{error_envelope, init_tracing, run_cli, Cli};

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing();
    match run_cli(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "command failed");
            match serde_json::to_string_pretty(&error_envelope(&err)) {
                Ok(rendered) => println!("{rendered}"),
                Err(_) => eprintln!("{err:#}"),
            }
            ExitCode::FAILURE
        }
    }
}
