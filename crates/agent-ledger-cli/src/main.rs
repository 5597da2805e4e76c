use std::process::ExitCode;

use agent_ledger_cli::{error_envelope, init_tracing, run_cli, Cli};
use clap::Parser;

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose());

    match run_cli(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            match error_envelope(&err) {
                Some(envelope) => println!("{envelope}"),
                None => eprintln!("error: {err:#}"),
            }
            ExitCode::FAILURE
        }
    }
}
