// tandem CLI entry point.

use std::process;

use clap::{ArgAction, Parser};
use tracing_subscriber::EnvFilter;

mod client;
mod commands;
mod config;
mod exit_code;
mod output;

use config::ConnectionArgs;
use exit_code::ExitCode;
use output::OutputFormat;

#[derive(Parser)]
#[command(name = "tandem", version, about = "Object locks, presence and live events for Tandem workspaces")]
struct Cli {
    #[command(flatten)]
    connection: ConnectionArgs,

    /// Force JSON output.
    #[arg(long, global = true)]
    json: bool,

    /// Log progress to stderr (-v info, -vv debug). `TANDEM_LOG` overrides.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: commands::Command,
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_env("TANDEM_LOG")
        .unwrap_or_else(|_| EnvFilter::new(format!("{default_level},hyper=warn,reqwest=warn")));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn main() -> process::ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let format = OutputFormat::detect(cli.json);
    match commands::run(cli.command, &cli.connection, format) {
        Ok(()) => ExitCode::Success.into(),
        Err(error) => {
            output::print_anyhow_error(format, &error);
            ExitCode::from_error(&error).into()
        }
    }
}
