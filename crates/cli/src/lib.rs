pub mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use helmsman_core::config::LoadOptions;

#[derive(Debug, Parser)]
#[command(
    name = "helmsman",
    about = "Helmsman operator CLI",
    long_about = "Inspect configuration, check readiness, apply migrations, and list remote tools.",
    after_help = "Examples:\n  helmsman doctor --json\n  helmsman config\n  helmsman --config ops/helmsman.toml tools"
)]
pub struct Cli {
    #[arg(long, global = true, help = "Config file to load instead of helmsman.toml")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, database connectivity, and capability-server handshakes")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Discover tools on configured capability servers and list their names")]
    Tools,
}

impl Cli {
    fn load_options(&self) -> LoadOptions {
        LoadOptions {
            require_file: self.config.is_some(),
            config_path: self.config.clone(),
            ..LoadOptions::default()
        }
    }
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();
    let options = cli.load_options();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(options),
        Command::Config => commands::config::run(options),
        Command::Doctor { json } => commands::doctor::run(options, json),
        Command::Tools => commands::tools::run(options),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
