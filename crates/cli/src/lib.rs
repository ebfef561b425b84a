pub mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "triage",
    about = "Triage operator CLI",
    long_about = "Apply migrations, inspect effective configuration, and maintain routing rules.",
    after_help = "Examples:\n  triage migrate\n  triage config\n  triage reorder-routing-rules --org org-1 rule-a rule-b"
)]
pub struct Cli {
    #[arg(long, global = true, help = "Config file to load instead of triage.toml")]
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
    #[command(about = "Move the listed routing rules to the front, in order")]
    ReorderRoutingRules {
        #[arg(long, help = "Organization that owns the rules")]
        org: String,
        #[arg(required = true, help = "Rule ids in their new order")]
        rule_ids: Vec<String>,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();
    let config_path = cli.config.as_deref();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(config_path),
        Command::Config => commands::config::run(config_path),
        Command::ReorderRoutingRules { org, rule_ids } => {
            commands::reorder::run(config_path, &org, &rule_ids)
        }
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
