use clap::Parser;
use triage_worker::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    triage_worker::run(Cli::parse()).await
}
