use clap::Parser;

use taskmux::cli::{self, Cli};
use taskmux::logging::init_tracing;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.logs_to_stderr());
    cli::run(cli).await
}
