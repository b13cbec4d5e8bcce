use anyhow::Result;
use clap::Parser;

use remote_mirror_sync::cli::{self, Cli};
use remote_mirror_sync::logging::LoggingContext;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env early; ignore if missing.
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let _logging = LoggingContext::init(cli.log_level.as_deref(), cli.log_file.as_deref())?;

    cli::run(cli).await
}
