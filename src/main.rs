use anyhow::Result;
use tracing_subscriber::EnvFilter;

use conclave::{LoopbackProvider, Orchestrator};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let orchestrator = Orchestrator::new(LoopbackProvider::new());
    conclave::repl::run(&orchestrator).await
}
