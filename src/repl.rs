//! Line-oriented REPL front end
//!
//! Thin surface over [`Orchestrator::handle_input`]: reads lines from
//! stdin, prints responses, and exits cleanly on `exit`/`quit`.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::debug;

use crate::context::ExecutionContextProvider;
use crate::orchestrator::Orchestrator;

const PROMPT: &[u8] = b"conclave> ";

fn is_exit(line: &str) -> bool {
    matches!(line, "exit" | "quit")
}

/// Run the REPL until EOF or an exit token.
pub async fn run<P: ExecutionContextProvider>(
    orchestrator: &Orchestrator<P>,
) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    stdout.write_all(PROMPT).await?;
    stdout.flush().await?;

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if is_exit(line) {
            debug!("REPL exit requested");
            break;
        }
        if !line.is_empty() {
            // Registry and provisioning errors surface here as
            // user-visible messages; they never tear the loop down.
            match orchestrator.handle_input(line).await {
                Ok(response) if !response.is_empty() => {
                    stdout.write_all(response.as_bytes()).await?;
                    stdout.write_all(b"\n").await?;
                }
                Ok(_) => {}
                Err(e) => {
                    stdout.write_all(format!("error: {e}\n").as_bytes()).await?;
                }
            }
        }
        stdout.write_all(PROMPT).await?;
        stdout.flush().await?;
    }

    Ok(())
}
