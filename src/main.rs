use std::io::Write;

use anyhow::{Context, Result};
use companion_backend::config::BackendConfig;
use companion_backend::pipeline::{TurnPipeline, TurnRequest};
use companion_backend::runtime::BackendRuntime;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

const HELP: &str = "commands: /persona <id>, /personas, /report, /help, /quit";

struct Session {
    user_id: String,
    device_id: String,
    persona_id: Option<String>,
}

impl Session {
    fn from_env() -> Self {
        let non_empty = |key: &str| {
            std::env::var(key)
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        Self {
            user_id: non_empty("COMPANION_USER_ID").unwrap_or_else(|| "local".to_string()),
            device_id: non_empty("COMPANION_DEVICE_ID").unwrap_or_else(|| "terminal".to_string()),
            persona_id: non_empty("COMPANION_PERSONA"),
        }
    }

    fn persona_label(&self, pipeline: &TurnPipeline) -> String {
        pipeline.personas().resolve(self.persona_id.as_deref()).id.clone()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,companion=debug")),
        )
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("Companion starting...");

    let config = BackendConfig::load();
    let runtime = BackendRuntime::bootstrap(config)?;
    let pipeline = runtime.pipeline.clone();
    let mut session = Session::from_env();

    println!(
        "Talking to '{}' as {}. {}",
        session.persona_label(&pipeline),
        session.user_id,
        HELP
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush().context("Failed to flush stdout")?;

        let Some(line) = lines.next_line().await.context("Failed to read stdin")? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(command) = line.strip_prefix('/') {
            let mut parts = command.split_whitespace();
            match (parts.next(), parts.next()) {
                (Some("quit"), _) | (Some("exit"), _) => break,
                (Some("help"), _) => println!("{}", HELP),
                (Some("personas"), _) => {
                    println!("default {}", pipeline.personas().ids().join(" "));
                }
                (Some("persona"), Some(id)) => {
                    session.persona_id = Some(id.to_string());
                    println!("Now talking to '{}'", session.persona_label(&pipeline));
                }
                (Some("report"), _) => {
                    let persona_id = session.persona_label(&pipeline);
                    let state = pipeline.relationship_state(&session.user_id, &persona_id);
                    println!(
                        "affinity {:.1}, streak {}, {} evaluation(s) logged",
                        state.affinity_score,
                        state.stable_streak,
                        state.eval_log.len()
                    );
                }
                _ => println!("{}", HELP),
            }
            continue;
        }

        let stream = pipeline.handle_turn(TurnRequest {
            user_id: session.user_id.clone(),
            device_id: session.device_id.clone(),
            persona_id: session.persona_id.clone(),
            text: line.to_string(),
        });

        while let Ok(chunk) = stream.chunks.recv_async().await {
            print!("{}", chunk);
            std::io::stdout().flush().context("Failed to flush stdout")?;
        }
        println!();

        match stream.done.await {
            Ok(outcome) => {
                if let Some(error) = &outcome.error {
                    tracing::warn!("Turn {:?} failed: {}", outcome.round_id, error);
                }
                if let Some(eval) = &outcome.evaluation {
                    tracing::debug!("Affinity {:+.1} -> {:.1} ({})", eval.delta, eval.score_after, eval.note);
                }
            }
            Err(e) => tracing::error!("Turn task failed: {}", e),
        }
        pipeline.prune_locks();
    }

    tracing::info!("Companion shutting down");
    Ok(())
}
