//! Operator tool: print the relationship report for a user×persona pair.
//!
//! Usage: `companion_backend <user_id> <persona_id>`, or `companion_backend --list`.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use companion_backend::config::BackendConfig;
use companion_backend::relationship::{build_report, RelationshipStateStore};
use companion_backend::runtime::open_store;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,companion_backend=debug")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = BackendConfig::load();
    let store = open_store(&config.database_path)?;
    let relationships = RelationshipStateStore::new(store);

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.as_slice() {
        [flag] if flag == "--list" => {
            for (user_id, persona_id) in relationships.list_pairs()? {
                println!("{}\t{}", user_id, persona_id);
            }
        }
        [user_id, persona_id] => {
            let state = relationships.load(user_id, persona_id);
            let report = build_report(&state, Utc::now());
            let json = serde_json::to_string_pretty(&report).context("Failed to render report")?;
            println!("{}", json);
        }
        _ => bail!("usage: companion_backend <user_id> <persona_id> | --list"),
    }
    Ok(())
}
