#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chat_state::logging::init_from_config;
use chat_state::{
    Config, ConnectionManager, Connector, MemoryConnector, RedisConnector, SessionPolicy,
    SessionState, SessionStore,
};
use clap::{Parser, Subcommand};

/// Inspect and edit cached chat session state.
#[derive(Parser, Debug)]
#[command(name = "chat-state")]
#[command(version = "0.1.0")]
#[command(about = "Inspect and edit cached chat session state.", long_about = None)]
struct Cli {
    /// Config file (default: ~/.chat-state/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the state the chat flow would see for a sender
    Get {
        sender: String,
    },
    /// Store a state for a sender, keeping stored fields that are not given
    Set {
        sender: String,

        #[arg(long)]
        lang: Option<String>,

        #[arg(long)]
        step: Option<String>,

        #[arg(long)]
        org: Option<String>,

        #[arg(long)]
        prev_step: Option<String>,
    },
    /// Remove the stored state for a sender
    Delete {
        sender: String,
    },
    /// Check that the store is reachable, printing connection events
    Ping,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load_with_env(cli.config.as_deref()).context("Failed to load config")?;
    init_from_config(&config.observability);

    if config.store.is_memory() {
        run(MemoryConnector::new(), &config, cli.command).await
    } else {
        let connector = RedisConnector::new(&config.store.url).context("Invalid store URL")?;
        run(connector, &config, cli.command).await
    }
}

async fn run<C: Connector>(connector: C, config: &Config, command: Commands) -> Result<()> {
    let connections = ConnectionManager::from_config(connector, &config.store);
    let store = SessionStore::new(connections, SessionPolicy::from(&config.session));

    match command {
        Commands::Get { sender } => {
            let state = store.try_get(&sender).await?;
            println!("{}", serde_json::to_string_pretty(&state)?);
        }
        Commands::Set {
            sender,
            lang,
            step,
            org,
            prev_step,
        } => {
            let mut state = store.try_get(&sender).await?;
            apply_set(&mut state, lang, step, org, prev_step);
            store.try_set(&sender, &mut state).await?;
            println!("{}", serde_json::to_string_pretty(&state)?);
        }
        Commands::Delete { sender } => {
            store.try_delete(&sender).await?;
            tracing::info!(sender = %sender, "State deleted");
        }
        Commands::Ping => {
            let mut events = store.connections().subscribe();
            let healthy = store.health_check().await;
            while let Ok(event) = events.try_recv() {
                println!("{}", serde_json::to_string(&event)?);
            }
            if !healthy {
                bail!(
                    "Store at {} is not reachable ({})",
                    config.store.url,
                    store.connections().state_label()
                );
            }
            println!("PONG from {}", store.connections().backend_name());
        }
    }

    Ok(())
}

/// Overwrite only the fields given on the command line.
fn apply_set(
    state: &mut SessionState,
    lang: Option<String>,
    step: Option<String>,
    org: Option<String>,
    prev_step: Option<String>,
) {
    if let Some(lang) = lang {
        state.lang = lang;
    }
    if let Some(step) = step {
        state.step = step;
    }
    if org.is_some() {
        state.org = org;
    }
    if prev_step.is_some() {
        state.prev_step = prev_step;
    }
    state.is_first_visit = false;
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_set_with_optional_fields() {
        let cli = Cli::try_parse_from([
            "chat-state", "set", "u1", "--lang", "en", "--step", "menu", "--org", "acme",
        ])
        .unwrap();

        match cli.command {
            Commands::Set {
                sender,
                lang,
                step,
                org,
                prev_step,
            } => {
                assert_eq!(sender, "u1");
                assert_eq!(lang.as_deref(), Some("en"));
                assert_eq!(step.as_deref(), Some("menu"));
                assert_eq!(org.as_deref(), Some("acme"));
                assert!(prev_step.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_set_without_fields_leaves_them_unset() {
        let cli = Cli::try_parse_from(["chat-state", "set", "u1", "--step", "menu"]).unwrap();
        match cli.command {
            Commands::Set { lang, step, .. } => {
                assert!(lang.is_none());
                assert_eq!(step.as_deref(), Some("menu"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_apply_set_keeps_omitted_fields() {
        let mut state = SessionState {
            lang: "en".to_string(),
            step: "start".to_string(),
            org: Some("acme".to_string()),
            prev_step: Some("intro".to_string()),
            last_activity: 1,
            is_first_visit: true,
        };

        apply_set(&mut state, None, Some("menu".to_string()), None, None);

        assert_eq!(state.lang, "en");
        assert_eq!(state.step, "menu");
        assert_eq!(state.org.as_deref(), Some("acme"));
        assert_eq!(state.prev_step.as_deref(), Some("intro"));
        assert!(!state.is_first_visit);
    }

    #[test]
    fn test_global_config_flag() {
        let cli = Cli::try_parse_from(["chat-state", "ping", "--config", "/tmp/c.json"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/c.json")));
        assert!(matches!(cli.command, Commands::Ping));
    }
}
