//! CLI command parsing and execution.

use std::io::Write as _;
use std::path::Path;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use futures::StreamExt;
use llm_core::{Block, Delta};

use crate::config::{ApiConfig, Config};
use crate::core::registry::ProviderRegistry;
use crate::core::store::ConversationStore;
use crate::core::stream::{GenerationOptions, StreamingEngine, TurnEvent, TurnRequest};
use crate::core::tools::{BUILTIN_TOOLS, ToolRegistry};

/// Meridian - branching conversations with live, resumable generation.
#[derive(Parser)]
#[command(name = "meridian")]
#[command(about = "Branching conversations with live, resumable generation")]
#[command(version)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase logging verbosity.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP API server.
    Serve {
        /// Host to bind to (defaults to `[api] host`).
        #[arg(short = 'H', long)]
        host: Option<String>,

        /// Port to bind to (defaults to `[api] port`).
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Send one message and print the streamed reply.
    #[command(visible_alias = "c")]
    Chat {
        /// The message to send.
        prompt: String,

        /// Continue an existing chat from its last viewed turn.
        #[arg(short, long)]
        chat: Option<String>,

        /// Project for a new chat.
        #[arg(long, default_value = "default")]
        project: String,

        /// Model as `provider/model`.
        #[arg(short, long)]
        model: Option<String>,

        /// Request extended thinking.
        #[arg(short, long)]
        thinking: bool,
    },

    /// Print the turns from a chat's root to a turn.
    History {
        /// Turn id.
        turn_id: String,
    },

    /// Manage configuration.
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },

    /// Print version and build information.
    Version,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show the current configuration.
    Show,

    /// Show the configuration file path.
    Path,

    /// Write a default configuration file with a fresh API token.
    Init {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },

    /// Generate a new API token for remote access.
    GenerateToken,
}

/// Build the streaming engine described by `config`.
///
/// Turns another process left streaming are not touched. `serve` recovers
/// them before binding.
///
/// # Errors
///
/// Returns an error if the database cannot be opened.
pub fn open_engine(config: &Arc<Config>) -> anyhow::Result<StreamingEngine> {
    let store = Arc::new(ConversationStore::open(config.database_path()?)?);
    let providers = Arc::new(ProviderRegistry::from_config(Arc::clone(config)));

    let tools = if let Some(root) = &config.tools.documents_root {
        ToolRegistry::with_documents(root)
    } else {
        let mut tools = ToolRegistry::new();
        for name in BUILTIN_TOOLS {
            tools.declare_builtin(*name);
        }
        tools
    };

    Ok(StreamingEngine::new(
        store,
        providers,
        tools,
        config.streaming.clone(),
        config.default_model.clone(),
    ))
}

/// Run a parsed command.
///
/// # Errors
///
/// Returns an error if the command fails.
pub async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Serve { host, port } => {
            let config = Arc::new(Config::load()?);
            let engine = Arc::new(open_engine(&config)?);
            engine.recover()?;
            let host = host.unwrap_or_else(|| config.api.host.clone());
            let port = port.unwrap_or(config.api.port);
            crate::api::serve(engine, config.api.token(), &host, port).await?;
        }

        Commands::Chat {
            prompt,
            chat,
            project,
            model,
            thinking,
        } => {
            let config = Arc::new(Config::load()?);
            let engine = open_engine(&config)?;
            let options = GenerationOptions {
                model,
                thinking,
                ..GenerationOptions::default()
            };
            chat_once(&engine, &prompt, chat.as_deref(), &project, options).await?;
        }

        Commands::History { turn_id } => {
            let config = Arc::new(Config::load()?);
            let engine = open_engine(&config)?;
            print_history(&engine, &turn_id)?;
        }

        Commands::Config { command } => handle_config_command(command)?,

        Commands::Version => {
            println!("{}", crate::build_info::version_line());
        }
    }

    Ok(())
}

/// Send `prompt` and print the reply as it streams.
async fn chat_once(
    engine: &StreamingEngine,
    prompt: &str,
    chat_id: Option<&str>,
    project: &str,
    options: GenerationOptions,
) -> anyhow::Result<()> {
    let exchange = if let Some(chat_id) = chat_id {
        let chat = engine.chat(chat_id)?;
        engine.create_turn(
            chat_id,
            TurnRequest {
                prev_turn_id: chat.last_viewed_turn_id,
                blocks: vec![Block::text(prompt)],
                options,
            },
        )?
    } else {
        engine.start_chat(
            project,
            None,
            TurnRequest {
                prev_turn_id: None,
                blocks: vec![Block::text(prompt)],
                options,
            },
        )?
    };

    let mut feed = engine.subscribe(&exchange.assistant_turn.id, None)?;
    let mut stdout = std::io::stdout();
    while let Some(sequenced) = feed.next().await {
        match sequenced.event {
            TurnEvent::BlockDelta(delta) => {
                if let Delta::TextDelta { text } = delta.delta {
                    print!("{text}");
                    stdout.flush().ok();
                }
            }
            TurnEvent::BlockCatchup { block } => {
                if let Some(text) = block.block.text_content() {
                    print!("{text}");
                    stdout.flush().ok();
                }
            }
            TurnEvent::TurnError { error, .. } => {
                println!();
                anyhow::bail!("{error}");
            }
            _ => {}
        }
    }
    println!();
    eprintln!(
        "chat {} turn {}",
        exchange.chat.id, exchange.assistant_turn.id
    );
    Ok(())
}

fn print_history(engine: &StreamingEngine, turn_id: &str) -> anyhow::Result<()> {
    let path = engine.path(turn_id)?;
    let ids: Vec<String> = path.iter().map(|t| t.id.clone()).collect();
    let blocks = engine.store().blocks_for_turns(&ids)?;

    for turn in &path {
        println!("[{}] {:?} ({})", turn.id, turn.role, turn.status);
        for block in blocks.get(&turn.id).into_iter().flatten() {
            match block.block.text_content() {
                Some(text) => println!("  {text}"),
                None => println!("  <{}>", block.block.block_type()),
            }
        }
    }
    Ok(())
}

fn handle_config_command(command: ConfigCommands) -> anyhow::Result<()> {
    match command {
        ConfigCommands::Show => {
            let config = Config::load()?;
            println!("{}", toml::to_string_pretty(&config)?);
        }
        ConfigCommands::Path => {
            let path = Config::config_path()?;
            println!("{}", path.display());
        }
        ConfigCommands::Init { force } => {
            let path = Config::config_path()?;
            write_default_config(&path, force)?;
            println!("Wrote {}", path.display());
        }
        ConfigCommands::GenerateToken => {
            let token = ApiConfig::generate_token();
            println!("Generated API token:\n");
            println!("  {token}\n");
            println!("Add to your config.toml:");
            println!("  [api]");
            println!("  token = \"{token}\"\n");
            println!("Or set environment variable:");
            println!("  export MERIDIAN_API_TOKEN=\"{token}\"");
        }
    }
    Ok(())
}

/// Write the default configuration with a generated token to `path`.
fn write_default_config(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut config = Config::default();
    config.api.token = Some(ApiConfig::generate_token());
    std::fs::write(path, toml::to_string_pretty(&config)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::chat::TurnStatus;
    use crate::core::store::{ChatTarget, NewExchange};
    use clap::CommandFactory;

    #[test]
    fn cli_parses_verbose_flag() {
        let cli = Cli::parse_from(["meridian", "-vv", "version"]);
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn cli_parses_chat_command() {
        let cli = Cli::parse_from([
            "meridian",
            "c",
            "hello",
            "--model",
            "lorem/lorem-fast",
            "--thinking",
        ]);
        match cli.command {
            Commands::Chat {
                prompt,
                chat,
                project,
                model,
                thinking,
            } => {
                assert_eq!(prompt, "hello");
                assert!(chat.is_none());
                assert_eq!(project, "default");
                assert_eq!(model.as_deref(), Some("lorem/lorem-fast"));
                assert!(thinking);
            }
            _ => panic!("expected Chat command"),
        }
    }

    #[test]
    fn cli_parses_serve_overrides() {
        let cli = Cli::parse_from(["meridian", "serve", "-H", "0.0.0.0", "-p", "9000"]);
        match cli.command {
            Commands::Serve { host, port } => {
                assert_eq!(host.as_deref(), Some("0.0.0.0"));
                assert_eq!(port, Some(9000));
            }
            _ => panic!("expected Serve command"),
        }
    }

    #[test]
    fn cli_parses_config_init_force() {
        let cli = Cli::parse_from(["meridian", "config", "init", "--force"]);
        assert!(matches!(
            cli.command,
            Commands::Config {
                command: ConfigCommands::Init { force: true }
            }
        ));
    }

    #[test]
    fn cli_debug_assert() {
        Cli::command().debug_assert();
    }

    #[test]
    fn default_config_round_trips_with_token() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        write_default_config(&path, false).unwrap();
        let config = Config::load_from(&path).unwrap();
        assert!(config.api.token.as_deref().is_some_and(|t| t.starts_with("mer_")));

        assert!(write_default_config(&path, false).is_err());
        write_default_config(&path, true).unwrap();
    }

    #[tokio::test]
    async fn open_engine_runs_a_chat() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.database.path = Some(dir.path().join("meridian.db"));
        config.default_model = "lorem/lorem".to_string();
        config.lorem.words_per_second = 0.0;
        let config = Arc::new(config);

        let engine = open_engine(&config).unwrap();
        chat_once(
            &engine,
            "hello",
            None,
            "proj",
            GenerationOptions::default(),
        )
        .await
        .unwrap();

        let chats = engine.chats("proj").unwrap();
        assert_eq!(chats.len(), 1);
        assert_eq!(chats[0].title, "hello");
    }

    #[test]
    fn open_engine_leaves_live_turns_alone() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.database.path = Some(dir.path().join("meridian.db"));
        let config = Arc::new(config);

        // Another process is still generating this turn.
        let store = ConversationStore::open(config.database_path().unwrap()).unwrap();
        let exchange = store
            .create_exchange(&NewExchange {
                target: ChatTarget::New {
                    project_id: "proj".to_string(),
                    system_prompt: None,
                },
                prev_turn_id: None,
                user_blocks: vec![Block::text("still going")],
                model: "lorem/lorem".to_string(),
            })
            .unwrap();
        let turn_id = exchange.assistant_turn.id;
        store.update_turn_status(&turn_id, TurnStatus::Streaming).unwrap();

        let engine = open_engine(&config).unwrap();
        print_history(&engine, &turn_id).unwrap();
        assert_eq!(
            engine.store().get_turn(&turn_id).unwrap().status,
            TurnStatus::Streaming
        );

        assert_eq!(engine.recover().unwrap(), 1);
        assert_eq!(
            engine.store().get_turn(&turn_id).unwrap().status,
            TurnStatus::Error
        );
    }
}
