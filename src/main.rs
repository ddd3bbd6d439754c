use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};

use fmrelay::account::{AccountService, AccountStatus};
use fmrelay::config::{
    Config, ServiceKeys, default_config_path, load_config, save_config, set_service_keys,
};
use fmrelay::replay::{load_session, replay};
use fmrelay::scrobble::ScrobbleEngine;
use fmrelay::service::LastFmClient;
use fmrelay::session::SessionCache;
use fmrelay::store::{JsonFileStore, UserStore};

#[derive(Parser)]
#[command(
    name = "fmrelay",
    version,
    about = "Relay voice-channel playback to Last.fm"
)]
struct Cli {
    #[arg(long, value_name = "PATH", global = true)]
    config_path: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Service {
        #[command(subcommand)]
        command: ServiceCommand,
    },
    Account {
        #[command(subcommand)]
        command: AccountCommand,
    },
    Replay {
        #[arg(long, value_name = "PATH", help = "Recorded playback session (JSON)")]
        events: PathBuf,
    },
}

#[derive(Subcommand)]
enum ServiceCommand {
    SetKeys {
        #[arg(long, help = "API key")]
        api_key: String,
        #[arg(long, help = "API secret")]
        api_secret: String,
    },
}

#[derive(Subcommand)]
enum AccountCommand {
    Link {
        #[arg(long)]
        user_id: u64,
    },
    Unlink {
        #[arg(long)]
        user_id: u64,
    },
    Info {
        #[arg(long)]
        user_id: u64,
    },
    Toggle {
        #[arg(long)]
        user_id: u64,
        #[arg(long, action = clap::ArgAction::Set)]
        enabled: bool,
    },
    List,
}

struct Runtime {
    store: Arc<JsonFileStore>,
    sessions: Arc<SessionCache>,
    client: Arc<LastFmClient>,
}

impl Runtime {
    fn open(config: &Config, config_path: &std::path::Path) -> Result<Self> {
        let keys: &ServiceKeys = config
            .keys
            .as_ref()
            .ok_or_else(|| anyhow!("Missing API keys, run `fmrelay service set-keys` first."))?;
        let client = LastFmClient::new(keys, config.base_url.as_deref())
            .context("Failed building HTTP client")?;
        let store = Arc::new(JsonFileStore::new(config.store_path(config_path)));
        let sessions = Arc::new(SessionCache::new(store.clone() as Arc<dyn UserStore>));
        Ok(Self {
            store,
            sessions,
            client: Arc::new(client),
        })
    }

    fn accounts(&self, config: &Config) -> AccountService {
        AccountService::new(
            self.client.clone(),
            self.sessions.clone(),
            config.pairing_settings(),
        )
    }
}

#[tokio::main]
async fn main() {
    init_logging();
    if let Err(err) = run().await {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}

fn init_logging() {
    use tracing_subscriber::{EnvFilter, fmt};
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_target(false).init();
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config_path.unwrap_or_else(default_config_path);
    match cli.command {
        Commands::Service { command } => match command {
            ServiceCommand::SetKeys {
                api_key,
                api_secret,
            } => {
                let mut config = load_config(&config_path)?;
                set_service_keys(&mut config, &api_key, &api_secret);
                save_config(&config, &config_path)?;
                println!("Saved API keys in {}", config_path.display());
            }
        },
        Commands::Account { command } => {
            let config = load_config(&config_path)?;
            handle_account(command, &config, &config_path).await?;
        }
        Commands::Replay { events } => {
            let config = load_config(&config_path)?;
            let runtime = Runtime::open(&config, &config_path)?;
            let session = load_session(&events)?;
            let engine = ScrobbleEngine::new(
                runtime.client.clone(),
                runtime.sessions.clone(),
                config.scrobble_settings(),
            );
            let summary = replay(&engine, session).await;
            println!(
                "Replayed {} events: {} submitted, {} revoked, {} failed",
                summary.events, summary.submitted, summary.revoked, summary.failed
            );
            if summary.failed > 0 {
                bail!("Finished with {} submission failures.", summary.failed);
            }
        }
    }
    Ok(())
}

async fn handle_account(
    command: AccountCommand,
    config: &Config,
    config_path: &std::path::Path,
) -> Result<()> {
    let runtime = Runtime::open(config, config_path)?;
    let accounts = runtime.accounts(config);
    match command {
        AccountCommand::Link { user_id } => {
            let request = accounts.start_linking(user_id).await?;
            println!("Open this link to authorize access:\n  {}", request.authorization_url);
            if let Some(expires_at) = request.expires_at {
                println!("The link expires at {}", expires_at.to_rfc3339());
            }
            let linked = accounts
                .link(user_id)
                .await
                .context("Linking did not complete")?;
            println!(
                "Linked account {}",
                linked.username.unwrap_or_default()
            );
        }
        AccountCommand::Unlink { user_id } => {
            accounts.unlink(user_id).await?;
            println!("Unlinked account for {user_id}");
        }
        AccountCommand::Info { user_id } => match accounts.describe(user_id).await? {
            AccountStatus::Linked {
                profile,
                scrobble_enabled,
            } => {
                println!("User:\t{}", profile.name);
                if let Some(url) = &profile.url {
                    println!("URL:\t{url}");
                }
                if let Some(registered) = profile.registered {
                    println!("Since:\t{}", registered.format("%Y-%m-%d"));
                }
                if let Some(country) = &profile.country {
                    println!("Country:\t{country}");
                }
                if let Some(count) = profile.play_count {
                    println!("Plays:\t{count}");
                }
                if let Some(count) = profile.track_count {
                    println!("Tracks:\t{count}");
                }
                if let Some(count) = profile.artist_count {
                    println!("Artists:\t{count}");
                }
                if let Some(count) = profile.album_count {
                    println!("Albums:\t{count}");
                }
                println!("Scrobbling:\t{}", if scrobble_enabled { "on" } else { "off" });
            }
            AccountStatus::NotLinked => println!("No account linked for {user_id}"),
        },
        AccountCommand::Toggle { user_id, enabled } => {
            accounts.set_scrobble_enabled(user_id, enabled).await?;
            println!(
                "Scrobbling {} for {user_id}",
                if enabled { "enabled" } else { "disabled" }
            );
        }
        AccountCommand::List => {
            let records = runtime.store.list_records().await?;
            let linked: Vec<_> = records
                .into_iter()
                .filter(|(_, record)| !record.session_key.is_empty())
                .collect();
            if linked.is_empty() {
                bail!("No accounts linked.");
            }
            for (user_id, record) in linked {
                println!("{user_id}\t{}\t{}", record.username, record.scrobble);
            }
        }
    }
    Ok(())
}
