//! Presence DLP - CLI
//!
//! `serve` runs the Security Service; the other commands are local
//! administration and client calls against a running service.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use presence_dlp::crypto::MachineBoundStore;
use presence_dlp::storage::SqliteStore;
use presence_dlp::vision::FeatureVector;
use presence_dlp::{CryptoVault, GatewayClient, ProtectedOpener, ServiceConfig};

#[derive(Parser)]
#[command(name = "presence-dlp")]
#[command(version = presence_dlp::VERSION)]
#[command(about = "Presence DLP - endpoint data-loss prevention gated by face liveness")]
struct Cli {
    /// Data directory (database, wrapped keys, token)
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Config file (default: <data-dir>/config.json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log as JSON lines
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the Security Service
    Serve,

    /// Ask the running service for the authorization state
    Status,

    /// Make the running service re-read apps and templates
    Reload,

    /// Encrypt a document in place and register it
    Import {
        path: PathBuf,

        /// Role allowed to open it (repeatable)
        #[arg(short, long)]
        role: Vec<String>,
    },

    /// Check that a protected document opens for the present user
    /// (requires a running service; plaintext stays in memory)
    Open { path: PathBuf },

    /// Delete a protected document and its key
    DeleteFile { id: i64 },

    /// Protect an application
    AddApp {
        /// Executable path or name
        exe: String,

        #[arg(short, long)]
        name: Option<String>,

        /// Role allowed to use it (repeatable)
        #[arg(short, long)]
        role: Vec<String>,
    },

    /// Enroll a user from a face template (JSON array of floats)
    Enroll {
        #[arg(short, long)]
        name: String,

        #[arg(short, long, default_value = "Employee")]
        role: String,

        #[arg(short, long)]
        template: PathBuf,
    },

    /// List protected applications, enrolled users and documents
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.json);

    let data_dir = cli.data_dir.clone().unwrap_or_else(presence_dlp::config::default_data_dir);
    let config = match &cli.config {
        Some(path) => ServiceConfig::load_from(path, &data_dir),
        None => ServiceConfig::load(&data_dir),
    }
    .context("loading configuration")?;

    match cli.command {
        Commands::Serve => {
            tracing::info!("Starting Presence DLP {}", presence_dlp::VERSION);
            presence_dlp::serve(config).await?;
        }

        Commands::Status => {
            let reply = client(&config)?.get_status();
            println!("{}", reply);
        }

        Commands::Reload => {
            let reply = client(&config)?.reload_config();
            println!("{}", reply);
        }

        Commands::Import { path, role } => {
            let (_, store) = open_store(&config)?;
            let id = store.import_file(&path, &role)?;
            println!("✅ Protected as document #{}", id);
        }

        Commands::Open { path } => {
            let (vault, store) = open_store(&config)?;
            let opener = ProtectedOpener::new(store, vault, client(&config)?);
            let document = opener.open(&path)?;
            println!(
                "🔓 {} ({} bytes)",
                document.record.original_name,
                document.content.len()
            );
        }

        Commands::DeleteFile { id } => {
            let (_, store) = open_store(&config)?;
            store.delete_file_record(id)?;
            println!("🗑️ Document #{} deleted", id);
        }

        Commands::AddApp { exe, name, role } => {
            let (_, store) = open_store(&config)?;
            let name = name.unwrap_or_else(|| exe.clone());
            if store.add_app(&name, &exe, &role)? {
                println!("✅ {} is now protected", name);
            } else {
                println!("{} was already protected", exe);
            }
        }

        Commands::Enroll { name, role, template } => {
            let raw = std::fs::read_to_string(&template)
                .with_context(|| format!("reading {}", template.display()))?;
            let values: Vec<f32> = serde_json::from_str(&raw).context("template must be a JSON array of numbers")?;
            if values.is_empty() {
                bail!("template is empty");
            }

            let (_, store) = open_store(&config)?;
            let id = store.add_user(&name, &role, &FeatureVector::new(values))?;
            println!("✅ Enrolled {} ({}) as user #{}", name, role, id);
        }

        Commands::List => {
            let (_, store) = open_store(&config)?;

            println!("Protected applications:");
            for app in store.all_apps()? {
                let state = if app.is_active { "active" } else { "inactive" };
                println!("  #{} {} ({}) {}", app.id, app.name, app.exe, state);
            }

            println!("Enrolled users:");
            for user in store.users()? {
                println!("  #{} {} [{}]", user.id, user.name, user.role);
            }

            println!("Protected documents:");
            for file in store.files()? {
                println!("  #{} {} -> {}", file.id, file.original_name, file.enc_path.display());
            }
        }
    }

    Ok(())
}

fn init_logging(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "presence_dlp=info".into());

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(|| tracing_subscriber::fmt::layer()))
        .init();
}

fn open_store(config: &ServiceConfig) -> Result<(Arc<CryptoVault>, Arc<SqliteStore>)> {
    std::fs::create_dir_all(&config.data_dir)?;
    let protected = MachineBoundStore::new()?;
    let vault = Arc::new(CryptoVault::open(&config.master_key_path(), &protected)?);
    let store = Arc::new(SqliteStore::open(&config.db_path(), Arc::clone(&vault))?);
    Ok((vault, store))
}

fn client(config: &ServiceConfig) -> Result<GatewayClient> {
    let protected = MachineBoundStore::new()?;
    Ok(GatewayClient::from_config(config, &protected))
}
