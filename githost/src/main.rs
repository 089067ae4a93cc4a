use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{info, warn};

mod config;
mod database;
mod docker;
mod error;
mod git_ops;
mod hook;
mod http_server;
mod image;
mod labels;
mod lock;
mod name;
mod pipeline;
mod post_receive;
mod protocol;
mod relay;
mod repos;
mod store;
mod swap;
mod workspace;

use config::Config;
use database::Database;
use docker::DockerClient;
use git_ops::SystemGit;
use hook::DeployDecision;
use http_server::{run_http_server, AppState};
use image::TracingSink;
use labels::DeployLabels;
use pipeline::Pipeline;
use post_receive::HookContext;
use relay::Relay;
use repos::RepoService;
use store::{HookCommand, RepoStore};
use swap::SwapManager;

#[derive(Parser)]
#[command(name = "githost")]
#[command(about = "A smart HTTP git host that deploys pushed Dockerfiles")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Data directory holding repositories and the database
    #[arg(short, long)]
    data: Option<PathBuf>,

    /// HTTP port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the git server
    Serve,
    /// Git hooks installed into every repository
    Hook {
        #[command(subcommand)]
        hook: HookCommands,
    },
    /// Create a new repository
    CreateRepo {
        /// Name of the repository
        name: String,
        /// Description of the repository
        #[arg(long, default_value = "")]
        description: String,
    },
    /// List repositories
    ListRepos,
}

#[derive(Subcommand)]
enum HookCommands {
    /// Read ref updates from stdin and deploy the deploy branch
    PostReceive,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Logs go to stderr so hook output reaches the pushing client
    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()),
        )
        .init();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default_config(),
    };
    if let Some(data) = &cli.data {
        config.data_dir = data.clone();
    }
    if let Some(port) = cli.port {
        config.http_port = port;
    }
    std::fs::create_dir_all(&config.data_dir)?;
    config.data_dir = config.data_dir.canonicalize()?;

    match cli.command {
        Commands::Serve => serve(config, cli.config.as_deref()).await?,
        Commands::Hook {
            hook: HookCommands::PostReceive,
        } => post_receive(&config).await?,
        Commands::CreateRepo { name, description } => {
            let (repos, _, _) = services(&config, cli.config.as_deref()).await?;
            let repo = repos.create_repository(&name, &description).await?;
            info!(
                "Created repository '{}' (deploys {})",
                repo.name, repo.deploy_branch
            );
        }
        Commands::ListRepos => {
            let (repos, _, _) = services(&config, cli.config.as_deref()).await?;
            for repo in repos.list_repositories().await? {
                println!(
                    "{}\t{}\t{}",
                    repo.name,
                    repo.deploy_branch,
                    repo.latest_sha.as_deref().unwrap_or("-")
                );
            }
        }
    }

    Ok(())
}

/// Command the post-receive hook runs: this binary with the same data
/// directory and config file
fn hook_command(config: &Config, config_path: Option<&Path>) -> Result<HookCommand, std::io::Error> {
    let mut args = vec![
        "--data".to_string(),
        config.data_dir.to_string_lossy().into_owned(),
    ];
    if let Some(path) = config_path {
        args.push("--config".to_string());
        args.push(path.canonicalize()?.to_string_lossy().into_owned());
    }
    args.push("hook".to_string());
    args.push("post-receive".to_string());

    Ok(HookCommand {
        program: std::env::current_exe()?,
        args,
    })
}

async fn connect_database(config: &Config) -> Result<Database, sqlx::Error> {
    let db = Database::connect(&config.database_url()).await?;
    db.init().await?;
    Ok(db)
}

async fn services(
    config: &Config,
    config_path: Option<&Path>,
) -> Result<(RepoService, RepoStore, Database), Box<dyn std::error::Error>> {
    let store = RepoStore::open(
        &config.repos_path(),
        &config.deploy_branch,
        hook_command(config, config_path)?,
        Arc::new(SystemGit::new(&config.git_binary)),
    )?;
    let db = connect_database(config).await?;
    let repos = RepoService::new(db.clone(), store.clone(), &config.deploy_branch);
    Ok((repos, store, db))
}

async fn serve(config: Config, config_path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let (repos, store, db) = services(&config, config_path).await?;
    info!("Serving repositories from {}", store.root().display());

    let state = AppState {
        db,
        relay: Relay::new(&config.git_binary),
        config: Arc::new(config),
        store,
        repos,
    };

    run_http_server(state)
        .await
        .map_err(|e| -> Box<dyn std::error::Error> { e })?;
    Ok(())
}

async fn post_receive(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    // git runs hooks from inside the bare repository
    let repo_path = std::env::current_dir()?.canonicalize()?;

    let db = match connect_database(config).await {
        Ok(db) => Some(db),
        Err(e) => {
            warn!("Database unavailable, deployment will not be recorded: {}", e);
            None
        }
    };
    let ctx = HookContext::load(&repo_path, config, db).await?;

    let decision = ctx.listener().read_from(std::io::stdin().lock())?;
    let update = match decision {
        DeployDecision::Deploy(update) => update,
        DeployDecision::Skip(reason) => {
            info!(repo = %ctx.repo_name, ?reason, "nothing to deploy");
            return Ok(());
        }
    };

    let labels = DeployLabels::new(&config.label_prefix);
    let docker = Arc::new(DockerClient::new(labels.clone()));
    let pipeline = Pipeline::new(
        Arc::new(SystemGit::new(&config.git_binary)),
        docker.clone(),
        SwapManager::new(
            docker,
            labels,
            Duration::from_secs(config.stop_timeout_secs.max(0) as u64),
        ),
        Arc::new(TracingSink),
    );

    ctx.deploy(&pipeline, &update).await?;
    Ok(())
}
