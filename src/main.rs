//! sessiongate - main entry point.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use sessiongate::api::{self, AppState};
use sessiongate::cluster::ClusterApi;
use sessiongate::cluster::http::HttpCluster;
use sessiongate::config::Config;
use sessiongate::lifecycle::LifecycleController;
use sessiongate::oauth::{OAuthFlow, ProviderRegistry, StatePayload, StateSigner};
use sessiongate::provision::IdentityProvisioner;
use sessiongate::resolver::ClientResolver;
use sessiongate::verify::TokenVerifier;

#[derive(Parser, Debug)]
#[command(name = "sessiongate")]
#[command(about = "Per-session credential issuance and verification for agent jobs")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP API (default)
    Serve,

    /// Sign an OAuth state token with OAUTH_STATE_SECRET
    SignState {
        #[arg(long, default_value = "google")]
        provider: String,
        #[arg(long)]
        project: String,
        #[arg(long)]
        session: String,
    },

    /// Verify an OAuth state token and print its payload
    VerifyState { token: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("sessiongate=info,tower_http=info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = Config::from_env()?;

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::SignState {
            provider,
            project,
            session,
        } => {
            let signer = state_signer(&config)?;
            let token = signer.sign(&StatePayload::new(&provider, &project, &session))?;
            println!("{token}");
            Ok(())
        }
        Command::VerifyState { token } => {
            let payload = state_signer(&config)?.verify(&token)?;
            println!("{}", serde_json::to_string_pretty(&payload)?);
            Ok(())
        }
    }
}

fn state_signer(config: &Config) -> anyhow::Result<StateSigner> {
    StateSigner::from_optional(config.oauth.state_secret.clone())
        .context("OAUTH_STATE_SECRET is not set")
}

async fn serve(config: Config) -> anyhow::Result<()> {
    tracing::info!("Starting sessiongate...");

    let platform = Arc::new(HttpCluster::from_config(&config.cluster)?);
    tracing::info!(api_url = %config.cluster.api_url, "Cluster client initialized");
    let platform_api: Arc<dyn ClusterApi> = platform.clone();

    let provisioner = Arc::new(IdentityProvisioner::new(
        Arc::clone(&platform_api),
        config.cluster.session_resource.clone(),
        config.provision.clone(),
    ));

    let providers = ProviderRegistry::from_config(&config.oauth);
    let state = AppState {
        resolver: Arc::new(ClientResolver::new(
            platform,
            Arc::clone(&platform_api),
            config.telemetry.clone(),
        )),
        verifier: Arc::new(TokenVerifier::new(Arc::clone(&platform_api))),
        lifecycle: Arc::new(LifecycleController::new(provisioner)),
        oauth: Arc::new(OAuthFlow::new(
            StateSigner::from_optional(config.oauth.state_secret.clone()),
            providers,
            platform_api,
        )),
    };

    let addr: SocketAddr = format!("{}:{}", config.api.host, config.api.port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", config.api.host, config.api.port))?;
    api::serve(state, addr).await?;
    Ok(())
}
