//! Interactive OAuth sign-in for providers that accept user tokens.
//!
//! Usage:
//!   infergate-oauth gemini-oauth --client-id <id> [--client-secret <secret>]
//!   infergate-oauth qwen-oauth --client-id <id>
//!
//! Credentials land in `~/.infergate/config.yaml` unless `--config` says otherwise.
//! Exit codes: 0 success, 1 authorization error, 2 timeout, 3 persistence error.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use secrecy::SecretString;
use tracing_subscriber::EnvFilter;

use infergate::auth::oauth::pkce::{DEFAULT_CALLBACK_TIMEOUT, open_browser};
use infergate::auth::{CredentialStore, DeviceFlow, OAuthEndpoints, PkceFlow, TokenResponse};
use infergate::config::ProviderType;
use infergate::context::RequestContext;
use infergate::error::LlmError;
use infergate::http::{HttpClient, HttpConfig};

#[derive(Parser, Debug)]
#[command(name = "infergate-oauth")]
#[command(about = "Sign in to an inference provider and store the OAuth credential", long_about = None)]
struct Cli {
    /// Config file to write (defaults to ~/.infergate/config.yaml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Credential id inside the provider section
    #[arg(long, global = true, default_value = "default")]
    id: String,

    /// Do not try to launch a browser
    #[arg(long, global = true)]
    no_browser: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Authorization-code flow with PKCE and a loopback callback
    GeminiOauth(GeminiArgs),
    /// Device-code flow
    QwenOauth(QwenArgs),
}

#[derive(Args, Debug)]
struct GeminiArgs {
    #[arg(long, env = "INFERGATE_GEMINI_CLIENT_ID")]
    client_id: String,

    #[arg(long, env = "INFERGATE_GEMINI_CLIENT_SECRET")]
    client_secret: Option<String>,

    /// Provider section to store the credential under
    #[arg(long, default_value = "gemini")]
    provider_key: String,

    /// Seconds to wait for the browser redirect
    #[arg(long, default_value_t = DEFAULT_CALLBACK_TIMEOUT.as_secs())]
    timeout: u64,
}

#[derive(Args, Debug)]
struct QwenArgs {
    #[arg(long, env = "INFERGATE_QWEN_CLIENT_ID")]
    client_id: String,

    #[arg(long, default_value = "qwen")]
    provider_key: String,
}

/// Which step failed decides the exit code.
enum Failure {
    Auth(LlmError),
    Persist(LlmError),
}

impl Failure {
    fn exit_code(&self) -> u8 {
        match self {
            Self::Auth(e) if matches!(e.root(), LlmError::TimeoutError(_)) => 2,
            Self::Auth(_) => 1,
            Self::Persist(_) => 3,
        }
    }

    fn error(&self) -> &LlmError {
        match self {
            Self::Auth(e) | Self::Persist(e) => e,
        }
    }
}

fn announce(url: &str, user_code: Option<&str>, no_browser: bool) {
    println!("Open this URL to authorize:\n\n  {url}\n");
    if let Some(code) = user_code {
        println!("Enter code: {code}\n");
    }
    if !no_browser && let Err(e) = open_browser(url) {
        tracing::warn!(target: "infergate::auth", error = %e, "could not open a browser");
    }
}

async fn gemini(cli: &Cli, args: &GeminiArgs, ctx: &RequestContext) -> Result<TokenResponse, LlmError> {
    let endpoints = OAuthEndpoints::gemini(
        &args.client_id,
        args.client_secret.clone().map(SecretString::from),
    );
    let http = HttpClient::new("gemini-oauth", HttpConfig::default())?;
    let flow = PkceFlow::new(&http, &endpoints);
    let pending = flow.prepare().await?;
    announce(&pending.url, None, cli.no_browser);
    println!("Waiting for the redirect on {} ...", pending.redirect_uri);
    flow.complete(ctx, pending, Duration::from_secs(args.timeout))
        .await
}

async fn qwen(cli: &Cli, args: &QwenArgs, ctx: &RequestContext) -> Result<TokenResponse, LlmError> {
    let endpoints = OAuthEndpoints::qwen(&args.client_id);
    let http = HttpClient::new("qwen-oauth", HttpConfig::default())?;
    let flow = DeviceFlow::new(&http, &endpoints);
    let auth = flow.request_code(ctx).await?;
    announce(auth.display_uri(), Some(&auth.user_code), cli.no_browser);
    println!("Waiting for approval ...");
    flow.poll(ctx, &auth).await
}

async fn run(cli: Cli, ctx: RequestContext) -> Result<PathBuf, Failure> {
    let store = match &cli.config {
        Some(path) => CredentialStore::new(path.clone()),
        None => CredentialStore::default_location().map_err(Failure::Persist)?,
    };

    let (provider_key, provider_type, client_id, client_secret, token) = match &cli.command {
        Command::GeminiOauth(args) => {
            let token = gemini(&cli, args, &ctx).await.map_err(Failure::Auth)?;
            (
                args.provider_key.clone(),
                ProviderType::Gemini,
                args.client_id.clone(),
                args.client_secret.clone().map(SecretString::from),
                token,
            )
        }
        Command::QwenOauth(args) => {
            let token = qwen(&cli, args, &ctx).await.map_err(Failure::Auth)?;
            (
                args.provider_key.clone(),
                ProviderType::Qwen,
                args.client_id.clone(),
                None,
                token,
            )
        }
    };

    let previous = store
        .credentials(&provider_key)
        .map_err(Failure::Persist)?
        .into_iter()
        .find(|c| c.id == cli.id);
    let credential =
        token.into_credential(&cli.id, client_id, client_secret, previous.as_ref(), Utc::now());
    store
        .save_credential(&provider_key, &provider_type, &credential)
        .map_err(Failure::Persist)?;
    Ok(store.path().to_path_buf())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let ctx = RequestContext::new();
    let interrupt = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    match run(cli, ctx).await {
        Ok(path) => {
            println!("Credential saved to {}", path.display());
            ExitCode::SUCCESS
        }
        Err(failure) => {
            eprintln!("error: {}", failure.error());
            ExitCode::from(failure.exit_code())
        }
    }
}
