//! agentpay CLI entrypoint.
//!
//! Dispatches the subcommands the shell contract exposes (§6): `setup`,
//! `worker`, `client <name>`, `autonomous-worker`, `autonomous-client`,
//! `demo-feed`, `install-skill`. `setup` and `install-skill` are one-time
//! provisioning / host-runtime glue explicitly out of scope for the broker
//! core (§1) — they print a pointer to that external tooling. Every other
//! subcommand drives the library directly.
//!
//! Environment: `.env` values loaded at startup; see `Config` for the full
//! set of recognized variables.

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use agentpay::autonomous::{AcceptHandler, AutonomousLoop, OfferHandler, ParsedAccept, ParsedOffer, render_accept, render_offer};
use agentpay::config::{Config, Runtime};
use agentpay::error::AgentPayError;
use agentpay::feed::{DemoFeedClient, DemoFeedStore, FeedItem, demo_feed_routes};
use agentpay::hirer::Hirer;
use agentpay::sig_down::SigDown;
use agentpay::status::{FileStatusSink, NoopStatusSink, StatusSink};
use agentpay::types::{AgentName, PathPreference};
use agentpay::work::EchoWorkCollaborator;
use agentpay::worker::{WorkerApp, routes as worker_routes};

use async_trait::async_trait;
use axum::Router;
use axum::http::Method;
use clap::{Parser, Subcommand};
use tower_http::cors;
use tower_http::trace::TraceLayer;

#[derive(Parser, Debug)]
#[command(name = "agentpay", about = "Peer-to-peer agent payment broker")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// One-time wallet/name-service provisioning (external tooling; not implemented here).
    Setup,
    /// Runs the worker HTTP server implementing the 402 handshake.
    Worker,
    /// Hires `name` for one job and prints the result.
    Client {
        name: String,
        #[arg(long)]
        task_type: String,
        #[arg(long, default_value = "{}")]
        input: String,
        /// `channel` or `app_session`; defaults to `AGENTPAY_PAYMENT_METHOD`.
        #[arg(long)]
        path: Option<String>,
    },
    /// Runs the worker server plus a feed-polling loop that auto-accepts offers.
    AutonomousWorker,
    /// Posts one offer to the feed, then hires whoever accepts it.
    AutonomousClient {
        #[arg(long, default_value_t = 1)]
        price: u64,
        #[arg(long, default_value = "summarize")]
        task_type: String,
    },
    /// Runs the in-process demo feed server.
    DemoFeed,
    /// Skill-installation glue for a host agent runtime (external tooling; not implemented here).
    InstallSkill,
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

/// Maps an error to the CLI exit code table in §6: 0 success, 1 generic
/// failure, 2 configuration/identity error, 3 payment failure, 4
/// counterparty failure.
fn exit_code_for(err: &AgentPayError) -> u8 {
    match err {
        AgentPayError::ConfigInvalid(_) | AgentPayError::IdentityUnavailable(_) => 2,
        AgentPayError::ClearingAuthRejected(_)
        | AgentPayError::ClearingTimeout(_)
        | AgentPayError::ClearingProtocol(_)
        | AgentPayError::PaymentVerificationFailed(_)
        | AgentPayError::BillExpired { .. }
        | AgentPayError::OnChainFailed(_)
        | AgentPayError::QuorumPending => 3,
        AgentPayError::NameNotFound(_) | AgentPayError::RecordMissing { .. } => 4,
        AgentPayError::Cancelled
        | AgentPayError::Http(_)
        | AgentPayError::WebSocket(_)
        | AgentPayError::Json(_)
        | AgentPayError::Clock(_) => 1,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    rustls::crypto::CryptoProvider::install_default(rustls::crypto::ring::default_provider())
        .expect("failed to install rustls crypto provider");
    init_tracing();
    let cli = Cli::parse();

    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "configuration error");
            return ExitCode::from(2);
        }
    };
    let runtime = match Runtime::new(config) {
        Ok(r) => r,
        Err(e) => {
            tracing::error!(error = %e, "identity error");
            return ExitCode::from(2);
        }
    };

    let result = match cli.command {
        Command::Setup => {
            println!("setup is external provisioning glue (wallet + name-service registration); run the host tooling's `setup` command instead.");
            Ok(())
        }
        Command::InstallSkill => {
            println!("install-skill wires this broker into a host agent runtime's skill directory; run the host tooling's `install-skill` command instead.");
            Ok(())
        }
        Command::Worker => run_worker(runtime).await,
        Command::Client { name, task_type, input, path } => run_client(runtime, name, task_type, input, path).await,
        Command::AutonomousWorker => run_autonomous_worker(runtime).await,
        Command::AutonomousClient { price, task_type } => run_autonomous_client(runtime, price, task_type).await,
        Command::DemoFeed => run_demo_feed(runtime).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            ExitCode::from(exit_code_for(&e))
        }
    }
}

fn status_sink(runtime: &Runtime) -> Arc<dyn StatusSink> {
    match runtime.config.status_file.clone() {
        Some(path) => Arc::new(FileStatusSink::new(path)),
        None => Arc::new(NoopStatusSink),
    }
}

fn build_router(app: Arc<WorkerApp>) -> Router {
    worker_routes(app).layer(TraceLayer::new_for_http()).layer(
        cors::CorsLayer::new()
            .allow_origin(cors::Any)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers(cors::Any),
    )
}

async fn serve_worker(runtime: &Runtime, app: Arc<WorkerApp>) -> Result<(), AgentPayError> {
    let router = build_router(app);
    let addr = SocketAddr::new(runtime.config.host, runtime.config.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| AgentPayError::ConfigInvalid(format!("failed to bind {addr}: {e}")))?;

    let sig_down = SigDown::try_new().map_err(|e| AgentPayError::ConfigInvalid(e.to_string()))?;
    let cancellation = sig_down.cancellation_token();
    tracing::info!(%addr, address = %runtime.identity.address(), "worker server listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { cancellation.cancelled().await })
        .await
        .map_err(|e| AgentPayError::ConfigInvalid(e.to_string()))
}

async fn run_worker(runtime: Runtime) -> Result<(), AgentPayError> {
    let app = Arc::new(WorkerApp::new(runtime.clone(), Arc::new(EchoWorkCollaborator), status_sink(&runtime)));
    serve_worker(&runtime, app).await
}

async fn run_client(
    runtime: Runtime,
    worker_name: String,
    task_type: String,
    input: String,
    path: Option<String>,
) -> Result<(), AgentPayError> {
    let input_data: serde_json::Value = serde_json::from_str(&input)
        .map_err(|e| AgentPayError::ConfigInvalid(format!("--input is not valid JSON: {e}")))?;
    let path_preference = path
        .as_deref()
        .and_then(PathPreference::from_env_str)
        .or_else(|| runtime.config.payment_method())
        .unwrap_or(PathPreference::AppSession);

    let hirer = Hirer::new(runtime.clone(), runtime.config.resolver_url.clone());
    let result = hirer
        .hire(&AgentName(worker_name), &task_type, input_data, path_preference)
        .await?;
    println!("{}", serde_json::to_string_pretty(&result).unwrap_or_default());
    Ok(())
}

async fn run_demo_feed(runtime: Runtime) -> Result<(), AgentPayError> {
    let store = Arc::new(DemoFeedStore::new());
    let router = demo_feed_routes(store).layer(TraceLayer::new_for_http());
    let addr = SocketAddr::new(runtime.config.host, runtime.config.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| AgentPayError::ConfigInvalid(format!("failed to bind {addr}: {e}")))?;
    let sig_down = SigDown::try_new().map_err(|e| AgentPayError::ConfigInvalid(e.to_string()))?;
    let cancellation = sig_down.cancellation_token();
    tracing::info!(%addr, "demo feed listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { cancellation.cancelled().await })
        .await
        .map_err(|e| AgentPayError::ConfigInvalid(e.to_string()))
}

fn demo_feed_client(runtime: &Runtime) -> Result<Arc<DemoFeedClient>, AgentPayError> {
    let url = runtime
        .config
        .demo_feed_url
        .clone()
        .ok_or_else(|| AgentPayError::ConfigInvalid("AGENTPAY_DEMO_FEED_URL is required for autonomous commands".to_string()))?;
    Ok(Arc::new(DemoFeedClient::new(url)))
}

const POLL_INTERVAL: Duration = Duration::from_secs(3);

struct AutoAcceptHandler {
    runtime: Runtime,
    feed: Arc<DemoFeedClient>,
}

#[async_trait]
impl OfferHandler for AutoAcceptHandler {
    async fn on_offer(&self, offer: ParsedOffer, item: FeedItem) {
        tracing::info!(task_type = %offer.task_type, poster = %offer.poster_ens, item_id = %item.id, "offer seen, accepting");
        let accept = ParsedAccept {
            worker_ens: self.runtime.identity.name().to_string(),
        };
        if let Err(e) = self.feed.publish(render_accept(&accept)).await {
            tracing::warn!(error = %e, "failed to publish accept");
        }
    }
}

async fn run_autonomous_worker(runtime: Runtime) -> Result<(), AgentPayError> {
    let app = Arc::new(WorkerApp::new(runtime.clone(), Arc::new(EchoWorkCollaborator), status_sink(&runtime)));
    let router = build_router(app);
    let addr = SocketAddr::new(runtime.config.host, runtime.config.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| AgentPayError::ConfigInvalid(format!("failed to bind {addr}: {e}")))?;

    let sig_down = SigDown::try_new().map_err(|e| AgentPayError::ConfigInvalid(e.to_string()))?;
    let cancellation = sig_down.cancellation_token();

    let feed = demo_feed_client(&runtime)?;
    let auto_loop = AutonomousLoop::new(
        feed.clone(),
        Some(Arc::new(AutoAcceptHandler {
            runtime: runtime.clone(),
            feed,
        })),
        None,
        POLL_INTERVAL,
    );
    let loop_cancellation = cancellation.clone();
    let loop_handle = tokio::spawn(async move { auto_loop.run(loop_cancellation).await });

    tracing::info!(%addr, address = %runtime.identity.address(), "autonomous worker listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { cancellation.cancelled().await })
        .await
        .map_err(|e| AgentPayError::ConfigInvalid(e.to_string()))?;
    let _ = loop_handle.await;
    Ok(())
}

struct HireOnAccept {
    runtime: Runtime,
    task_type: String,
    input_data: serde_json::Value,
}

#[async_trait]
impl AcceptHandler for HireOnAccept {
    async fn on_accept(&self, accept: ParsedAccept, item: FeedItem) {
        tracing::info!(worker = %accept.worker_ens, item_id = %item.id, "accept seen, hiring");
        let hirer = Hirer::new(self.runtime.clone(), self.runtime.config.resolver_url.clone());
        let path_preference = self.runtime.config.payment_method().unwrap_or(PathPreference::AppSession);
        match hirer
            .hire(
                &AgentName(accept.worker_ens.clone()),
                &self.task_type,
                self.input_data.clone(),
                path_preference,
            )
            .await
        {
            Ok(result) => tracing::info!(result = %result, worker = %accept.worker_ens, "hire completed"),
            Err(e) => tracing::error!(error = %e, worker = %accept.worker_ens, "hire failed"),
        }
    }
}

async fn run_autonomous_client(runtime: Runtime, price: u64, task_type: String) -> Result<(), AgentPayError> {
    let feed = demo_feed_client(&runtime)?;

    let offer = ParsedOffer {
        price,
        task_type: task_type.clone(),
        poster_ens: runtime.identity.name().to_string(),
    };
    feed.publish(render_offer(&offer)).await?;
    tracing::info!(price, %task_type, "offer posted, waiting for an accept");

    let sig_down = SigDown::try_new().map_err(|e| AgentPayError::ConfigInvalid(e.to_string()))?;
    let cancellation = sig_down.cancellation_token();
    let auto_loop = AutonomousLoop::new(
        feed,
        None,
        Some(Arc::new(HireOnAccept {
            runtime: runtime.clone(),
            task_type,
            input_data: serde_json::json!({}),
        })),
        POLL_INTERVAL,
    );
    auto_loop.run(cancellation).await;
    Ok(())
}
