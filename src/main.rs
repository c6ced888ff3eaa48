//! nginx-ingress-operator: Kubernetes operator for ingress-nginx controllers.
//!
//! Runs the NginxIngressController controller and the health probe server
//! side by side in one binary.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use kube::runtime::events::Reporter;
use kube::Client;
use tracing::info;
use warp::Filter;

use nginx_ingress_operator::cluster::{KubeCluster, FIELD_MANAGER};
use nginx_ingress_operator::controller::nginx_ingress_controller::{self, Context};
use nginx_ingress_operator::helpers::{
    OperatorDefaults, DEFAULT_IMAGE_REPOSITORY, DEFAULT_IMAGE_TAG, DEFAULT_INGRESS_CLASS,
};
use nginx_ingress_operator::retry::RetryPolicy;

#[derive(Parser, Debug)]
#[command(
    name = "nginx-ingress-operator",
    about = "Kubernetes operator for ingress-nginx controllers"
)]
struct Args {
    /// Controller image repository when spec.image.repository is not set.
    #[arg(long, default_value = DEFAULT_IMAGE_REPOSITORY, env = "DEFAULT_IMAGE_REPOSITORY")]
    default_image_repository: String,

    /// Controller image tag when spec.image.tag is not set.
    #[arg(long, default_value = DEFAULT_IMAGE_TAG, env = "DEFAULT_IMAGE_TAG")]
    default_image_tag: String,

    /// Ingress class when spec.ingressClass is not set.
    #[arg(long, default_value = DEFAULT_INGRESS_CLASS, env = "DEFAULT_INGRESS_CLASS")]
    default_ingress_class: String,

    /// Maximum number of instances reconciled at the same time.
    #[arg(long, default_value = "4", env = "CONCURRENCY")]
    concurrency: u16,

    /// Attempts per read-modify-write cycle on the shared ClusterRoleBinding.
    #[arg(long, default_value = "10", env = "CONFLICT_RETRIES")]
    conflict_retries: u32,

    /// Base backoff between conflict retries, in milliseconds.
    #[arg(long, default_value = "50", env = "CONFLICT_BACKOFF_MS")]
    conflict_backoff_ms: u64,

    /// Upper bound on a single reconcile pass, in seconds.
    #[arg(long, default_value = "60", env = "RECONCILE_TIMEOUT_SECS")]
    reconcile_timeout_secs: u64,

    /// Bind address for health probe endpoints (/healthz, /readyz).
    #[arg(long, default_value = ":8081", env = "HEALTH_PROBE_BIND_ADDRESS")]
    health_probe_bind_address: String,

    /// Log format: "text" for human-readable, "json" for structured.
    #[arg(long, default_value = "text", env = "LOG_FORMAT")]
    log_format: String,
}

/// Accept ":8081" as shorthand for "0.0.0.0:8081".
fn parse_bind_address(raw: &str) -> anyhow::Result<SocketAddr> {
    raw.strip_prefix(':')
        .map(|port| format!("0.0.0.0:{port}"))
        .unwrap_or_else(|| raw.to_string())
        .parse()
        .with_context(|| format!("invalid --health-probe-bind-address {raw:?}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,kube=warn,hyper=warn,tower=warn,warp=warn".into());

    if args.log_format == "json" {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let health_addr = parse_bind_address(&args.health_probe_bind_address)?;
    let client = Client::try_default().await?;

    info!(
        image = %args.default_image_repository,
        tag = %args.default_image_tag,
        class = %args.default_ingress_class,
        concurrency = args.concurrency,
        "starting nginx-ingress-operator"
    );

    let reporter = Reporter {
        controller: FIELD_MANAGER.into(),
        instance: std::env::var("POD_NAME").ok(),
    };
    let ctx = Arc::new(Context {
        cluster: KubeCluster::new(client, reporter),
        defaults: OperatorDefaults {
            image_repository: args.default_image_repository,
            image_tag: args.default_image_tag,
            ingress_class: args.default_ingress_class,
        },
        retry: RetryPolicy {
            attempts: args.conflict_retries,
            backoff: Duration::from_millis(args.conflict_backoff_ms),
        },
        reconcile_timeout: Duration::from_secs(args.reconcile_timeout_secs),
    });

    let healthz = warp::get()
        .and(warp::path("healthz"))
        .and(warp::path::end())
        .map(|| warp::reply::with_status("ok", warp::http::StatusCode::OK));
    let readyz = warp::get()
        .and(warp::path("readyz"))
        .and(warp::path::end())
        .map(|| warp::reply::with_status("ok", warp::http::StatusCode::OK));
    let health_routes = healthz.or(readyz);

    tokio::select! {
        _ = nginx_ingress_controller::run(ctx, args.concurrency) => {
            info!("controller stopped, shutting down");
        },
        _ = warp::serve(health_routes).run(health_addr) => {},
    }

    Ok(())
}
