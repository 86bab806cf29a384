mod interceptors;
mod services;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use interceptors::cert;
use protobuf::jobs_server::JobsServer;
use services::jobservice::JobsService;
use tokio::signal::unix::{signal, SignalKind};
use tonic::transport::{Certificate, Identity, Server, ServerTlsConfig};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use worklib::Executor;

/// How long in-flight streams get to drain after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(
    name = "jobforged",
    about = "Runs and manages arbitrary Linux commands as sandboxed jobs over mTLS gRPC"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the gRPC server.
    Serve(ServeArgs),
    /// Finish sandbox setup inside the job namespaces and run a command.
    /// Only ever spawned by the executor through /proc/self/exe.
    #[command(hide = true)]
    Reexec(ReexecArgs),
}

#[derive(Args)]
struct ServeArgs {
    /// Address to listen on for incoming connections.
    #[arg(short = 'l', long, default_value = "[::]:6443")]
    listen: SocketAddr,
    /// Server certificate path (PEM).
    #[arg(short = 'c', long, default_value = "ssl/server.pem")]
    cert: PathBuf,
    /// Server private key path (PEM).
    #[arg(short = 'k', long, default_value = "ssl/server-key.pem")]
    key: PathBuf,
    /// Client CA certificate path (PEM).
    #[arg(short = 'r', long, default_value = "ssl/root.pem")]
    root_ca: PathBuf,
    /// Path to the cgroup v2 mount jobs are created under.
    #[arg(long, default_value = "/sys/fs/cgroup")]
    cgroup_root: PathBuf,
    /// Also place each job in its own network namespace.
    #[arg(long)]
    isolate_network: bool,
}

#[derive(Args)]
struct ReexecArgs {
    #[arg(long)]
    cgroup_root: PathBuf,
    /// Program and arguments, after `--`.
    #[arg(last = true, required = true)]
    command: Vec<String>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    match Cli::parse().command {
        // Must run before the async runtime spins up any threads: the
        // supervisor relies on per-thread state (PR_SET_PDEATHSIG) and has
        // to stay on this thread until the job is reaped.
        Command::Reexec(args) => {
            let code = worklib::reexec::run(&args.cgroup_root, &args.command);
            std::process::exit(code);
        }
        Command::Serve(args) => serve(args),
    }
}

#[tokio::main]
async fn serve(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cert = tokio::fs::read(&args.cert).await?;
    let key = tokio::fs::read(&args.key).await?;
    let client_ca = tokio::fs::read(&args.root_ca).await?;
    let tls = ServerTlsConfig::new()
        .identity(Identity::from_pem(cert, key))
        .client_ca_root(Certificate::from_pem(client_ca));

    let executor = Executor::new(&args.cgroup_root, args.isolate_network);
    let service = JobsService::new(executor.clone());

    info!(addr = %args.listen, cgroup_root = %args.cgroup_root.display(), "listening");

    Server::builder()
        .tls_config(tls)?
        .add_service(JobsServer::with_interceptor(
            service,
            cert::extract_common_name,
        ))
        .serve_with_shutdown(args.listen, shutdown_signal())
        .await?;

    // any jobs still running are stopped on the way out
    executor.shutdown();
    Ok(())
}

/// Resolves on SIGINT/SIGTERM. New RPCs stop being accepted immediately;
/// in-flight streams get [`SHUTDOWN_GRACE`] to drain before the process is
/// forced down.
async fn shutdown_signal() {
    let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
    info!("shutting down, draining in-flight streams");

    tokio::spawn(async {
        tokio::time::sleep(SHUTDOWN_GRACE).await;
        warn!("shutdown grace period expired, aborting");
        std::process::exit(1);
    });
}
