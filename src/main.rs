//! testhost - a test execution host
//!
//! Speaks the test session protocol (JSON-RPC over `Content-Length` frames)
//! with one client, serving discover and run requests from a TOML test
//! manifest.
//!
//! ## Transports
//!
//! **Default**: stdin/stdout. Logging always goes to stderr.
//!
//! **`--listen <path>`**: waits for one client on a Unix socket.
//!
//! **`--client-port <port>`**: connects to a client listening on TCP.

use clap::Parser as ClapParser;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use testhost::{
    config::{self, SessionConfig},
    engine::manifest::ManifestEngineFactory,
    error::SessionError,
    server::{self, Transport},
    ExitStatus, ProtocolSession,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// testhost - a test execution host
///
/// Serves test discovery and execution to an IDE or CLI client over the
/// test session protocol.
#[derive(ClapParser, Debug)]
#[command(name = "testhost", version, about, long_about = None)]
struct Cli {
    /// Test manifest (TOML) listing the tests this host can run
    #[arg(long, env = "TESTHOST_MANIFEST")]
    manifest: PathBuf,

    /// Session config file [default: $XDG_CONFIG_HOME/testhost/config.toml]
    #[arg(long, env = "TESTHOST_CONFIG")]
    config: Option<PathBuf>,

    /// Wait for a single client on this Unix domain socket
    #[arg(long, conflicts_with = "client_port")]
    listen: Option<PathBuf>,

    /// Connect to a client listening on this TCP port
    #[arg(long, env = "TESTHOST_CLIENT_PORT")]
    client_port: Option<u16>,

    /// Host of the listening client
    #[arg(long, default_value = "127.0.0.1")]
    client_host: IpAddr,

    /// Protocol version to advertise (overrides the config file)
    #[arg(long, env = "TESTHOST_PROTOCOL_VERSION")]
    protocol_version: Option<String>,
}

impl Cli {
    fn transport(&self) -> Transport {
        if let Some(path) = &self.listen {
            return Transport::Listen(path.clone());
        }
        match self.client_port {
            Some(port) => Transport::Connect(SocketAddr::new(self.client_host, port)),
            None => Transport::Stdio,
        }
    }

    fn session_config(&self) -> Result<SessionConfig, SessionError> {
        let path = self.config.clone().or_else(config::default_config_path);
        let mut config = match &path {
            Some(path) => SessionConfig::load(path)?.unwrap_or_default(),
            None => SessionConfig::default(),
        };
        if let Some(version) = &self.protocol_version {
            config.protocol_version = version.clone();
        }
        config.validate()?;
        Ok(config)
    }
}

// stdout may carry the protocol, so tracing always writes to stderr.
fn init_tracing_stderr() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "testhost=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        // --help and --version
        Err(e) if !e.use_stderr() => e.exit(),
        Err(e) => {
            let _ = e.print();
            std::process::exit(ExitStatus::GenericFailure.code());
        }
    };
    init_tracing_stderr();

    let status = match run(cli).await {
        Ok(status) => status,
        Err(e) => {
            tracing::error!("{}", e);
            eprintln!("testhost: {}", e);
            ExitStatus::GenericFailure
        }
    };
    // Runtime shutdown would wait on the blocking stdin read.
    std::process::exit(status.code());
}

async fn run(cli: Cli) -> Result<ExitStatus, SessionError> {
    let config = cli.session_config()?;
    let engines = ManifestEngineFactory::from_path(&cli.manifest)?;
    tracing::info!(
        manifest = %cli.manifest.display(),
        tests = engines.test_count(),
        protocol_version = %config.protocol_version,
        "testhost starting"
    );

    let process_cancel = CancellationToken::new();
    tokio::spawn(watch_signals(process_cancel.clone()));

    let transport = cli.transport();
    let Some(connection) = server::open(&transport, &process_cancel).await? else {
        tracing::info!("cancelled before a client connected");
        return Ok(ExitStatus::SessionAborted);
    };

    let session = ProtocolSession::new(config, Arc::new(engines), process_cancel);
    Ok(session.run(connection.channel).await)
}

/// Cancel the process token on Ctrl+C or SIGTERM.
async fn watch_signals(cancel: CancellationToken) {
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(?e, "could not install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("received Ctrl+C"),
        _ = terminate => tracing::info!("received SIGTERM"),
    }
    cancel.cancel();
}
