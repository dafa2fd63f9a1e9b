use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use trustprobe_harness::{
    image_id_body, Platform, ProbeOutcome, ProbeSpec, Prober, RegistryClient, TestCertificates,
    TrustScenario, TrustServer, TrustServerConfig, TESTIMAGE,
};

mod config;

use config::{HarnessConfig, ResolvedConfig};

/// trustprobe - reachability and transport-trust checks
#[derive(Parser, Debug)]
#[command(name = "trustprobe")]
#[command(about = "Probe port-forwarded services and check client transport trust")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "trustprobe.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Poll http://<host>:<port>/testimage-id with backoff
    Probe {
        /// Port the forwarded service listens on
        #[arg(short, long)]
        port: u16,

        /// Host to connect to (overrides config)
        #[arg(long)]
        host: Option<String>,

        /// Expect the service to be torn down
        #[arg(long)]
        expect_failure: bool,

        /// Exact body, or error substring with --expect-failure
        /// (default: the test image id for success, empty for failure)
        #[arg(long)]
        expected: Option<String>,
    },

    /// Run a trust server until interrupted
    Serve {
        /// Listen address (overrides config)
        #[arg(long)]
        bind: Option<String>,

        /// Certificate PEM file (enables TLS together with --key)
        #[arg(long, requires = "key")]
        cert: Option<String>,

        /// Private key PEM file
        #[arg(long, requires = "cert")]
        key: Option<String>,

        /// Body to answer every request with (default "Hello")
        #[arg(long)]
        body: Option<String>,
    },

    /// Check that the built-in registry client refuses an untrusted server
    TrustCheck {
        #[arg(long, value_enum, default_value_t = TrustMode::Plaintext)]
        mode: TrustMode,

        /// Common name of the generated certificate
        #[arg(long, default_value = "test.podman.io")]
        cert_name: String,

        /// CA bundle the client trusts; it did not sign the generated certificate
        #[arg(long)]
        ca: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum TrustMode {
    /// Server speaks plain HTTP
    Plaintext,
    /// Server presents a self-signed certificate
    Untrusted,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install crypto provider before any TLS operations
    trustprobe_common::install_crypto_provider();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("trustprobe=info".parse()?)
                .add_directive("trustprobe_harness=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    let config = HarnessConfig::load_and_resolve(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config))?;

    match cli.command {
        Commands::Probe {
            port,
            host,
            expect_failure,
            expected,
        } => run_probe(&config, port, host, expect_failure, expected).await,
        Commands::Serve {
            bind,
            cert,
            key,
            body,
        } => run_serve(config, bind, cert, key, body).await,
        Commands::TrustCheck {
            mode,
            cert_name,
            ca,
        } => run_trust_check(&config, mode, &cert_name, ca).await,
    }
}

async fn run_probe(
    config: &ResolvedConfig,
    port: u16,
    host: Option<String>,
    expect_failure: bool,
    expected: Option<String>,
) -> Result<()> {
    let host = host.unwrap_or_else(|| config.probe_host.clone());
    let spec = if expect_failure {
        ProbeSpec::unreachable(port, expected.unwrap_or_default())
    } else {
        ProbeSpec::reachable(port, expected.unwrap_or_else(|| image_id_body(TESTIMAGE)))
    }
    .with_host(host);

    tracing::info!(
        "Probing {} (up to {} attempts, {:?} total backoff)",
        spec.url(),
        config.schedule.max_attempts(),
        config.schedule.total_wait()
    );

    let prober = Prober::new(config.schedule, config.request_timeout)
        .context("Failed to build probe client")?;
    let report = prober.probe(&spec).await.context("Probe failed")?;

    match report.outcome {
        ProbeOutcome::Reachable { body } => {
            println!("reachable after {} attempt(s), body {:?}", report.attempts, body)
        }
        ProbeOutcome::Unreachable { error } => {
            println!("unreachable as expected after {} attempt(s): {}", report.attempts, error)
        }
    }
    Ok(())
}

async fn run_serve(
    config: ResolvedConfig,
    bind: Option<String>,
    cert: Option<String>,
    key: Option<String>,
    body: Option<String>,
) -> Result<()> {
    let bind_addr = match bind {
        Some(bind) => bind
            .parse()
            .with_context(|| format!("Invalid bind address: {}", bind))?,
        None => config.bind_addr,
    };
    let tls = match (cert, key) {
        (Some(cert_path), Some(key_path)) => {
            Some(trustprobe_harness::TlsMaterial::files(cert_path, key_path))
        }
        _ => config.tls,
    };

    let mut server_config = TrustServerConfig::plaintext().with_bind_addr(bind_addr);
    server_config.tls = tls;
    if let Some(body) = body {
        server_config = server_config.with_response_body(body);
    }
    let (mut server, completion) = TrustServer::start(server_config)
        .await
        .context("Failed to start trust server")?;

    let scheme = if server.is_tls() { "https" } else { "http" };
    println!("{}://{}", scheme, server.addr());

    let wait = completion.wait();
    tokio::pin!(wait);

    let result = tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("Shutting down...");
            server.stop();
            wait.await
        }
        result = &mut wait => result,
    };
    result.context("Trust server terminated abnormally")?;

    let paths = server.recorded_paths();
    println!("{} request(s) served", paths.len());
    for path in paths {
        println!("  {}", path);
    }
    Ok(())
}

async fn run_trust_check(
    config: &ResolvedConfig,
    mode: TrustMode,
    cert_name: &str,
    ca: Option<PathBuf>,
) -> Result<()> {
    // The built-in client verifies with rustls, which words errors like the non-Darwin verifier
    let platform = Platform::Other;
    let client = match &ca {
        Some(ca_path) => RegistryClient::trusting_file(ca_path, config.client_timeout),
        None => RegistryClient::untrusting(config.client_timeout),
    }
    .context("Failed to build registry client")?;

    // Keeps the generated certificate files alive for the run
    let cert_dir = tempfile::tempdir().context("Failed to create certificate directory")?;

    let scenario = match mode {
        TrustMode::Plaintext => TrustScenario::plaintext(platform),
        TrustMode::Untrusted => {
            let certs = TestCertificates::self_signed(cert_name)
                .context("Failed to generate certificate")?;
            let material = certs
                .write_to(cert_dir.path())
                .context("Failed to write certificate")?;
            TrustScenario::untrusted(material, cert_name, platform)
        }
    };

    let report = scenario.run(&client).await.context("Trust check failed")?;
    println!("client rejected {} as expected:", report.registry);
    print!("{}", report.stderr);
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
