use kube::Client;
use tokio::signal;
use tracing::{error, info, warn};

use index_verifier::{Verifier, VerifierConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Install the TLS crypto provider before any TLS operations
    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
        && rustls::crypto::CryptoProvider::get_default().is_none()
    {
        return Err("Failed to install rustls crypto provider and no provider is available".into());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("index_verifier=info".parse()?)
                .add_directive("kube=info".parse()?),
        )
        .init();

    let config = VerifierConfig::from_env()?;
    info!(
        namespace = %config.storage.namespace,
        service = %config.storage.service_name,
        prefix = %config.index_prefix,
        expect_present = config.expect_present,
        secure = config.storage.secure,
        "Starting index verification"
    );

    let client = Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    let verifier =
        Verifier::from_client(client).with_tunnel_setup_timeout(config.tunnel_setup_timeout);
    let spec = config.poll_spec(config.expect_present)?;

    tokio::select! {
        result = verifier.index_with_prefix_exists(&config.storage, &config.index_prefix, &spec) => {
            match result {
                Ok(()) => {
                    info!("Verification passed");
                    Ok(())
                }
                Err(e) => {
                    error!(error = %e, "Verification failed");
                    Err(e.into())
                }
            }
        }
        _ = shutdown_signal() => {
            warn!("Received shutdown signal, abandoning verification");
            Err("interrupted".into())
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
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
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
