//! TCP listener and accept loop
//!
//! Each accepted stream gets its own task that runs the handshake and then
//! the read loop. Handshake failures only end that one task.

use std::future::Future;
use std::io;
use tokio::net::TcpListener;

use crate::config::{Config, RelayConfig};
use crate::relay::Relay;

/// Bind the listener described by `config.server`
pub async fn bind(config: &Config) -> io::Result<TcpListener> {
    let addr = config.server.bind_addr();
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("wsrelay listening on {}", listener.local_addr()?);
    Ok(listener)
}

/// Accept connections until `shutdown` resolves, then close every peer
pub async fn serve<F>(listener: TcpListener, config: RelayConfig, shutdown: F) -> io::Result<()>
where
    F: Future<Output = ()>,
{
    let (relay, dispatcher) = Relay::start(config);
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!(error = %e, "Accept failed");
                        continue;
                    }
                };

                if let Err(e) = stream.set_nodelay(true) {
                    tracing::debug!(peer = %peer_addr, error = %e, "Failed to set TCP_NODELAY");
                }

                let relay = relay.clone();
                tokio::spawn(async move {
                    match relay.on_connect(stream).await {
                        Ok(handle) => {
                            tracing::debug!(
                                connection_id = %handle.id(),
                                peer = %peer_addr,
                                "Handshake complete"
                            );
                            relay.run(handle).await;
                        }
                        Err(e) => {
                            tracing::warn!(peer = %peer_addr, error = %e, "Handshake failed");
                        }
                    }
                });
            }
            _ = &mut shutdown => {
                tracing::info!("Shutdown requested");
                break;
            }
        }
    }

    drop(listener);
    relay.shutdown().await;

    // The dispatcher ends once the reader tasks drop their relay clones
    drop(relay);
    dispatcher.abort();

    tracing::info!("wsrelay shut down gracefully");
    Ok(())
}

/// Resolves on Ctrl-C or, on unix, SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
