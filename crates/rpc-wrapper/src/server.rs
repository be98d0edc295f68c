//! # RPC Server Side
//!
//! A Unix-socket listener serving the authenticated envelope. Every
//! request is verified before dispatch; a failed authenticator yields
//! `Unauthenticated` and never reaches the handler. Authentication
//! failures are fatal for the request, not for the connection.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::auth::check_validity;
use crate::envelope::{Request, Response, RpcStatus};
use crate::frame::{read_frame, write_frame};
use crate::{RequestPayload, RpcError};

/// The single dispatch point servers expose. Implementations match on
/// the payload variant and return the call status.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn handle(&self, payload: RequestPayload) -> Response;
}

/// Authenticated envelope server bound to one socket path.
pub struct RpcServer {
    path: PathBuf,
    secret: Vec<u8>,
}

impl RpcServer {
    #[must_use]
    pub fn new(path: impl AsRef<Path>, secret: Vec<u8>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            secret,
        }
    }

    /// The socket path this server binds.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept and serve connections until the shutdown signal flips.
    /// The caller owns the task handle; this future is the joinable
    /// completion handle for the listener.
    pub async fn serve(
        &self,
        handler: Arc<dyn RpcHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), RpcError> {
        // A stale socket file from an unclean shutdown blocks bind.
        let _ = std::fs::remove_file(&self.path);
        let listener = UnixListener::bind(&self.path)?;
        info!(path = %self.path.display(), "RPC server listening");

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => {
                            let handler = Arc::clone(&handler);
                            let secret = self.secret.clone();
                            let shutdown = shutdown.clone();
                            tokio::spawn(async move {
                                serve_connection(stream, secret, handler, shutdown).await;
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "Accept failed");
                        }
                    }
                }
            }
        }

        let _ = std::fs::remove_file(&self.path);
        info!(path = %self.path.display(), "RPC server stopped");
        Ok(())
    }
}

async fn serve_connection(
    mut stream: UnixStream,
    secret: Vec<u8>,
    handler: Arc<dyn RpcHandler>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let request: Option<Request> = tokio::select! {
            _ = shutdown.changed() => return,
            read = read_frame(&mut stream) => match read {
                Ok(r) => r,
                Err(e) => {
                    debug!(error = %e, "Dropping RPC connection");
                    return;
                }
            },
        };
        let Some(request) = request else {
            return; // peer closed
        };

        let response = if check_validity(&request, &secret) {
            handler.handle(request.payload).await
        } else {
            warn!("Rejecting request with invalid authenticator");
            Response {
                status: RpcStatus::Unauthenticated,
            }
        };

        if let Err(e) = write_frame(&mut stream, &response).await {
            debug!(error = %e, "Failed to write RPC response");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::generate_secret;
    use crate::client::RpcClientManager;
    use crate::envelope::{EnforcerExitPayload, UnEnforcePayload};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RpcHandler for CountingHandler {
        async fn handle(&self, payload: RequestPayload) -> Response {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match payload {
                RequestPayload::UnEnforce(_) => Response::success(),
                _ => Response::error("unexpected method"),
            }
        }
    }

    fn unenforce() -> RequestPayload {
        RequestPayload::UnEnforce(UnEnforcePayload {
            context_id: "svcA".to_string(),
        })
    }

    #[tokio::test]
    async fn test_valid_request_reaches_handler() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.sock");
        let secret = generate_secret();

        let handler = Arc::new(CountingHandler {
            calls: AtomicUsize::new(0),
        });
        let server = RpcServer::new(&path, secret.clone());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let served = {
            let handler = Arc::clone(&handler);
            tokio::spawn(async move { server.serve(handler, shutdown_rx).await })
        };

        let clients = RpcClientManager::new();
        clients.new_client_with_secret("svcA", &path, secret);
        let response = clients.remote_call("svcA", unenforce()).await.unwrap();
        assert!(response.is_success());
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);

        shutdown_tx.send(true).unwrap();
        served.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_bad_authenticator_never_reaches_handler() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.sock");

        let handler = Arc::new(CountingHandler {
            calls: AtomicUsize::new(0),
        });
        let server = RpcServer::new(&path, generate_secret());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let served = {
            let handler = Arc::clone(&handler);
            tokio::spawn(async move { server.serve(handler, shutdown_rx).await })
        };

        // Client keyed with a different secret.
        let clients = RpcClientManager::new();
        clients.new_client_with_secret("svcA", &path, generate_secret());
        let response = clients.remote_call("svcA", unenforce()).await.unwrap();
        assert_eq!(response.status, RpcStatus::Unauthenticated);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);

        // The channel survives the rejected request.
        let response = clients
            .remote_call(
                "svcA",
                RequestPayload::EnforcerExit(EnforcerExitPayload { pid: 1 }),
            )
            .await
            .unwrap();
        assert_eq!(response.status, RpcStatus::Unauthenticated);

        shutdown_tx.send(true).unwrap();
        served.await.unwrap().unwrap();
    }
}
