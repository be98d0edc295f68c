//! # RPC Client Side
//!
//! Channels keyed by an opaque string (the PU context id, or a fixed key
//! for singleton endpoints like the monitor). Each channel owns its
//! socket path, its rotated secret and a lazily established connection.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use cache::Cache;
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::auth::{generate_secret, signed_request};
use crate::envelope::{RequestPayload, Response, RpcStatus};
use crate::frame::{read_frame, write_frame};
use crate::{RpcError, DEFAULT_CALL_TIMEOUT_SECS};

/// Connection attempts before giving up on a freshly launched peer.
const MAX_CONNECT_ATTEMPTS: u32 = 10;

/// Base delay between connection attempts; grows linearly.
const CONNECT_RETRY_BASE: Duration = Duration::from_millis(50);

/// One authenticated channel to a Unix socket peer.
pub struct RpcChannel {
    path: PathBuf,
    secret: Vec<u8>,
    stream: Mutex<Option<UnixStream>>,
}

impl RpcChannel {
    fn new(path: PathBuf, secret: Vec<u8>) -> Self {
        Self {
            path,
            secret,
            stream: Mutex::new(None),
        }
    }

    /// The channel's shared secret, for handing to the serving side.
    #[must_use]
    pub fn secret(&self) -> Vec<u8> {
        self.secret.clone()
    }

    /// Issue one call and await its response. The connection is
    /// established on first use; a child that has not bound its socket
    /// yet is retried with a short backoff.
    pub async fn call(&self, payload: RequestPayload) -> Result<Response, RpcError> {
        let request = signed_request(payload, &self.secret)?;
        let mut guard = self.stream.lock().await;

        if let Some(stream) = guard.as_mut() {
            match Self::exchange(stream, &request).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    debug!(path = %self.path.display(), error = %e, "Reconnecting RPC channel");
                    *guard = None;
                }
            }
        }

        // Fresh connection, single attempt; covers first use and a peer
        // that restarted between calls.
        let mut stream = self.connect().await?;
        let response = Self::exchange(&mut stream, &request).await?;
        *guard = Some(stream);
        Ok(response)
    }

    async fn exchange(
        stream: &mut UnixStream,
        request: &crate::envelope::Request,
    ) -> Result<Response, RpcError> {
        write_frame(stream, request).await?;
        read_frame(stream)
            .await?
            .ok_or_else(|| RpcError::Transport("peer closed before responding".to_string()))
    }

    async fn connect(&self) -> Result<UnixStream, RpcError> {
        let mut last_err = None;
        for attempt in 0..MAX_CONNECT_ATTEMPTS {
            match UnixStream::connect(&self.path).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    last_err = Some(e);
                    tokio::time::sleep(CONNECT_RETRY_BASE * (attempt + 1)).await;
                }
            }
        }
        Err(RpcError::Transport(format!(
            "cannot connect to {}: {}",
            self.path.display(),
            last_err.map_or_else(|| "unknown".to_string(), |e| e.to_string())
        )))
    }
}

/// Registry of channels plus the call deadline applied to each request.
pub struct RpcClientManager {
    channels: Cache<String, Arc<RpcChannel>>,
    call_timeout: Duration,
}

impl RpcClientManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            channels: Cache::new(),
            call_timeout: Duration::from_secs(DEFAULT_CALL_TIMEOUT_SECS),
        }
    }

    #[must_use]
    pub fn with_timeout(call_timeout: Duration) -> Self {
        Self {
            channels: Cache::new(),
            call_timeout,
        }
    }

    /// Register a channel with a freshly rotated secret. Replaces any
    /// previous channel under the same key.
    pub fn new_client(&self, key: &str, path: impl AsRef<Path>) -> Vec<u8> {
        let secret = generate_secret();
        self.new_client_with_secret(key, path, secret.clone());
        secret
    }

    /// Register a channel joining an existing secret (launcher, stats).
    pub fn new_client_with_secret(&self, key: &str, path: impl AsRef<Path>, secret: Vec<u8>) {
        let channel = Arc::new(RpcChannel::new(path.as_ref().to_path_buf(), secret));
        self.channels.add_or_update(key.to_string(), channel);
    }

    /// The shared secret of a registered channel.
    pub fn secret_of(&self, key: &str) -> Result<Vec<u8>, RpcError> {
        self.channels
            .get(&key.to_string())
            .map(|c| c.secret())
            .map_err(|_| RpcError::NoSuchClient(key.to_string()))
    }

    /// Whether a channel is registered under `key`.
    #[must_use]
    pub fn has_client(&self, key: &str) -> bool {
        self.channels.get(&key.to_string()).is_ok()
    }

    /// Issue a call on the channel registered under `key`, enforcing the
    /// manager's deadline. A timeout surfaces as `RpcError::Timeout`,
    /// which callers map to their `Unavailable` kind.
    pub async fn remote_call(
        &self,
        key: &str,
        payload: RequestPayload,
    ) -> Result<Response, RpcError> {
        let channel = self
            .channels
            .get(&key.to_string())
            .map_err(|_| RpcError::NoSuchClient(key.to_string()))?;
        match tokio::time::timeout(self.call_timeout, channel.call(payload)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(key, "RPC call exceeded deadline");
                Err(RpcError::Timeout)
            }
        }
    }

    /// Like `remote_call` but folds a non-success status into an error.
    pub async fn remote_call_checked(
        &self,
        key: &str,
        payload: RequestPayload,
    ) -> Result<(), RpcError> {
        let response = self.remote_call(key, payload).await?;
        match response.status {
            RpcStatus::Success => Ok(()),
            RpcStatus::Unauthenticated => Err(RpcError::Unauthenticated),
            RpcStatus::Error(message) => Err(RpcError::Remote(message)),
        }
    }

    /// Drop the channel registered under `key`. Unknown keys are fine.
    pub fn destroy_client(&self, key: &str) {
        let _ = self.channels.remove(&key.to_string());
    }
}

impl Default for RpcClientManager {
    fn default() -> Self {
        Self::new()
    }
}
