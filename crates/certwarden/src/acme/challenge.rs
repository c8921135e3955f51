//! HTTP-01 ACME challenge management
//!
//! Pending challenges are answered by [`ChallengeServer`], which listens on
//! the address nginx forwards `/.well-known/acme-challenge/` to:
//!
//! ```nginx
//! location /.well-known/acme-challenge/ {
//!     proxy_pass http://127.0.0.1:5001;
//! }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// HTTP-01 challenge path prefix
pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// Timeout for serving a single connection
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Manages pending ACME HTTP-01 challenges
///
/// Clones share the same set of challenges.
#[derive(Debug, Clone, Default)]
pub struct ChallengeManager {
    /// Map of challenge token -> key authorization response
    challenges: Arc<DashMap<String, String>>,
}

impl ChallengeManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending challenge
    pub fn add_challenge(&self, token: &str, key_authorization: &str) {
        debug!(token = %token, "Registering ACME HTTP-01 challenge");
        self.challenges
            .insert(token.to_string(), key_authorization.to_string());
    }

    /// Remove a completed or abandoned challenge
    pub fn remove_challenge(&self, token: &str) {
        if self.challenges.remove(token).is_some() {
            debug!(token = %token, "Removed ACME challenge");
        }
    }

    /// Get the key authorization response for a challenge token
    pub fn get_response(&self, token: &str) -> Option<String> {
        let result = self.challenges.get(token).map(|v| v.clone());
        trace!(token = %token, found = result.is_some(), "ACME challenge lookup");
        result
    }

    /// Extract the token from a challenge request path
    pub fn extract_token(path: &str) -> Option<&str> {
        path.strip_prefix(ACME_CHALLENGE_PREFIX)
    }

    /// Get the number of pending challenges
    pub fn pending_count(&self) -> usize {
        self.challenges.len()
    }
}

/// Answers HTTP-01 validation requests from a [`ChallengeManager`]
#[derive(Debug)]
pub struct ChallengeServer {
    listener: TcpListener,
    challenges: ChallengeManager,
}

impl ChallengeServer {
    /// Bind the challenge listener
    pub async fn bind(addr: SocketAddr, challenges: ChallengeManager) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "HTTP-01 challenge server listening");
        Ok(Self {
            listener,
            challenges,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve requests in a background task until the handle is aborted
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.serve())
    }

    async fn serve(self) {
        loop {
            let (stream, remote_addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Error accepting challenge connection");
                    continue;
                }
            };

            let challenges = self.challenges.clone();
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req| {
                    let challenges = challenges.clone();
                    async move { Ok::<_, hyper::Error>(handle_request(&req, &challenges)) }
                });

                match tokio::time::timeout(
                    CONNECTION_TIMEOUT,
                    http1::Builder::new().serve_connection(io, service),
                )
                .await
                {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => debug!(remote = %remote_addr, error = %e, "Challenge connection error"),
                    Err(_) => debug!(remote = %remote_addr, "Challenge connection timed out"),
                }
            });
        }
    }
}

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

/// Answer a single request
fn handle_request<B>(req: &Request<B>, challenges: &ChallengeManager) -> Response<Full<Bytes>> {
    if req.method() != Method::GET {
        return text_response(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed");
    }

    let Some(token) = ChallengeManager::extract_token(req.uri().path()) else {
        return text_response(StatusCode::NOT_FOUND, "Not found");
    };

    match challenges.get_response(token) {
        Some(key_authorization) => {
            info!(token = %token, "Serving ACME challenge response");
            text_response(StatusCode::OK, key_authorization)
        }
        None => {
            warn!(token = %token, "Unknown ACME challenge token");
            text_response(StatusCode::NOT_FOUND, "Challenge not found")
        }
    }
}
