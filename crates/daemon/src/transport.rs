// tunnelkeep - Transport
// Opaque "open a forwarding session" capability plus the russh-backed
// implementation (connect, authenticate, bind local forwards)

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, AuthResult, Handle};
use russh::keys::{load_secret_key, PrivateKeyWithHashAlg, PublicKey, PublicKeyBase64};
use tokio::io::copy_bidirectional;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tunnelkeep_common::{ForwardSpec, RemoteConfig};

use crate::known_hosts::{HostKeyVerifier, TrustDecision};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

// A handful of channel-open failures in a row means the session is dead.
const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Failure opening a session. The free-text message is what the error
/// classifier consumes; `trust_rejected` marks the one failure mode the
/// supervisor must never retry.
#[derive(Debug, Clone)]
pub struct ConnectFailure {
    pub message: String,
    pub trust_rejected: bool,
}

impl ConnectFailure {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            trust_rejected: false,
        }
    }
}

/// An established forwarding session.
#[async_trait]
pub trait TunnelSession: Send {
    /// Resolves when the session dies, yielding the failure reason.
    async fn wait(&mut self) -> String;

    /// Tear the session down. Idempotent.
    async fn close(&mut self);
}

/// Capability to open a forwarding session against a remote endpoint.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open_session(
        &self,
        remote: &RemoteConfig,
        forwards: &[ForwardSpec],
        verifier: Arc<dyn HostKeyVerifier>,
    ) -> Result<Box<dyn TunnelSession>, ConnectFailure>;
}

/// russh-backed transport.
pub struct RusshTransport;

/// SSH client handler wiring host-key checks into the injected verifier.
struct ClientHandler {
    hostname: String,
    verifier: Arc<dyn HostKeyVerifier>,
    /// Set when the verifier rejected a changed key, so the caller can
    /// distinguish a trust rejection from an ordinary connect error.
    rejected: Arc<AtomicBool>,
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let key_type = key_type_to_string(server_public_key);
        let key_base64 = server_public_key.public_key_base64();

        match self.verifier.verify(&self.hostname, &key_type, &key_base64) {
            TrustDecision::Trust => Ok(true),
            TrustDecision::Reject {
                expected_fingerprint,
                actual_fingerprint,
            } => {
                error!("REMOTE HOST IDENTIFICATION HAS CHANGED for {}", self.hostname);
                error!("Expected fingerprint: {}", expected_fingerprint);
                error!("Actual fingerprint:   {}", actual_fingerprint);
                error!("Refusing to connect. Clear the trust store entry if the change is expected.");
                self.rejected.store(true, Ordering::SeqCst);
                Ok(false)
            }
        }
    }
}

#[async_trait]
impl Transport for RusshTransport {
    async fn open_session(
        &self,
        remote: &RemoteConfig,
        forwards: &[ForwardSpec],
        verifier: Arc<dyn HostKeyVerifier>,
    ) -> Result<Box<dyn TunnelSession>, ConnectFailure> {
        let rejected = Arc::new(AtomicBool::new(false));
        let handler = ClientHandler {
            hostname: remote.host.clone(),
            verifier,
            rejected: rejected.clone(),
        };

        let mut cfg = client::Config::default();
        cfg.nodelay = true;
        cfg.keepalive_interval = Some(Duration::from_secs(30));
        cfg.keepalive_max = 3;
        let config = Arc::new(cfg);

        let addr = format!("{}:{}", remote.host, remote.port);
        info!("Connecting to {}", addr);

        let mut session = match tokio::time::timeout(
            CONNECT_TIMEOUT,
            client::connect(config, &addr, handler),
        )
        .await
        {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                if rejected.load(Ordering::SeqCst) {
                    return Err(ConnectFailure {
                        message: format!("host key verification failed for {}", remote.host),
                        trust_rejected: true,
                    });
                }
                return Err(ConnectFailure::new(format!(
                    "failed to connect to {}: {}",
                    addr, e
                )));
            }
            Err(_) => {
                return Err(ConnectFailure::new(format!(
                    "connection to {} timed out after {:?}",
                    addr, CONNECT_TIMEOUT
                )));
            }
        };

        authenticate(&mut session, remote).await?;
        info!("SSH authentication successful for {}@{}", remote.user, addr);
        let session = Arc::new(session);

        // Bind every local forward before declaring the session up. A bind
        // failure here is an ordinary connection failure, not a doctor
        // matter.
        let mut listeners = Vec::with_capacity(forwards.len());
        for spec in forwards {
            let bind_addr = format!("{}:{}", spec.local_host, spec.local_port);
            match TcpListener::bind(&bind_addr).await {
                Ok(listener) => {
                    info!("Listening on {} -> {}:{}", bind_addr, spec.remote_host, spec.remote_port);
                    listeners.push((listener, spec.clone()));
                }
                Err(e) => {
                    let _ = session
                        .disconnect(russh::Disconnect::ByApplication, "", "en")
                        .await;
                    return Err(ConnectFailure::new(format!(
                        "failed to bind forward {}: {}",
                        spec, e
                    )));
                }
            }
        }

        let cancel = CancellationToken::new();
        let (death_tx, death_rx) = mpsc::channel::<String>(1);

        let mut tasks = Vec::with_capacity(listeners.len());
        for (listener, spec) in listeners {
            tasks.push(tokio::spawn(run_forward_loop(
                session.clone(),
                listener,
                spec,
                death_tx.clone(),
                cancel.clone(),
            )));
        }

        Ok(Box::new(RusshSession {
            handle: session,
            death_rx,
            cancel,
            tasks,
        }))
    }
}

struct RusshSession {
    handle: Arc<Handle<ClientHandler>>,
    death_rx: mpsc::Receiver<String>,
    cancel: CancellationToken,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

#[async_trait]
impl TunnelSession for RusshSession {
    async fn wait(&mut self) -> String {
        self.death_rx
            .recv()
            .await
            .unwrap_or_else(|| "session closed".to_string())
    }

    async fn close(&mut self) {
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Err(e) = self
            .handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await
        {
            debug!("Failed to disconnect gracefully: {}", e);
        }
    }
}

/// Public-key authentication from the configured key file.
async fn authenticate(
    session: &mut Handle<ClientHandler>,
    remote: &RemoteConfig,
) -> Result<(), ConnectFailure> {
    let key = load_secret_key(&remote.key_path, None).map_err(|e| {
        ConnectFailure::new(format!(
            "failed to load key {}: {}",
            remote.key_path.display(),
            e
        ))
    })?;

    let hash_alg = session
        .best_supported_rsa_hash()
        .await
        .map_err(|e| ConnectFailure::new(format!("authentication failed: {}", e)))?
        .flatten();
    let key_with_alg = PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg);

    let auth_result = session
        .authenticate_publickey(&remote.user, key_with_alg)
        .await
        .map_err(|e| ConnectFailure::new(format!("authentication failed: {}", e)))?;

    match auth_result {
        AuthResult::Success => Ok(()),
        AuthResult::Failure {
            remaining_methods, ..
        } => {
            let methods: Vec<String> = remaining_methods
                .iter()
                .map(|m| {
                    let s: &str = m.into();
                    s.to_string()
                })
                .collect();
            Err(ConnectFailure::new(format!(
                "public key authentication rejected, server requires: {}",
                methods.join(", ")
            )))
        }
    }
}

/// Accept loop for one local forward. Reports a fatal reason through
/// `death_tx` when the session stops taking channels.
async fn run_forward_loop(
    session: Arc<Handle<ClientHandler>>,
    listener: TcpListener,
    spec: ForwardSpec,
    death_tx: mpsc::Sender<String>,
    cancel: CancellationToken,
) {
    let mut consecutive_failures = 0u32;

    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((mut stream, peer_addr)) => {
                debug!("Accepted connection from {} for {}", peer_addr, spec);

                let channel = match session
                    .channel_open_direct_tcpip(
                        &spec.remote_host,
                        spec.remote_port.into(),
                        &peer_addr.ip().to_string(),
                        peer_addr.port().into(),
                    )
                    .await
                {
                    Ok(channel) => {
                        consecutive_failures = 0;
                        channel
                    }
                    Err(e) => {
                        consecutive_failures += 1;
                        warn!(
                            "Failed to open channel for {} ({}/{}): {}",
                            spec, consecutive_failures, MAX_CONSECUTIVE_FAILURES, e
                        );
                        if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                            let _ = death_tx
                                .send(format!(
                                    "session dead after {} consecutive channel failures: {}",
                                    MAX_CONSECUTIVE_FAILURES, e
                                ))
                                .await;
                            return;
                        }
                        continue;
                    }
                };

                tokio::spawn(async move {
                    let mut channel_stream = channel.into_stream();
                    if let Err(e) = copy_bidirectional(&mut stream, &mut channel_stream).await {
                        debug!("Forward connection ended: {}", e);
                    }
                });
            }
            Err(e) => {
                let _ = death_tx.send(format!("accept failed on {}: {}", spec, e)).await;
                return;
            }
        }
    }
}

/// Extract the algorithm name from the SSH wire encoding of a public key.
fn key_type_to_string(key: &PublicKey) -> String {
    let key_bytes = key.public_key_bytes();
    if key_bytes.len() < 4 {
        return "unknown".to_string();
    }
    let len = u32::from_be_bytes([key_bytes[0], key_bytes[1], key_bytes[2], key_bytes[3]]) as usize;
    if key_bytes.len() < 4 + len {
        return "unknown".to_string();
    }
    String::from_utf8_lossy(&key_bytes[4..4 + len]).to_string()
}
