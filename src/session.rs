//! Session controller.
//!
//! Owns the credential pair (base address, bearer token), performs the login
//! handshake and replaces the event stream whenever its token is declared
//! invalid. One controller exists per process; see [`shared_or_init`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, RwLock, Weak};
use std::time::Duration;

use reqwest::{Client, StatusCode};
use secrecy::SecretString;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::rest::{summarize_error_body, RestResult};
use crate::retry::{retry_forever, ReconnectPolicy};
use crate::stream::{FrameHandler, StreamClient, StreamConnectError, StreamManager, StreamSignal};

/// Result of the latest successful login.
#[derive(Debug)]
pub struct Credentials {
    pub base_url: String,
    pub token: SecretString,
}

/// Shared, wholesale-replaced credential slot.
///
/// Readers get an immutable snapshot; a token read just before it is replaced
/// is expected to fail once and heal on the next read.
#[derive(Clone, Debug, Default)]
pub struct CredentialCell {
    inner: Arc<RwLock<Option<Arc<Credentials>>>>,
}

impl CredentialCell {
    pub fn current(&self) -> Option<Arc<Credentials>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn replace(&self, credentials: Credentials) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(credentials));
    }

    pub fn clear(&self) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn is_set(&self) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("login request failed: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("login http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },

    #[error("failed to parse login response: {0}")]
    Parse(#[source] serde_json::Error),

    #[error("login rejected with code {code}: {message}")]
    Rejected { code: i64, message: String },

    #[error("login response carried no token")]
    MissingToken,
}

/// Failure of one login-then-connect attempt.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Stream(#[from] StreamConnectError),
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub base_url: String,
    pub serial_number: String,
    /// Delay between login attempts on the recovery path.
    pub login_retry: Duration,
    pub reconnect: ReconnectPolicy,
}

impl SessionConfig {
    pub fn new(base_url: impl Into<String>, serial_number: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end().trim_end_matches('/').to_string(),
            serial_number: serial_number.into(),
            login_retry: Duration::from_secs(5),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    sn: &'a str,
}

pub struct SessionController {
    config: SessionConfig,
    http: Client,
    credentials: CredentialCell,
    handler: Arc<dyn FrameHandler>,
    signals: mpsc::UnboundedSender<StreamSignal>,
    signal_rx: Mutex<Option<mpsc::UnboundedReceiver<StreamSignal>>>,
    stream: Mutex<Option<StreamManager>>,
    recovery: Mutex<Option<JoinHandle<()>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    last_epoch: AtomicU64,
}

impl SessionController {
    /// `http` is shared by login and the event stream, so it must not carry a
    /// whole-request timeout.
    pub fn new(
        config: SessionConfig,
        http: Client,
        credentials: CredentialCell,
        handler: Arc<dyn FrameHandler>,
    ) -> Self {
        let (signals, signal_rx) = mpsc::unbounded_channel();
        Self {
            config,
            http,
            credentials,
            handler,
            signals,
            signal_rx: Mutex::new(Some(signal_rx)),
            stream: Mutex::new(None),
            recovery: Mutex::new(None),
            supervisor: Mutex::new(None),
            last_epoch: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn credentials(&self) -> &CredentialCell {
        &self.credentials
    }

    pub fn current_credentials(&self) -> Option<Arc<Credentials>> {
        self.credentials.current()
    }

    /// `true` between the first successful login and shutdown.
    pub fn is_ready(&self) -> bool {
        self.credentials.is_set()
    }

    /// The stream manager bound to the latest token, if any.
    pub fn stream(&self) -> Option<StreamManager> {
        lock(&self.stream).clone()
    }

    fn login_url(&self) -> String {
        format!(
            "{}/api/node/{}/login",
            self.config.base_url, self.config.serial_number
        )
    }

    /// Performs one login and stores the new token. Never retries.
    pub async fn authenticate(&self) -> Result<SecretString, AuthError> {
        match self.login().await {
            Ok(token) => {
                self.credentials.replace(Credentials {
                    base_url: self.config.base_url.clone(),
                    token: token.clone(),
                });
                info!(event = "login_succeeded", serial_number = %self.config.serial_number);
                Ok(token)
            }
            Err(err) => {
                warn!(event = "login_failed", serial_number = %self.config.serial_number, error = %err);
                Err(err)
            }
        }
    }

    async fn login(&self) -> Result<SecretString, AuthError> {
        let response = self
            .http
            .post(self.login_url())
            .json(&LoginRequest {
                sn: &self.config.serial_number,
            })
            .send()
            .await
            .map_err(AuthError::Transport)?;

        let status = response.status();
        let body = response.text().await.map_err(AuthError::Transport)?;
        if !status.is_success() {
            return Err(AuthError::HttpStatus {
                status,
                body: summarize_error_body(&body),
            });
        }

        let result = RestResult::from_text(&body).map_err(AuthError::Parse)?;
        if !result.is_ok() {
            return Err(AuthError::Rejected {
                code: result.code,
                message: result.message,
            });
        }
        match result.data_str() {
            Some(token) if !token.is_empty() => Ok(SecretString::new(token.to_string())),
            _ => Err(AuthError::MissingToken),
        }
    }

    /// Logs in and binds a fresh stream manager to the new token.
    async fn establish(&self) -> Result<(), SessionError> {
        let token = self.authenticate().await?;
        let epoch = self.last_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let manager = StreamManager::new(
            StreamClient::with_http(self.http.clone(), self.config.base_url.clone()),
            token,
            self.handler.clone(),
            self.config.reconnect.clone(),
            epoch,
            self.signals.clone(),
        );

        let previous = lock(&self.stream).replace(manager.clone());
        if let Some(previous) = previous {
            previous.disconnect();
        }
        manager.connect().await?;
        info!(event = "session_established", epoch);
        Ok(())
    }

    /// Starts the signal supervisor and the initial login loop.
    ///
    /// Returns immediately. Calling it twice has no effect.
    pub fn start(self: &Arc<Self>) {
        let Some(mut signals) = lock(&self.signal_rx).take() else {
            debug!(event = "session_already_started");
            return;
        };

        let weak = Arc::downgrade(self);
        let supervisor = tokio::spawn(async move {
            while let Some(signal) = signals.recv().await {
                let Some(session) = weak.upgrade() else {
                    break;
                };
                session.on_signal(signal);
            }
        });
        *lock(&self.supervisor) = Some(supervisor);

        self.reauthenticate();
    }

    fn on_signal(self: &Arc<Self>, signal: StreamSignal) {
        match signal {
            StreamSignal::TokenInvalid { epoch } => {
                let current = self.stream().map(|manager| manager.epoch());
                if current != Some(epoch) {
                    debug!(event = "stale_token_signal", epoch, current = ?current);
                    return;
                }
                warn!(event = "session_invalidated", epoch);
                self.reauthenticate();
            }
        }
    }

    /// Tears down the stream and logs in again until it succeeds.
    ///
    /// Runs on its own task. A previous recovery still in flight is aborted
    /// first; at most one loop replaces the stream.
    pub fn reauthenticate(self: &Arc<Self>) {
        let mut recovery = lock(&self.recovery);
        if let Some(previous) = recovery.take() {
            previous.abort();
        }
        if let Some(manager) = self.stream() {
            manager.disconnect();
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = self.config.login_retry;
        *recovery = Some(tokio::spawn(async move {
            retry_forever(interval, |attempt| {
                let weak = weak.clone();
                async move {
                    debug!(event = "session_establish_attempt", attempt);
                    match weak.upgrade() {
                        Some(session) => session.establish().await,
                        None => Ok(()),
                    }
                }
            })
            .await;
        }));
    }

    /// Stops recovery and streaming and forgets the credentials.
    pub fn shutdown(&self) {
        if let Some(recovery) = lock(&self.recovery).take() {
            recovery.abort();
        }
        if let Some(supervisor) = lock(&self.supervisor).take() {
            supervisor.abort();
        }
        if let Some(manager) = lock(&self.stream).take() {
            manager.disconnect();
        }
        self.credentials.clear();
        info!(event = "session_shutdown");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

static SESSION: OnceLock<Arc<SessionController>> = OnceLock::new();

/// Returns the process-wide controller, building it with `init` on first use.
///
/// Concurrent first callers race safely; exactly one `init` runs.
pub fn shared_or_init(init: impl FnOnce() -> SessionController) -> Arc<SessionController> {
    SESSION.get_or_init(|| Arc::new(init())).clone()
}

/// The process-wide controller, if one was built.
pub fn shared() -> Option<Arc<SessionController>> {
    SESSION.get().cloned()
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode as AxumStatus;
    use axum::routing::post;
    use axum::{Json, Router};
    use futures_util::future::BoxFuture;
    use futures_util::FutureExt;
    use secrecy::ExposeSecret;
    use serde_json::{json, Value};

    use super::*;
    use crate::rpc::DispatchError;

    struct Discard;

    impl FrameHandler for Discard {
        fn handle_frame<'a>(&'a self, _payload: &'a str) -> BoxFuture<'a, Result<(), DispatchError>> {
            async { Ok(()) }.boxed()
        }
    }

    async fn spawn_login(status: AxumStatus, body: Value) -> String {
        let app = Router::new().route(
            "/api/node/:sn/login",
            post(move |Json(request): Json<Value>| {
                let body = body.clone();
                async move {
                    assert_eq!(request, json!({"sn": "SN-1"}));
                    (status, Json(body))
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}/")
    }

    fn controller(base_url: &str) -> SessionController {
        SessionController::new(
            SessionConfig::new(base_url, "SN-1"),
            Client::new(),
            CredentialCell::default(),
            Arc::new(Discard),
        )
    }

    #[test]
    fn credential_cell_replaces_wholesale() {
        let cell = CredentialCell::default();
        assert!(cell.current().is_none());

        cell.replace(Credentials {
            base_url: "http://a".to_string(),
            token: SecretString::new("T1".to_string()),
        });
        let first = cell.current().expect("first");

        cell.replace(Credentials {
            base_url: "http://a".to_string(),
            token: SecretString::new("T2".to_string()),
        });
        assert_eq!(first.token.expose_secret(), "T1");
        assert_eq!(cell.current().expect("second").token.expose_secret(), "T2");

        cell.clear();
        assert!(!cell.is_set());
    }

    #[test]
    fn config_strips_trailing_slash() {
        let config = SessionConfig::new("http://host:8080/ ", "SN-1");
        assert_eq!(config.base_url, "http://host:8080");
        assert_eq!(config.login_retry, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn authenticate_stores_token_and_marks_ready() {
        let base = spawn_login(
            AxumStatus::OK,
            json!({"success": true, "code": 200, "message": "ok", "data": "T1"}),
        )
        .await;
        let session = controller(&base);
        assert!(!session.is_ready());

        let token = session.authenticate().await.expect("login");
        assert_eq!(token.expose_secret(), "T1");
        assert!(session.is_ready());
        let credentials = session.current_credentials().expect("credentials");
        assert_eq!(credentials.base_url, base.trim_end_matches('/'));
        assert_eq!(credentials.token.expose_secret(), "T1");
    }

    #[tokio::test]
    async fn authenticate_rejects_bad_code() {
        let base = spawn_login(AxumStatus::OK, json!({"code": 403, "message": "unknown node"})).await;
        let session = controller(&base);
        let err = session.authenticate().await.expect_err("rejected");
        assert!(matches!(err, AuthError::Rejected { code: 403, .. }));
        assert!(!session.is_ready());
    }

    #[tokio::test]
    async fn authenticate_rejects_missing_token_and_http_errors() {
        let base = spawn_login(AxumStatus::OK, json!({"code": 200, "data": {"token": "T1"}})).await;
        let err = controller(&base).authenticate().await.expect_err("no token");
        assert!(matches!(err, AuthError::MissingToken));

        let base = spawn_login(AxumStatus::BAD_GATEWAY, json!({"message": "upstream down"})).await;
        let err = controller(&base).authenticate().await.expect_err("http error");
        assert!(matches!(err, AuthError::HttpStatus { body, .. } if body == "upstream down"));
    }

    #[tokio::test]
    async fn shutdown_clears_credentials() {
        let base = spawn_login(AxumStatus::OK, json!({"code": 200, "data": "T1"})).await;
        let session = controller(&base);
        session.authenticate().await.expect("login");
        session.shutdown();
        assert!(!session.is_ready());
        assert!(session.stream().is_none());
    }
}
