//! Control-socket router.
//!
//! Keeps one local-socket connection to the control peer, decodes inbound
//! frames, and dispatches them to the handler registered for their category.
//! Every request gets exactly one reply: when no handler can take it the
//! router answers with a top-level error instead of staying silent.
//!
//! The handler registry outlives connections. Feature modules register once
//! and keep receiving messages across reconnects until [`shutdown`] clears it.
//!
//! [`shutdown`]: ControlSocketRouter::shutdown

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use interprocess::local_socket::tokio::{prelude::*, Stream as LocalStream};
use interprocess::local_socket::GenericFilePath;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch, RwLock};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::codec::ControlCodec;
use super::message::{Category, ControlMessage, EnvelopeHeader, MessageType};
use crate::errors::ProtocolError;
use crate::{AppError, Result};

/// Handler for every message of one category.
pub trait ControlHandler: Send + Sync {
    /// Process `message` and optionally produce a reply to write back.
    ///
    /// # Errors
    ///
    /// An error on a request is turned into a top-level error response.
    fn handle(&self, message: ControlMessage) -> BoxFuture<'_, Result<Option<ControlMessage>>>;
}

/// Lifecycle of the control connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Looking up the socket.
    Preparing,
    /// Connected, wiring reader and writer.
    Setup,
    /// Messages can flow.
    Ready,
    /// Not connected; will retry.
    Waiting(String),
    /// Connection broke.
    Failed(String),
    /// Router stopped.
    Cancelled,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Preparing => f.write_str("preparing"),
            Self::Setup => f.write_str("setup"),
            Self::Ready => f.write_str("ready"),
            Self::Waiting(reason) => write!(f, "waiting ({reason})"),
            Self::Failed(reason) => write!(f, "failed ({reason})"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Router tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterConfig {
    /// Filesystem path of the control socket.
    pub socket_path: PathBuf,
    /// Delay between connection attempts.
    pub reconnect_delay: Duration,
    /// Outbound queue depth per connection.
    pub outbound_buffer: usize,
}

impl RouterConfig {
    /// Defaults for a socket at `socket_path`.
    #[must_use]
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            reconnect_delay: Duration::from_secs(2),
            outbound_buffer: 64,
        }
    }
}

/// Category dispatcher over one local-socket connection.
pub struct ControlSocketRouter {
    config: RouterConfig,
    handlers: RwLock<HashMap<Category, Arc<dyn ControlHandler>>>,
    outbound: RwLock<Option<mpsc::Sender<ControlMessage>>>,
    state: watch::Sender<ConnectionState>,
    ready: watch::Sender<bool>,
}

impl ControlSocketRouter {
    /// Router that will connect to `config.socket_path` once [`run`] starts.
    ///
    /// [`run`]: Self::run
    #[must_use]
    pub fn new(config: RouterConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Preparing);
        let (ready, _) = watch::channel(false);
        Self {
            config,
            handlers: RwLock::new(HashMap::new()),
            outbound: RwLock::new(None),
            state,
            ready,
        }
    }

    /// Install the handler for `category`, replacing any previous one.
    pub async fn register_handler(&self, category: Category, handler: Arc<dyn ControlHandler>) {
        let replaced = self
            .handlers
            .write()
            .await
            .insert(category, handler)
            .is_some();
        debug!(%category, replaced, "control handler registered");
    }

    /// Remove the handler for `category`.
    pub async fn unregister_handler(&self, category: Category) {
        if self.handlers.write().await.remove(&category).is_some() {
            debug!(%category, "control handler unregistered");
        }
    }

    /// Whether a handler is installed for `category`.
    pub async fn has_handler(&self, category: Category) -> bool {
        self.handlers.read().await.contains_key(&category)
    }

    /// Drop every handler and the current connection's writer.
    pub async fn shutdown(&self) {
        self.handlers.write().await.clear();
        self.outbound.write().await.take();
        self.ready.send_replace(false);
        info!("control router shut down");
    }

    /// Current connection state.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Observe connection states.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Readiness notification; flips to `true` on the first `Ready` of each
    /// connection and back to `false` when it goes away.
    #[must_use]
    pub fn subscribe_ready(&self) -> watch::Receiver<bool> {
        self.ready.subscribe()
    }

    /// Record a transport state change.
    pub fn on_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next.clone());
        if previous == next {
            return;
        }
        info!(state = %next, "control connection state");

        match next {
            ConnectionState::Ready => {
                self.ready.send_replace(true);
            }
            ConnectionState::Waiting(_) | ConnectionState::Failed(_) | ConnectionState::Cancelled => {
                if *self.ready.borrow() {
                    self.ready.send_replace(false);
                }
            }
            ConnectionState::Preparing | ConnectionState::Setup => {}
        }
    }

    /// Queue `message` on the current connection.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::NotConnected` when no connection is up.
    pub async fn send(&self, message: ControlMessage) -> Result<()> {
        let tx = self
            .outbound
            .read()
            .await
            .clone()
            .ok_or(ProtocolError::NotConnected)?;
        tx.send(message)
            .await
            .map_err(|_| AppError::from(ProtocolError::NotConnected))
    }

    /// Route one inbound frame and return the reply to write back, if any.
    pub async fn handle_inbound(&self, frame: &[u8]) -> Option<ControlMessage> {
        let header = match EnvelopeHeader::peek(frame) {
            Ok(header) => header,
            Err(err) => return malformed_reply(frame, &err),
        };

        let category = match header.category.parse::<Category>() {
            Ok(category) => category,
            Err(err) => return unroutable(&header, &err),
        };

        let handler = self.handlers.read().await.get(&category).cloned();
        let Some(handler) = handler else {
            let err = ProtocolError::NoHandlerForCategory(header.category.clone());
            return unroutable(&header, &err);
        };

        let message = match ControlMessage::decode(frame) {
            Ok(message) => message,
            Err(err) => {
                warn!(id = %header.id, %err, "undecodable control message");
                return (header.kind == MessageType::Request)
                    .then(|| header.error_reply(err.to_string()));
            }
        };

        let is_request = message.is_request();
        let span = info_span!("control_dispatch", %category, action = %header.action, id = %header.id);
        match handler.handle(message).instrument(span).await {
            // Every request is answered, even when the handler has nothing to say.
            Ok(None) if is_request => Some(header.empty_reply()),
            Ok(reply) => reply,
            Err(err) if is_request => {
                warn!(%category, action = %header.action, %err, "control handler failed");
                Some(header.error_reply(err.to_string()))
            }
            Err(err) => {
                warn!(%category, action = %header.action, %err, "control event handler failed");
                None
            }
        }
    }

    /// Drive one established connection until it closes or `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns the read or write error that ended the connection.
    pub async fn serve_connection<S>(
        self: &Arc<Self>,
        stream: S,
        cancel: CancellationToken,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.on_state(ConnectionState::Setup);

        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = FramedRead::new(read_half, ControlCodec::new());
        let mut writer = FramedWrite::new(write_half, ControlCodec::new());

        let (tx, mut rx) = mpsc::channel::<ControlMessage>(self.config.outbound_buffer.max(1));
        *self.outbound.write().await = Some(tx.clone());

        let conn_cancel = cancel.child_token();
        let writer_cancel = conn_cancel.clone();
        let writer_task = tokio::spawn(
            async move {
                loop {
                    let message = tokio::select! {
                        biased;
                        () = writer_cancel.cancelled() => break,
                        message = rx.recv() => match message {
                            Some(message) => message,
                            None => break,
                        },
                    };
                    if let Err(err) = writer.send(message).await {
                        warn!(%err, "control write failed");
                        writer_cancel.cancel();
                        return Err(err);
                    }
                }
                Ok(())
            }
            .instrument(info_span!("control_writer")),
        );

        self.on_state(ConnectionState::Ready);

        let mut outcome = Ok(());
        loop {
            let frame = tokio::select! {
                () = conn_cancel.cancelled() => break,
                frame = reader.next() => frame,
            };

            match frame {
                Some(Ok(frame)) => {
                    let router = Arc::clone(self);
                    let reply_tx = tx.clone();
                    tokio::spawn(async move {
                        if let Some(reply) = router.handle_inbound(&frame).await {
                            if reply_tx.send(reply).await.is_err() {
                                debug!("connection closed before reply was written");
                            }
                        }
                    });
                }
                Some(Err(AppError::Protocol(err))) => {
                    // Oversized frame; the stream is no longer aligned.
                    warn!(%err, "control frame rejected");
                    outcome = Err(err.into());
                    break;
                }
                Some(Err(err)) => {
                    outcome = Err(err);
                    break;
                }
                None => {
                    debug!("control peer closed the connection");
                    break;
                }
            }
        }

        conn_cancel.cancel();
        drop(tx);
        self.outbound.write().await.take();

        match writer_task.await {
            Ok(Err(err)) if outcome.is_ok() => outcome = Err(err),
            Err(err) => warn!(%err, "control writer task panicked"),
            _ => {}
        }
        outcome
    }

    /// Connect, serve, and reconnect until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let path = self.config.socket_path.clone();
        let span = info_span!("control_router", path = %path.display());

        async move {
            while !cancel.is_cancelled() {
                self.on_state(ConnectionState::Preparing);

                match connect(&path).await {
                    Ok(stream) => {
                        info!("control socket connected");
                        match self.serve_connection(stream, cancel.clone()).await {
                            Ok(()) => {
                                self.on_state(ConnectionState::Waiting("connection closed".into()));
                            }
                            Err(err) => self.on_state(ConnectionState::Failed(err.to_string())),
                        }
                    }
                    Err(err) => self.on_state(ConnectionState::Waiting(err.to_string())),
                }

                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(self.config.reconnect_delay) => {}
                }
            }
            self.on_state(ConnectionState::Cancelled);
        }
        .instrument(span)
        .await;
    }
}

async fn connect(path: &std::path::Path) -> Result<LocalStream> {
    let name = path
        .to_fs_name::<GenericFilePath>()
        .map_err(|err| AppError::Io(format!("invalid control socket path: {err}")))?;
    LocalStream::connect(name)
        .await
        .map_err(|err| AppError::Io(format!("control socket connect failed: {err}")))
}

fn unroutable(header: &EnvelopeHeader, err: &ProtocolError) -> Option<ControlMessage> {
    if header.kind == MessageType::Request {
        warn!(category = %header.category, action = %header.action, "no handler for request");
        Some(header.error_reply(err.to_string()))
    } else {
        debug!(category = %header.category, action = %header.action, "dropping unhandled message");
        None
    }
}

/// Reply for a frame whose routing header could not be read. Only frames that
/// still carry a request id get an answer.
fn malformed_reply(frame: &[u8], err: &AppError) -> Option<ControlMessage> {
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(frame) else {
        warn!(%err, "dropping non-JSON control frame");
        return None;
    };
    let id = value.get("id").and_then(serde_json::Value::as_str);
    let is_request = value.get("type").and_then(serde_json::Value::as_str) == Some("request");

    match id {
        Some(id) if is_request => {
            warn!(id, %err, "malformed control request");
            let text = |key: &str| {
                value
                    .get(key)
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or_default()
                    .to_owned()
            };
            Some(ControlMessage {
                id: id.to_owned(),
                kind: MessageType::Response,
                category: text("category"),
                action: text("action"),
                payload: None,
                session_id: value
                    .get("sessionId")
                    .and_then(serde_json::Value::as_str)
                    .map(str::to_owned),
                error: Some(err.to_string()),
            })
        }
        _ => {
            warn!(%err, "dropping malformed control frame");
            None
        }
    }
}
