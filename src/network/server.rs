//! WebSocket Coordinator Server
//!
//! Async WebSocket server for participant connections. Every connection must
//! open with `join`; after that its messages are routed to the scene's
//! session manager, the probe coordinator or the relay layer.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::{interval, Instant};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, instrument, warn};

use crate::env::EnvFactory;
use crate::network::auth::{authorize_join, AuthConfig, AuthError};
use crate::network::protocol::{
    ActionSubmission, ClientMessage, EndReason, ErrorCode, JoinRequest, RelayCredentials,
    ServerMessage,
};
use crate::probe::ProbeCoordinator;
use crate::scene::{SceneConfig, SceneError};
use crate::session::{
    CoordinatorState, ParticipantId, Registration, SessionError, SessionManager,
};
use crate::sync::{ClientSyncCoordinator, SyncError};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// How often stale probes and expired waitroom entries are swept.
    pub sweep_interval: Duration,
    /// Scenes served.
    pub scenes: Vec<SceneConfig>,
    /// TURN relay handed to probe peers.
    pub relay: Option<RelayCredentials>,
    /// Join-token validation.
    pub auth: AuthConfig,
    /// Server version string.
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_connections: 1000,
            sweep_interval: Duration::from_secs(1),
            scenes: vec![SceneConfig::default()],
            relay: None,
            auth: AuthConfig::default(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl ServerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Result<Self, CoordinatorServerError> {
        let mut config = Self {
            auth: AuthConfig::from_env(),
            ..Default::default()
        };

        if let Ok(addr) = std::env::var("COPLAY_BIND_ADDR") {
            config.bind_addr = addr
                .parse()
                .map_err(|_| CoordinatorServerError::Config(format!("bad COPLAY_BIND_ADDR {addr}")))?;
        }
        if let Ok(max) = std::env::var("COPLAY_MAX_CONNECTIONS") {
            config.max_connections = max.parse().map_err(|_| {
                CoordinatorServerError::Config(format!("bad COPLAY_MAX_CONNECTIONS {max}"))
            })?;
        }
        if let Ok(path) = std::env::var("COPLAY_SCENES") {
            config.scenes = load_scenes(Path::new(&path))?;
        }
        if let Ok(urls) = std::env::var("COPLAY_TURN_URLS") {
            config.relay = Some(RelayCredentials {
                urls: urls.split(',').map(|u| u.trim().to_string()).collect(),
                username: std::env::var("COPLAY_TURN_USERNAME").unwrap_or_default(),
                credential: std::env::var("COPLAY_TURN_CREDENTIAL").unwrap_or_default(),
            });
        }
        Ok(config)
    }
}

/// Read a JSON array of scene descriptors.
pub fn load_scenes(path: &Path) -> Result<Vec<SceneConfig>, CoordinatorServerError> {
    let text = std::fs::read_to_string(path)?;
    parse_scenes(&text)
}

/// Parse and validate a JSON array of scene descriptors.
pub fn parse_scenes(text: &str) -> Result<Vec<SceneConfig>, CoordinatorServerError> {
    let scenes: Vec<SceneConfig> = serde_json::from_str(text)?;
    for scene in &scenes {
        scene.validate()?;
    }
    Ok(scenes)
}

/// Coordinator server errors.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorServerError {
    /// Failed to bind, or to read configuration.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Scene file is not valid JSON.
    #[error("Invalid scene file: {0}")]
    SceneFile(#[from] serde_json::Error),

    /// Scene descriptor is inconsistent.
    #[error(transparent)]
    Scene(#[from] SceneError),

    /// Bad configuration value.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Session error.
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}

/// Connected client bookkeeping.
struct ConnectedClient {
    participant_id: Option<ParticipantId>,
    connected_at: Instant,
}

/// Per-connection routing state.
struct Connection {
    addr: SocketAddr,
    participant: Option<ParticipantId>,
    manager: Option<Arc<SessionManager>>,
}

impl Connection {
    fn new(addr: SocketAddr) -> Self {
        Self { addr, participant: None, manager: None }
    }
}

/// Everything a connection task needs.
struct ServerContext {
    state: Arc<CoordinatorState>,
    probes: Arc<ProbeCoordinator>,
    managers: BTreeMap<String, Arc<SessionManager>>,
    auth: AuthConfig,
    clients: RwLock<BTreeMap<SocketAddr, ConnectedClient>>,
}

/// The coordinator server.
pub struct CoordinatorServer {
    config: ServerConfig,
    context: Arc<ServerContext>,
    shutdown_tx: broadcast::Sender<()>,
}

impl CoordinatorServer {
    /// Create a server with one session manager per configured scene.
    pub fn new(config: ServerConfig, env_factory: EnvFactory) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let state = Arc::new(CoordinatorState::new());
        let sync = Arc::new(ClientSyncCoordinator::new(state.clone()));
        let probes = Arc::new(ProbeCoordinator::new(state.clone(), config.relay.clone()));

        let managers = config
            .scenes
            .iter()
            .map(|scene| {
                let manager = SessionManager::new(
                    scene.clone(),
                    state.clone(),
                    sync.clone(),
                    Some(probes.clone()),
                    env_factory.clone(),
                );
                (scene.scene_id.clone(), manager)
            })
            .collect();

        let context = Arc::new(ServerContext {
            state,
            probes,
            managers,
            auth: config.auth.clone(),
            clients: RwLock::new(BTreeMap::new()),
        });

        Self { config, context, shutdown_tx }
    }

    /// Run the server.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<(), CoordinatorServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        info!(
            addr = %self.config.bind_addr,
            version = %self.config.version,
            scenes = self.context.managers.len(),
            auth = self.context.auth.is_configured(),
            "Coordinator listening"
        );

        let sweep_context = self.context.clone();
        let sweep_every = self.config.sweep_interval;
        let sweep_handle = tokio::spawn(async move {
            Self::run_sweep_loop(sweep_context, sweep_every).await;
        });

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let clients_count = self.context.clients.read().await.len();
                            if clients_count >= self.config.max_connections {
                                warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }

                            debug!("New connection from {}", addr);
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        sweep_handle.abort();
        for manager in self.context.managers.values() {
            manager.shutdown().await;
        }

        Ok(())
    }

    /// Handle a new WebSocket connection.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let context = self.context.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    error!("WebSocket handshake failed for {}: {}", addr, e);
                    return;
                }
            };

            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (msg_tx, mut msg_rx) = mpsc::channel::<ServerMessage>(256);

            context.clients.write().await.insert(
                addr,
                ConnectedClient { participant_id: None, connected_at: Instant::now() },
            );

            let sender_task = tokio::spawn(async move {
                while let Some(msg) = msg_rx.recv().await {
                    let text = match msg.to_json() {
                        Ok(t) => t,
                        Err(e) => {
                            error!("Failed to serialize message: {}", e);
                            continue;
                        }
                    };
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
            });

            let mut conn = Connection::new(addr);
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                let client_msg = match ClientMessage::from_json(&text) {
                                    Ok(m) => m,
                                    Err(e) => {
                                        debug!("Invalid message from {}: {}", addr, e);
                                        let _ = msg_tx.send(ServerMessage::error(
                                            ErrorCode::InvalidMessage,
                                            "Invalid message format",
                                        )).await;
                                        continue;
                                    }
                                };
                                context.handle_client_message(&mut conn, client_msg, &msg_tx).await;
                            }
                            Some(Ok(Message::Binary(data))) => {
                                // Binary frames carry actions only
                                match ActionSubmission::from_bytes(&data) {
                                    Ok(action) => {
                                        context
                                            .handle_client_message(&mut conn, ClientMessage::Action(action), &msg_tx)
                                            .await;
                                    }
                                    Err(e) => debug!("Invalid binary frame from {}: {}", addr, e),
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                debug!("Client {} disconnected", addr);
                                break;
                            }
                            Some(Err(e)) => {
                                warn!("WebSocket error for {}: {}", addr, e);
                                break;
                            }
                            _ => {}
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        let _ = msg_tx.send(ServerMessage::Shutdown {
                            reason: "Server shutting down".to_string(),
                        }).await;
                        break;
                    }
                }
            }

            sender_task.abort();
            context.connection_closed(conn).await;
        });
    }

    /// Sweep stale probes and expired waitroom entries.
    async fn run_sweep_loop(context: Arc<ServerContext>, every: Duration) {
        let mut ticker = interval(every);

        loop {
            ticker.tick().await;

            let probes = context.probes.cleanup_stale().await;
            let mut expired = 0;
            for manager in context.managers.values() {
                expired += manager.expire_waitroom().await;
            }
            if probes > 0 || expired > 0 {
                debug!(probes, expired, "Sweep");
            }
        }
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Get active connection count.
    pub async fn connection_count(&self) -> usize {
        self.context.clients.read().await.len()
    }

    /// Get live session count across scenes.
    pub async fn session_count(&self) -> usize {
        let mut total = 0;
        for manager in self.context.managers.values() {
            total += manager.session_count().await;
        }
        total
    }

    /// Session manager for a scene.
    pub fn manager(&self, scene_id: &str) -> Option<&Arc<SessionManager>> {
        self.context.managers.get(scene_id)
    }
}

impl ServerContext {
    /// Route one client message.
    async fn handle_client_message(
        &self,
        conn: &mut Connection,
        msg: ClientMessage,
        sender: &mpsc::Sender<ServerMessage>,
    ) {
        let msg = match msg {
            ClientMessage::Ping { timestamp } => {
                let pong = ServerMessage::Pong {
                    timestamp,
                    server_time: chrono::Utc::now().timestamp_millis().max(0) as u64,
                };
                let _ = sender.send(pong).await;
                return;
            }
            ClientMessage::Join(join) => {
                if let Err(reply) = self.handle_join(conn, join, sender).await {
                    let _ = sender.send(reply).await;
                }
                return;
            }
            other => other,
        };

        let (Some(participant), Some(manager)) = (conn.participant.clone(), conn.manager.clone())
        else {
            let _ = sender
                .send(ServerMessage::error(ErrorCode::NotJoined, "Send join first"))
                .await;
            return;
        };
        self.state.touch(&participant).await;

        let result = match msg {
            ClientMessage::Leave => {
                manager.remove_participant(&participant, Some(EndReason::Left)).await;
                self.state.unregister(&participant).await;
                conn.participant = None;
                conn.manager = None;
                Ok(())
            }
            ClientMessage::Action(action) => manager.submit_action(&participant, action).await,
            ClientMessage::StateHash(report) => manager.relay_state_hash(&participant, report).await,
            ClientMessage::DesyncDetected { frame_number, .. } => {
                manager.desync_detected(&participant, frame_number).await
            }
            ClientMessage::FullState(upload) => manager.receive_full_state(&participant, upload).await,
            ClientMessage::LogData(log) => manager.receive_log(&participant, log).await.map(|_| ()),
            ClientMessage::Ready => manager.mark_ready(&participant).await.map(|_| ()),
            ClientMessage::ResetAck { episode } => {
                manager.ack_reset(&participant, episode).await.map(|_| ())
            }
            ClientMessage::Focus { visible } => {
                manager.handle_focus(&participant, visible).await;
                Ok(())
            }
            ClientMessage::LatencyReport { rtt_ms } => {
                self.state.set_rtt(&participant, rtt_ms).await;
                Ok(())
            }
            ClientMessage::ProbeReady { probe_id } => {
                if let Err(e) = self.probes.handle_ready(&probe_id, &participant).await {
                    debug!(participant = %participant, error = %e, "Probe ready dropped");
                }
                Ok(())
            }
            ClientMessage::ProbeSignal { probe_id, target, signal_type, payload } => {
                if let Err(e) = self
                    .probes
                    .relay_signal(&probe_id, &participant, &target, signal_type, payload)
                    .await
                {
                    debug!(participant = %participant, error = %e, "Probe signal dropped");
                }
                Ok(())
            }
            ClientMessage::ProbeResult { probe_id, rtt_ms } => {
                if let Err(e) = self.probes.handle_result(&probe_id, &participant, rtt_ms).await {
                    debug!(participant = %participant, error = %e, "Probe result dropped");
                }
                Ok(())
            }
            ClientMessage::Join(_) | ClientMessage::Ping { .. } => Ok(()),
        };

        if let Err(e) = result {
            debug!(participant = %participant, error = %e, "Message rejected");
            let _ = sender.send(session_error_message(&e)).await;
        }
    }

    /// Authenticate, register and admit. Errors come back as the reply.
    async fn handle_join(
        &self,
        conn: &mut Connection,
        join: JoinRequest,
        sender: &mpsc::Sender<ServerMessage>,
    ) -> Result<(), ServerMessage> {
        if conn.participant.is_some() {
            return Err(ServerMessage::error(ErrorCode::InvalidMessage, "Already joined"));
        }

        let participant = join.participant_id.clone();
        authorize_join(join.token.as_deref(), &participant, &self.auth).map_err(|e| {
            warn!(participant = %participant, error = %e, "Join rejected");
            let code = match e {
                AuthError::Expired => ErrorCode::TokenExpired,
                AuthError::MissingToken | AuthError::NotConfigured => ErrorCode::AuthFailed,
                _ => ErrorCode::InvalidToken,
            };
            ServerMessage::error(code, e.to_string())
        })?;

        let registration = self
            .state
            .register(participant.clone(), sender.clone())
            .await
            .map_err(|e| session_error_message(&e))?;

        // A seated participant returns to the scene it was seated in
        let (scene_id, reattach) = match registration {
            Registration::Reattached { scene_id: Some(scene_id), session: Some(_) } => {
                (scene_id, true)
            }
            _ => (join.scene_id.clone(), false),
        };
        let Some(manager) = self.managers.get(&scene_id).cloned() else {
            self.state.unregister(&participant).await;
            return Err(ServerMessage::error(
                ErrorCode::SceneNotFound,
                format!("Unknown scene {scene_id}"),
            ));
        };

        conn.participant = Some(participant.clone());
        conn.manager = Some(manager.clone());
        if let Some(client) = self.clients.write().await.get_mut(&conn.addr) {
            client.participant_id = Some(participant.clone());
        }

        if reattach {
            if scene_id != join.scene_id {
                debug!(participant = %participant, requested = %join.scene_id, scene = %scene_id, "Reattaching to original scene");
            }
            return manager
                .reconnect(&participant)
                .await
                .map_err(|e| session_error_message(&e));
        }

        self.state
            .set_join_info(&participant, &join.scene_id, join.rtt_ms, join.group_history)
            .await;
        match manager.add_participant(participant.clone()).await {
            Ok(admission) => {
                info!(participant = %participant, scene = %join.scene_id, ?admission, "Joined");
                Ok(())
            }
            Err(e) => {
                self.state.unregister(&participant).await;
                conn.participant = None;
                conn.manager = None;
                Err(session_error_message(&e))
            }
        }
    }

    /// Transport closed.
    async fn connection_closed(&self, conn: Connection) {
        let client = self.clients.write().await.remove(&conn.addr);
        if let (Some(participant), Some(manager)) = (conn.participant, conn.manager) {
            manager.handle_disconnect(&participant).await;
        }
        if let Some(client) = client {
            debug!(
                addr = %conn.addr,
                participant = ?client.participant_id,
                connected_ms = client.connected_at.elapsed().as_millis() as u64,
                "Client cleaned up"
            );
        }
    }
}

/// Map a session error to the wire error sent back to the client.
fn session_error_message(e: &SessionError) -> ServerMessage {
    let code = match e {
        SessionError::NotInSession
        | SessionError::NotFound(_)
        | SessionError::Ended(_)
        | SessionError::Sync(SyncError::UnknownSession(_))
        | SessionError::Sync(SyncError::NotInSession(_)) => ErrorCode::NotInSession,
        SessionError::SlotNotOccupied(_) | SessionError::Sync(SyncError::WrongSlot { .. }) => {
            ErrorCode::WrongSlot
        }
        SessionError::AlreadyConnected(_) => ErrorCode::AlreadyConnected,
        SessionError::UnknownParticipant(_) | SessionError::NotAMember(_) => ErrorCode::NotJoined,
        SessionError::SessionFull(_) => ErrorCode::ServerOverloaded,
        SessionError::InvalidTransition { .. } => ErrorCode::InternalError,
        _ => ErrorCode::InvalidMessage,
    };
    ServerMessage::error(code, e.to_string())
}
