//! Collaborative Editing WebSocket Server
//! Hosts the collaboration engine behind a JSON-over-WebSocket protocol

use clap::Parser;
use collaboration::*;
use futures_util::{SinkExt, StreamExt};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

type Tx = mpsc::UnboundedSender<Message>;
type ConnectionId = u64;

/// Open connections per document, used to fan out accepted operations
type PeerMap = Arc<RwLock<HashMap<DocumentId, HashMap<ConnectionId, Tx>>>>;

/// One lock per document, held from admission until the broadcast is queued
type OrderLocks = Arc<Mutex<HashMap<DocumentId, Arc<Mutex<()>>>>>;

/// Fan-out state shared by every connection.
///
/// Peers see remote operations for a document in version order because
/// admission and queueing happen under that document's order lock.
#[derive(Clone, Default)]
struct Fanout {
    peers: PeerMap,
    order: OrderLocks,
}

impl Fanout {
    async fn order_lock(&self, document_id: &DocumentId) -> Arc<Mutex<()>> {
        self.order
            .lock()
            .await
            .entry(document_id.clone())
            .or_default()
            .clone()
    }

    async fn subscribe(&self, document_id: DocumentId, connection_id: ConnectionId, tx: Tx) {
        self.peers
            .write()
            .await
            .entry(document_id)
            .or_default()
            .insert(connection_id, tx);
    }

    async fn unsubscribe(&self, documents: &HashSet<DocumentId>, connection_id: ConnectionId) {
        let mut peers_lock = self.peers.write().await;
        for document_id in documents {
            if let Some(connections) = peers_lock.get_mut(document_id) {
                connections.remove(&connection_id);
                if connections.is_empty() {
                    peers_lock.remove(document_id);
                }
            }
        }
    }

    /// Send to every connection on `document_id` except `exclude`
    async fn broadcast(
        &self,
        document_id: &DocumentId,
        msg: &ServerMessage,
        exclude: Option<ConnectionId>,
    ) {
        let json = match serde_json::to_string(msg) {
            Ok(j) => j,
            Err(e) => {
                error!("Failed to serialize message: {}", e);
                return;
            }
        };

        let peers_lock = self.peers.read().await;
        let Some(connections) = peers_lock.get(document_id) else {
            return;
        };

        for (id, conn) in connections {
            if Some(*id) == exclude {
                continue;
            }
            if let Err(e) = conn.send(Message::Text(json.clone())) {
                debug!("Failed to send to connection {}: {}", id, e);
            }
        }
    }
}

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Parser)]
#[command(name = "collab-server")]
#[command(about = "Real-time collaborative text editing server")]
#[command(version)]
struct Cli {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    addr: String,

    /// JSON engine config (heartbeat interval, rate limits)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "collab_server=debug,collaboration=debug"
    } else {
        "collab_server=info,collaboration=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let config = match &cli.config {
        Some(path) => {
            let json = std::fs::read_to_string(path)?;
            EngineConfig::from_json_str(&json)?
        }
        None => EngineConfig::default(),
    };
    info!(
        "Engine config: heartbeat {}ms, {} requests per {}ms",
        config.heartbeat_interval_ms, config.rate_limit.max_requests, config.rate_limit.window_ms
    );

    let engine = Arc::new(CollaborationSystem::new(config)?);
    let fanout = Fanout::default();

    let listener = TcpListener::bind(&cli.addr).await?;
    info!("Collaboration server listening on: {}", cli.addr);

    let purge_engine = engine.clone();
    let purge_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        loop {
            interval.tick().await;
            if purge_engine.purge_idle().is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        info!("New connection from: {}", addr);
                        tokio::spawn(handle_connection(stream, addr, engine.clone(), fanout.clone()));
                    }
                    Err(e) => error!("Failed to accept connection: {}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                break;
            }
        }
    }

    purge_task.abort();
    engine.shutdown();
    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    engine: Arc<CollaborationSystem>,
    fanout: Fanout,
) {
    let ws_stream = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            error!("WebSocket handshake failed for {}: {}", addr, e);
            return;
        }
    };

    info!("WebSocket connection established: {}", addr);

    let connection_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel();

    // Task to send messages to client
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = ws_sender.send(msg).await {
                error!("Failed to send message: {}", e);
                break;
            }
        }
    });

    let mut joined: HashSet<DocumentId> = HashSet::new();

    while let Some(msg) = ws_receiver.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                error!("Error receiving message: {}", e);
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                let reply = match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(client_msg) => {
                        handle_client_message(
                            client_msg,
                            &engine,
                            &fanout,
                            connection_id,
                            &tx,
                            &mut joined,
                        )
                        .await
                    }
                    Err(e) => {
                        warn!("Malformed message from {}: {}", addr, e);
                        Some(ServerMessage::Error {
                            kind: "invalid_message".to_string(),
                            message: e.to_string(),
                        })
                    }
                };

                if let Some(reply) = reply {
                    if let Err(e) = send(&tx, &reply) {
                        error!("Failed to queue reply for {}: {}", addr, e);
                        break;
                    }
                }
            }
            Message::Ping(data) => {
                let _ = tx.send(Message::Pong(data));
            }
            Message::Close(_) => {
                info!("Client requested close");
                break;
            }
            _ => {}
        }
    }

    // Presence is left to expire; only the fan-out registration goes away
    fanout.unsubscribe(&joined, connection_id).await;

    send_task.abort();
    info!("Connection closed: {}", addr);
}

/// Run one client request against the engine and produce the reply
async fn handle_client_message(
    msg: ClientMessage,
    engine: &CollaborationSystem,
    fanout: &Fanout,
    connection_id: ConnectionId,
    tx: &Tx,
    joined: &mut HashSet<DocumentId>,
) -> Option<ServerMessage> {
    let reply = match msg {
        ClientMessage::Connect {
            user_id,
            document_id,
        } => {
            // Snapshot and subscription under the order lock, so no accepted
            // operation falls between the two
            let order = fanout.order_lock(&document_id).await;
            let _ordered = order.lock().await;
            match engine.connect(user_id, document_id.clone()) {
                Ok(response) => {
                    fanout
                        .subscribe(document_id.clone(), connection_id, tx.clone())
                        .await;
                    joined.insert(document_id.clone());
                    Ok(ServerMessage::Connected {
                        document_id,
                        response,
                    })
                }
                Err(e) => Err(e),
            }
        }

        ClientMessage::Operation {
            session_id,
            document_id,
            operation,
            base_version,
        } => apply_and_broadcast(
            engine,
            fanout,
            connection_id,
            session_id,
            &document_id,
            operation,
            base_version,
        )
        .await
        .map(|applied| ServerMessage::OperationApplied {
            document_id,
            applied,
        }),

        ClientMessage::SyncRequest { document_id, since } => engine
            .operations_since(&document_id, since)
            .map(|operations| {
                let version = since + operations.len() as u64;
                ServerMessage::SyncResponse {
                    document_id,
                    operations,
                    version,
                }
            }),

        ClientMessage::Presence { user_id, data } => engine
            .update_presence(user_id, data)
            .and_then(|_| engine.get_active_users())
            .map(|users| ServerMessage::ActiveUsers { users }),

        ClientMessage::ActiveUsers => engine
            .get_active_users()
            .map(|users| ServerMessage::ActiveUsers { users }),

        ClientMessage::Ping => Ok(ServerMessage::Pong),
    };

    match reply {
        Ok(reply) => Some(reply),
        Err(e) => {
            debug!("Request from connection {} failed: {}", connection_id, e);
            Some(ServerMessage::from_error(&e))
        }
    }
}

/// Admit an edit and queue it for the document's other connections
async fn apply_and_broadcast(
    engine: &CollaborationSystem,
    fanout: &Fanout,
    connection_id: ConnectionId,
    session_id: SessionId,
    document_id: &DocumentId,
    operation: Operation,
    base_version: Option<u64>,
) -> collaboration::Result<AppliedOperation> {
    let order = fanout.order_lock(document_id).await;
    let _ordered = order.lock().await;

    let applied = match base_version {
        Some(version) => engine.apply_operation_since(session_id, document_id, operation, version)?,
        None => engine.apply_operation(session_id, document_id, operation)?,
    };

    let remote = ServerMessage::RemoteOperation {
        document_id: document_id.clone(),
        operation: applied.operation.clone(),
        version: applied.version,
    };
    fanout
        .broadcast(document_id, &remote, Some(connection_id))
        .await;

    Ok(applied)
}

fn send(tx: &Tx, msg: &ServerMessage) -> anyhow::Result<()> {
    let json = serde_json::to_string(msg)?;
    tx.send(Message::Text(json))?;
    Ok(())
}
