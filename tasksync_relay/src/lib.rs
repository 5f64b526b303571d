//! # tasksync_relay
//!
//! A small broadcast relay for `tasksync` clients. It keeps the authoritative
//! task table in its own [`TaskStore`], sends every new connection a
//! `tasks_sync` snapshot, answers `ping` with `pong`, and turns each
//! `create_task`, `update_task` and `delete_task` into a `task_created`,
//! `task_updated` or `task_deleted` broadcast to every connected client,
//! the sender included.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tasksync::{
    ApplyOutcome, ClientMessage, MatchKey, ProtocolError, Reconciler, RemoteId, ServerMessage,
    StoreError, TaskPayload, TaskStore, task,
};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, broadcast};
use tokio_tungstenite::{
    accept_async,
    tungstenite::{self, Message},
};

pub const DEFAULT_LISTEN: &str = "0.0.0.0:8082";
pub const DEFAULT_DATABASE: &str = "sqlite:./relay.db?mode=rwc";

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    pub listen: String,
    pub database: String,
    /// Stamped on every task the relay sends out.
    pub user_id: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            database: DEFAULT_DATABASE.to_string(),
            user_id: tasksync::DEFAULT_USER_ID.to_string(),
        }
    }
}

struct Shared {
    reconciler: Reconciler,
    hub: broadcast::Sender<String>,
    user_id: String,
    // Serializes match-then-write sequences across connections.
    writes: Mutex<()>,
}

impl Shared {
    fn outbound(&self, model: &task::Model) -> TaskPayload {
        let mut payload = TaskPayload::from_task(model, &self.user_id);
        payload.id = Some(RemoteId::Text(model.record_id.clone()));
        payload
    }

    async fn snapshot(&self) -> Result<ServerMessage, RelayError> {
        let tasks = self.reconciler.store().tasks().await?;
        Ok(ServerMessage::tasks_sync(
            tasks.iter().map(|t| self.outbound(t)).collect(),
        ))
    }

    async fn handle(&self, msg: ClientMessage) {
        let kind = msg.kind();
        let result = match msg {
            ClientMessage::Ping => Ok(None),
            ClientMessage::CreateTask(payload) => self.create(&payload).await,
            ClientMessage::UpdateTask(payload) => self.update(&payload).await,
            ClientMessage::DeleteTask(payload) => self.delete(&payload).await,
        };

        match result {
            Ok(Some(event)) => self.broadcast(&event),
            Ok(None) => {}
            Err(e) => log::error!("Failed to handle {kind}: {e}"),
        }
    }

    /// Creates are upserts so a client retrying after a reconnect cannot
    /// duplicate a task.
    async fn create(&self, payload: &TaskPayload) -> Result<Option<ServerMessage>, RelayError> {
        let _guard = self.writes.lock().await;
        match self.reconciler.upsert(payload).await? {
            ApplyOutcome::Created(model) => Ok(Some(ServerMessage::TaskCreated(self.outbound(&model)))),
            ApplyOutcome::Updated(model) => Ok(Some(ServerMessage::TaskUpdated(self.outbound(&model)))),
            _ => self.current(payload).await,
        }
    }

    async fn update(&self, payload: &TaskPayload) -> Result<Option<ServerMessage>, RelayError> {
        let _guard = self.writes.lock().await;
        match self.reconciler.apply_updated(payload).await? {
            ApplyOutcome::Updated(model) => Ok(Some(ServerMessage::TaskUpdated(self.outbound(&model)))),
            ApplyOutcome::Missing => {
                log::warn!("Update for unknown task {:?} ignored", payload.title);
                Ok(None)
            }
            _ => self.current(payload).await,
        }
    }

    async fn delete(&self, payload: &TaskPayload) -> Result<Option<ServerMessage>, RelayError> {
        let _guard = self.writes.lock().await;
        let key = MatchKey::for_payload(payload);
        let Some(stored) = self.reconciler.store().find_match(&key).await? else {
            log::warn!("Delete for unknown task {:?} ignored", payload.title);
            return Ok(None);
        };

        match self.reconciler.apply_deleted(payload).await? {
            ApplyOutcome::Deleted(_) => Ok(Some(ServerMessage::TaskDeleted(self.outbound(&stored)))),
            _ => Ok(None),
        }
    }

    /// The stored copy of an unchanged task, rebroadcast as `task_updated`.
    async fn current(&self, payload: &TaskPayload) -> Result<Option<ServerMessage>, RelayError> {
        let key = MatchKey::for_payload(payload);
        Ok(self
            .reconciler
            .store()
            .find_match(&key)
            .await?
            .map(|model| ServerMessage::TaskUpdated(self.outbound(&model))))
    }

    fn broadcast(&self, event: &ServerMessage) {
        match event.encode() {
            Ok(text) => {
                let receivers = self.hub.send(text).unwrap_or(0);
                log::info!("Broadcast {} to {} clients", event.kind(), receivers);
            }
            Err(e) => log::error!("Failed to encode {}: {e}", event.kind()),
        }
    }
}

/// A bound relay. Call [`run`](Relay::run) to start accepting clients.
pub struct Relay {
    listener: TcpListener,
    shared: Arc<Shared>,
}

impl Relay {
    /// Open the configured database and bind the listen address.
    pub async fn bind(config: &RelayConfig) -> Result<Self, RelayError> {
        let store = TaskStore::open(&config.database).await?;
        Self::with_store(&config.listen, store, &config.user_id).await
    }

    /// Bind `listen`, serving tasks from an existing store.
    pub async fn with_store(listen: &str, store: TaskStore, user_id: &str) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(listen).await?;
        let (hub, _) = broadcast::channel(256);
        Ok(Self {
            listener,
            shared: Arc::new(Shared {
                reconciler: Reconciler::new(store),
                hub,
                user_id: user_id.to_string(),
                writes: Mutex::new(()),
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, RelayError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn store(&self) -> &TaskStore {
        self.shared.reconciler.store()
    }

    /// Accept clients until the listener fails.
    pub async fn run(self) -> Result<(), RelayError> {
        log::info!("Relay listening on {}", self.local_addr()?);
        loop {
            let (stream, peer) = self.listener.accept().await?;
            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = serve(shared, stream, peer).await {
                    log::warn!("Client {peer} dropped: {e}");
                }
            });
        }
    }
}

async fn serve(shared: Arc<Shared>, stream: TcpStream, peer: SocketAddr) -> Result<(), RelayError> {
    let socket = accept_async(stream).await?;
    let (mut write, mut read) = socket.split();

    // Subscribe before the snapshot so no broadcast falls in between.
    let mut events = shared.hub.subscribe();
    let snapshot = shared.snapshot().await?;
    write.send(Message::Text(snapshot.encode()?)).await?;
    log::info!("Client {peer} connected");

    loop {
        tokio::select! {
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => match ClientMessage::decode(&text) {
                    Ok(ClientMessage::Ping) => {
                        write.send(Message::Text(ServerMessage::Pong.encode()?)).await?;
                    }
                    Ok(msg) => {
                        log::debug!("{} from {peer}", msg.kind());
                        shared.handle(msg).await;
                    }
                    Err(e) => log::warn!("Discarding message from {peer}: {e}"),
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            },
            event = events.recv() => match event {
                Ok(text) => write.send(Message::Text(text)).await?,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    log::warn!("Client {peer} missed {missed} events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    log::info!("Client {peer} disconnected");
    Ok(())
}
