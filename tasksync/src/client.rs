//! The relay connection loop.
//!
//! A [`SyncClient`] owns one WebSocket to the relay. On connect it sends a
//! `ping` and then waits for frames: the relay's `tasks_sync` snapshot, live
//! `task_*` events, and the `pong` that marks the connection healthy. Inbound
//! events go to the [`Reconciler`]; outbound commands arrive from any number of
//! [`SyncHandle`]s over an mpsc channel.
//!
//! Delivery is best-effort. Outbound messages are not acknowledged, and a send
//! while the socket is down is dropped (the handle logs it and returns
//! [`SyncError::NotConnected`]). Commands still queued when the socket dies are
//! discarded as well. After any failure the loop sleeps for a fixed delay and
//! reconnects, forever, until [`SyncHandle::disconnect`] is called (or, for a
//! client spawned with [`SyncClient::start`], every handle is dropped).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use futures::{Sink, SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::{select, time};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, Message},
};

use crate::config::ClientConfig;
use crate::dates::format_date;
use crate::entity::task;
use crate::messages::{ClientMessage, ProtocolError, ServerMessage, TaskPayload};
use crate::reconcile::{ApplyOutcome, Reconciler};
use crate::status::{ConnectionStatus, SyncStatus};
use crate::store::{StoreError, TaskStore};

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Not connected to the relay")]
    NotConnected,

    #[error("Sync client has shut down")]
    Closed,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
}

#[derive(Debug)]
enum Command {
    Send(ClientMessage),
    Disconnect,
}

#[derive(Debug, PartialEq, Eq)]
enum LoopExit {
    Retry,
    Shutdown,
}

/// Builder for [`SyncClient`].
pub struct SyncClientBuilder {
    config: ClientConfig,
    store: TaskStore,
}

impl SyncClientBuilder {
    pub fn new(relay_url: &str, store: TaskStore) -> Self {
        Self {
            config: ClientConfig {
                relay_url: relay_url.to_string(),
                ..ClientConfig::default()
            },
            store,
        }
    }

    pub fn from_config(config: ClientConfig, store: TaskStore) -> Self {
        Self { config, store }
    }

    pub fn with_device_id(mut self, device_id: &str) -> Self {
        self.config.device_id = device_id.to_string();
        self
    }

    pub fn with_user_id(mut self, user_id: &str) -> Self {
        self.config.user_id = user_id.to_string();
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.config.reconnect_delay = delay;
        self
    }

    pub fn build(self) -> SyncClient {
        let (tx, rx) = mpsc::channel(100);
        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected);

        SyncClient {
            config: self.config,
            reconciler: Reconciler::new(self.store),
            tx,
            rx,
            status_tx,
            socket_open: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// The connection loop. Obtain one from [`SyncClientBuilder`], then call
/// [`start`](SyncClient::start) to run it in the background.
pub struct SyncClient {
    config: ClientConfig,
    reconciler: Reconciler,
    tx: mpsc::Sender<Command>,
    rx: mpsc::Receiver<Command>,
    status_tx: watch::Sender<ConnectionStatus>,
    socket_open: Arc<AtomicBool>,
}

impl SyncClient {
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// A handle for sending and observing. Handles may be created before the
    /// loop runs.
    pub fn handle(&self) -> SyncHandle {
        SyncHandle {
            tx: self.tx.clone(),
            status_rx: self.status_tx.subscribe(),
            sync_status_rx: self.reconciler.sync_status(),
            socket_open: self.socket_open.clone(),
            store: self.reconciler.store().clone(),
            user_id: self.config.user_id.clone(),
        }
    }

    /// Spawn the loop on the tokio runtime and return a handle to it. The loop
    /// stops once every handle is dropped or one of them disconnects.
    pub fn start(self) -> SyncHandle {
        let handle = self.handle();
        let mut session = self.into_session(false);
        tokio::spawn(async move { session.run().await });
        handle
    }

    /// Run the loop on the current task. It reconnects forever, applying relay
    /// events, until a handle calls [`SyncHandle::disconnect`] or the future is
    /// dropped. Handles going away do not stop it.
    pub async fn run(self) {
        self.into_session(true).run().await;
    }

    fn into_session(self, keep_open: bool) -> Session {
        let SyncClient {
            config,
            reconciler,
            tx,
            rx,
            status_tx,
            socket_open,
        } = self;

        Session {
            config,
            reconciler,
            rx,
            _keepalive: keep_open.then_some(tx),
            status_tx,
            socket_open,
        }
    }
}

struct Session {
    config: ClientConfig,
    reconciler: Reconciler,
    rx: mpsc::Receiver<Command>,
    // Without a sender of its own, `rx` ends when the last handle is dropped.
    _keepalive: Option<mpsc::Sender<Command>>,
    status_tx: watch::Sender<ConnectionStatus>,
    socket_open: Arc<AtomicBool>,
}

impl Session {
    async fn run(&mut self) {
        loop {
            self.status_tx.send_replace(ConnectionStatus::Connecting);
            log::info!("Connecting to relay at {}", self.config.relay_url);

            let exit = match connect_async(self.config.relay_url.as_str()).await {
                Ok((socket, _response)) => {
                    self.socket_open.store(true, Ordering::SeqCst);
                    let exit = self.serve(socket).await;
                    self.socket_open.store(false, Ordering::SeqCst);
                    exit
                }
                Err(e) => {
                    log::error!("Failed to connect to {}: {e}", self.config.relay_url);
                    self.status_tx.send_replace(ConnectionStatus::Failed(e.to_string()));
                    LoopExit::Retry
                }
            };

            if exit == LoopExit::Shutdown || self.wait_before_retry().await == LoopExit::Shutdown {
                break;
            }
        }

        self.rx.close();
        self.status_tx.send_replace(ConnectionStatus::Disconnected);
        log::info!("Sync client stopped");
    }

    async fn serve<S>(&mut self, socket: S) -> LoopExit
    where
        S: futures::Stream<Item = Result<Message, tungstenite::Error>>
            + Sink<Message, Error = tungstenite::Error>
            + Unpin,
    {
        let (mut write, mut read) = socket.split();

        if let Err(e) = send_message(&mut write, &ClientMessage::Ping).await {
            log::error!("Failed to send ping: {e}");
            self.status_tx.send_replace(ConnectionStatus::Failed(e.to_string()));
            return LoopExit::Retry;
        }

        loop {
            select! {
                cmd = self.rx.recv() => match cmd {
                    Some(Command::Send(msg)) => {
                        if let Err(e) = send_message(&mut write, &msg).await {
                            log::error!("Failed to send {}: {e}", msg.kind());
                        }
                    }
                    Some(Command::Disconnect) | None => {
                        if let Err(e) = write.send(Message::Close(None)).await {
                            log::debug!("Close frame not delivered: {e}");
                        }
                        log::info!("Disconnected from relay");
                        return LoopExit::Shutdown;
                    }
                },
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.handle_text(&text).await,
                    Some(Ok(Message::Binary(data))) => {
                        log::warn!("Ignoring {} byte binary frame", data.len());
                    }
                    Some(Ok(Message::Close(frame))) => {
                        log::warn!("Relay closed the connection: {frame:?}");
                        self.status_tx.send_replace(ConnectionStatus::Failed("closed by relay".into()));
                        return LoopExit::Retry;
                    }
                    // Control frames are answered by tungstenite itself.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::error!("WebSocket receive failed: {e}");
                        self.status_tx.send_replace(ConnectionStatus::Failed(e.to_string()));
                        return LoopExit::Retry;
                    }
                    None => {
                        log::warn!("Relay connection ended");
                        self.status_tx.send_replace(ConnectionStatus::Failed("connection ended".into()));
                        return LoopExit::Retry;
                    }
                },
            }
        }
    }

    /// Sleep for the reconnect delay, dropping any sends that arrive meanwhile.
    async fn wait_before_retry(&mut self) -> LoopExit {
        log::info!("Reconnecting in {:?}", self.config.reconnect_delay);
        let sleep = time::sleep(self.config.reconnect_delay);
        tokio::pin!(sleep);

        loop {
            select! {
                _ = &mut sleep => return LoopExit::Retry,
                cmd = self.rx.recv() => match cmd {
                    Some(Command::Send(msg)) => {
                        log::error!("Dropping {} while disconnected", msg.kind());
                    }
                    Some(Command::Disconnect) | None => return LoopExit::Shutdown,
                },
            }
        }
    }

    async fn handle_text(&mut self, text: &str) {
        log::debug!("Received {text}");
        let msg = match ServerMessage::decode(text) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Discarding relay message: {e}");
                return;
            }
        };

        let result = match &msg {
            ServerMessage::Pong => {
                self.status_tx.send_replace(ConnectionStatus::Connected);
                log::info!("Relay connection healthy");
                return;
            }
            ServerMessage::TasksSync { tasks, skipped } => {
                self.reconciler.apply_snapshot_with_skipped(tasks, *skipped).await;
                return;
            }
            ServerMessage::TaskCreated(task) => self.reconciler.apply_created(task).await,
            ServerMessage::TaskUpdated(task) => self.reconciler.apply_updated(task).await,
            ServerMessage::TaskDeleted(task) => self.reconciler.apply_deleted(task).await,
        };

        match result {
            Ok(outcome) => log::debug!("{} applied: {}", msg.kind(), outcome_label(&outcome)),
            Err(e) => log::error!("Failed to apply {}: {e}", msg.kind()),
        }
    }
}

fn outcome_label(outcome: &ApplyOutcome) -> &'static str {
    match outcome {
        ApplyOutcome::Created(_) => "created",
        ApplyOutcome::Updated(_) => "updated",
        ApplyOutcome::Unchanged => "unchanged",
        ApplyOutcome::Deleted(_) => "deleted",
        ApplyOutcome::Duplicate => "duplicate",
        ApplyOutcome::Missing => "missing",
    }
}

async fn send_message<S>(sink: &mut S, msg: &ClientMessage) -> Result<(), SyncError>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let text = msg.encode()?;
    log::debug!("Sending {text}");
    sink.send(Message::Text(text)).await?;
    Ok(())
}

/// Cloneable control handle for a running [`SyncClient`].
#[derive(Clone)]
pub struct SyncHandle {
    tx: mpsc::Sender<Command>,
    status_rx: watch::Receiver<ConnectionStatus>,
    sync_status_rx: watch::Receiver<SyncStatus>,
    socket_open: Arc<AtomicBool>,
    store: TaskStore,
    user_id: String,
}

impl SyncHandle {
    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    /// Current connection status.
    pub fn status(&self) -> ConnectionStatus {
        self.status_rx.borrow().clone()
    }

    /// Watch connection status changes.
    pub fn status_rx(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_rx.clone()
    }

    /// Watch snapshot reconciliation status.
    pub fn sync_status_rx(&self) -> watch::Receiver<SyncStatus> {
        self.sync_status_rx.clone()
    }

    /// Whether a socket is currently open. Sends only go out while it is.
    pub fn is_connected(&self) -> bool {
        self.socket_open.load(Ordering::SeqCst)
    }

    /// Ask the relay for a `pong`. Useful as a manual connection test.
    pub async fn ping(&self) -> Result<(), SyncError> {
        self.send(ClientMessage::Ping).await
    }

    /// Announce a task created on this device.
    pub async fn create_task(&self, task: &task::Model) -> Result<(), SyncError> {
        let payload = TaskPayload::from_task(task, &self.user_id);
        self.send(ClientMessage::CreateTask(payload)).await?;
        self.store.mark_synced(&task.record_id).await?;
        Ok(())
    }

    /// Push local edits of a task. `updated_at` is stamped with the send time.
    pub async fn update_task(&self, task: &task::Model) -> Result<(), SyncError> {
        let mut payload = TaskPayload::from_task(task, &self.user_id);
        payload.updated_at = Some(format_date(&Utc::now()));
        self.send(ClientMessage::UpdateTask(payload)).await?;
        self.store.mark_synced(&task.record_id).await?;
        Ok(())
    }

    /// Announce a deletion. The task usually no longer exists locally, so the
    /// caller passes the last copy it had.
    pub async fn delete_task(&self, task: &task::Model) -> Result<(), SyncError> {
        let payload = TaskPayload::from_task(task, &self.user_id);
        self.send(ClientMessage::DeleteTask(payload)).await
    }

    /// Remove every task from the local store without telling the relay.
    pub async fn clear_all_local_tasks(&self) -> Result<u64, SyncError> {
        Ok(self.store.clear_tasks().await?)
    }

    /// Close the socket and stop the loop. Once the loop has stopped, sends
    /// fail with [`SyncError::Closed`].
    pub async fn disconnect(&self) {
        if self.tx.send(Command::Disconnect).await.is_err() {
            log::debug!("Sync client already stopped");
        }
    }

    async fn send(&self, msg: ClientMessage) -> Result<(), SyncError> {
        if self.tx.is_closed() {
            log::error!("Cannot send {}: sync client has shut down", msg.kind());
            return Err(SyncError::Closed);
        }
        if !self.is_connected() {
            log::error!("Cannot send {}: not connected to relay", msg.kind());
            return Err(SyncError::NotConnected);
        }
        let kind = msg.kind();
        self.tx.send(Command::Send(msg)).await.map_err(|_| {
            log::error!("Cannot send {kind}: sync client has shut down");
            SyncError::Closed
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    #[tokio::test]
    async fn test_commands_queued_before_reconnect_are_discarded() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws", listener.local_addr().unwrap());
        let store = TaskStore::open("sqlite::memory:").await.unwrap();
        let client = SyncClientBuilder::new(&url, store)
            .with_reconnect_delay(Duration::from_millis(50))
            .build();
        let handle = client.handle();
        let mut session = client.into_session(false);

        // Left in the channel by a socket that died before sending it.
        let stale = TaskPayload {
            title: "Stale".into(),
            ..Default::default()
        };
        handle
            .tx
            .send(Command::Send(ClientMessage::CreateTask(stale)))
            .await
            .unwrap();

        assert_eq!(session.wait_before_retry().await, LoopExit::Retry);
        assert!(matches!(
            session.rx.try_recv(),
            Err(mpsc::error::TryRecvError::Empty)
        ));

        tokio::spawn(async move { session.run().await });
        let (stream, _) = listener.accept().await.unwrap();
        let mut relay = accept_async(stream).await.unwrap();

        let first = relay.next().await.unwrap().unwrap();
        assert_eq!(
            ClientMessage::decode(first.to_text().unwrap()).unwrap(),
            ClientMessage::Ping
        );
        assert!(time::timeout(Duration::from_millis(200), relay.next()).await.is_err());

        handle.disconnect().await;
    }

    #[tokio::test]
    async fn test_started_client_stops_when_handles_drop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws", listener.local_addr().unwrap());
        drop(listener);

        let store = TaskStore::open("sqlite::memory:").await.unwrap();
        let client = SyncClientBuilder::new(&url, store)
            .with_reconnect_delay(Duration::from_millis(20))
            .build();
        let mut status = client.status_tx.subscribe();
        drop(client.start());

        // The status sender lives as long as the loop does.
        time::timeout(Duration::from_secs(5), async {
            while status.changed().await.is_ok() {}
        })
        .await
        .unwrap();
        assert_eq!(*status.borrow(), ConnectionStatus::Disconnected);
    }
}
