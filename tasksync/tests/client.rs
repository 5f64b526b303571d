use std::future::Future;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tasksync::{
    ClientMessage, ConnectionStatus, NewTask, RemoteId, ServerMessage, SyncClientBuilder, SyncError,
    SyncHandle, TaskPayload, TaskStore,
};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::timeout;
use tokio_tungstenite::{accept_async, tungstenite::Message};

const WAIT: Duration = Duration::from_secs(5);

/// A scripted relay: answers `ping` with the current snapshot and a `pong`,
/// reports everything it receives, and can push raw frames or drop every
/// connection.
struct MockRelay {
    url: String,
    inbound: mpsc::UnboundedReceiver<ClientMessage>,
    push: broadcast::Sender<String>,
    kick: broadcast::Sender<()>,
    snapshot: watch::Sender<Vec<TaskPayload>>,
}

impl MockRelay {
    async fn spawn(snapshot: Vec<TaskPayload>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws", listener.local_addr().unwrap());
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let (push, _) = broadcast::channel(16);
        let (kick, _) = broadcast::channel(4);
        let (snapshot, snapshot_rx) = watch::channel(snapshot);

        let push_tx = push.clone();
        let kick_tx = kick.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let inbound_tx = inbound_tx.clone();
                let snapshot = snapshot_rx.clone();
                let mut push_rx = push_tx.subscribe();
                let mut kick_rx = kick_tx.subscribe();

                tokio::spawn(async move {
                    let Ok(ws) = accept_async(stream).await else {
                        return;
                    };
                    let (mut write, mut read) = ws.split();
                    loop {
                        tokio::select! {
                            _ = kick_rx.recv() => return,
                            Ok(raw) = push_rx.recv() => {
                                if write.send(Message::Text(raw)).await.is_err() {
                                    return;
                                }
                            }
                            frame = read.next() => match frame {
                                Some(Ok(Message::Text(text))) => {
                                    let msg = ClientMessage::decode(&text).unwrap();
                                    if msg == ClientMessage::Ping {
                                        let sync = ServerMessage::tasks_sync(snapshot.borrow().clone());
                                        let _ = write.send(Message::Text(sync.encode().unwrap())).await;
                                        let _ = write.send(Message::Text(ServerMessage::Pong.encode().unwrap())).await;
                                    }
                                    let _ = inbound_tx.send(msg);
                                }
                                Some(Ok(_)) => {}
                                _ => return,
                            },
                        }
                    }
                });
            }
        });

        Self {
            url,
            inbound,
            push,
            kick,
            snapshot,
        }
    }

    async fn next_inbound(&mut self) -> ClientMessage {
        timeout(WAIT, self.inbound.recv())
            .await
            .expect("Timed out waiting for client message")
            .expect("Relay stopped")
    }

    fn push(&self, msg: &ServerMessage) {
        self.push_raw(&msg.encode().unwrap());
    }

    fn push_raw(&self, raw: &str) {
        self.push.send(raw.to_string()).unwrap();
    }

    fn drop_connections(&self) {
        let _ = self.kick.send(());
    }

    /// Serve `tasks` to every later connection.
    fn set_snapshot(&self, tasks: Vec<TaskPayload>) {
        self.snapshot.send_replace(tasks);
    }
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

async fn open_store() -> TaskStore {
    TaskStore::open("sqlite::memory:").await.unwrap()
}

async fn wait_failed(handle: &SyncHandle) {
    let mut rx = handle.status_rx();
    timeout(WAIT, rx.wait_for(|s| matches!(s, ConnectionStatus::Failed(_))))
        .await
        .expect("Timed out waiting for failure")
        .unwrap();
}

async fn wait_connected(handle: &SyncHandle) {
    let mut rx = handle.status_rx();
    timeout(WAIT, rx.wait_for(|s| s.is_connected()))
        .await
        .expect("Timed out waiting for connection")
        .unwrap();
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check().await {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn remote_task(record_id: &str, title: &str) -> TaskPayload {
    TaskPayload {
        id: Some(RemoteId::Number(7)),
        user_id: "default_user".into(),
        title: title.into(),
        device_id: "mum-phone".into(),
        record_id: Some(record_id.into()),
        category: Some("生活".into()),
        priority: Some(1),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_connect_pings_and_applies_snapshot() {
    init_logging();
    let mut relay = MockRelay::spawn(vec![remote_task("r1", "Buy bread")]).await;
    let store = open_store().await;

    let handle = SyncClientBuilder::new(&relay.url, store.clone())
        .with_device_id("kid-tablet")
        .build()
        .start();

    assert_eq!(relay.next_inbound().await, ClientMessage::Ping);
    wait_connected(&handle).await;
    assert_eq!(handle.status(), ConnectionStatus::Connected);

    // The snapshot precedes the pong on the wire.
    let tasks = store.tasks().await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].record_id, "r1");
    assert!(!tasks[0].needs_sync);
}

#[tokio::test]
async fn test_outbound_create_reaches_relay() {
    init_logging();
    let mut relay = MockRelay::spawn(Vec::new()).await;
    let store = open_store().await;
    let handle = SyncClientBuilder::new(&relay.url, store.clone())
        .with_device_id("kid-tablet")
        .build()
        .start();
    assert_eq!(relay.next_inbound().await, ClientMessage::Ping);
    wait_connected(&handle).await;

    let task = store
        .create_task(NewTask::new("Tidy room", "kid-tablet"))
        .await
        .unwrap();
    handle.create_task(&task).await.unwrap();

    let ClientMessage::CreateTask(sent) = relay.next_inbound().await else {
        panic!("expected create_task");
    };
    assert_eq!(sent.id, Some(RemoteId::Number(0)));
    assert_eq!(sent.user_id, "default_user");
    assert_eq!(sent.record_id.as_deref(), Some(task.record_id.as_str()));
    assert_eq!(sent.device_id, "kid-tablet");
    assert_eq!(sent.description.as_deref(), Some(""));

    let stored = store.get_task(&task.record_id).await.unwrap().unwrap();
    assert!(!stored.needs_sync);

    handle.update_task(&stored).await.unwrap();
    let ClientMessage::UpdateTask(sent) = relay.next_inbound().await else {
        panic!("expected update_task");
    };
    assert!(sent.updated_at.is_some());

    handle.delete_task(&stored).await.unwrap();
    assert!(matches!(relay.next_inbound().await, ClientMessage::DeleteTask(_)));
}

#[tokio::test]
async fn test_live_events_are_applied() {
    init_logging();
    let mut relay = MockRelay::spawn(Vec::new()).await;
    let store = open_store().await;
    let handle = SyncClientBuilder::new(&relay.url, store.clone()).build().start();
    relay.next_inbound().await;
    wait_connected(&handle).await;
    let store = &store;

    // Garbage and unknown types are skipped without dropping the connection.
    relay.push_raw("not json");
    relay.push_raw(r#"{"type":"mystery","data":{}}"#);
    relay.push(&ServerMessage::TaskCreated(remote_task("r9", "Call grandpa")));
    eventually(|| async move { store.get_task("r9").await.unwrap().is_some() }).await;

    let mut done = remote_task("r9", "Call grandpa");
    done.is_completed = true;
    relay.push(&ServerMessage::TaskUpdated(done.clone()));
    eventually(|| async move {
        store
            .get_task("r9")
            .await
            .unwrap()
            .is_some_and(|t| t.is_completed)
    })
    .await;

    relay.push(&ServerMessage::TaskDeleted(done));
    eventually(|| async move { store.get_task("r9").await.unwrap().is_none() }).await;
    assert!(handle.status().is_connected());
}

#[tokio::test]
async fn test_send_while_disconnected_fails() {
    init_logging();
    // Reserve a port, then free it so nothing is listening.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/ws", listener.local_addr().unwrap());
    drop(listener);

    let store = open_store().await;
    let handle = SyncClientBuilder::new(&url, store.clone())
        .with_reconnect_delay(Duration::from_millis(50))
        .build()
        .start();

    wait_failed(&handle).await;

    let task = store.create_task(NewTask::new("Nap", "phone")).await.unwrap();
    assert!(matches!(
        handle.create_task(&task).await,
        Err(SyncError::NotConnected)
    ));
    // Dropped sends leave the local row pending.
    assert!(store.get_task(&task.record_id).await.unwrap().unwrap().needs_sync);
}

#[tokio::test]
async fn test_reconnects_after_connection_drop() {
    init_logging();
    let mut relay = MockRelay::spawn(vec![remote_task("r1", "Buy bread")]).await;
    let store = open_store().await;
    let handle = SyncClientBuilder::new(&relay.url, store.clone())
        .with_reconnect_delay(Duration::from_millis(100))
        .build()
        .start();

    assert_eq!(relay.next_inbound().await, ClientMessage::Ping);
    wait_connected(&handle).await;
    assert!(store.get_task("r2").await.unwrap().is_none());

    // Another device added a task while this one was away.
    relay.set_snapshot(vec![
        remote_task("r1", "Buy bread"),
        remote_task("r2", "Walk the dog"),
    ]);
    relay.drop_connections();

    // A fresh socket starts with a fresh ping, and the new snapshot lands.
    assert_eq!(relay.next_inbound().await, ClientMessage::Ping);
    wait_connected(&handle).await;
    let store = &store;
    eventually(|| async move { store.get_task("r2").await.unwrap().is_some() }).await;
    assert_eq!(store.tasks().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_sends_during_reconnect_wait_are_not_replayed() {
    init_logging();
    let mut relay = MockRelay::spawn(Vec::new()).await;
    let store = open_store().await;
    let handle = SyncClientBuilder::new(&relay.url, store.clone())
        .with_reconnect_delay(Duration::from_millis(500))
        .build()
        .start();
    assert_eq!(relay.next_inbound().await, ClientMessage::Ping);
    wait_connected(&handle).await;

    relay.drop_connections();
    wait_failed(&handle).await;
    let handle_ref = &handle;
    eventually(|| async move { !handle_ref.is_connected() }).await;

    let task = store.create_task(NewTask::new("Pack lunch", "phone")).await.unwrap();
    assert!(matches!(
        handle.create_task(&task).await,
        Err(SyncError::NotConnected)
    ));

    assert_eq!(relay.next_inbound().await, ClientMessage::Ping);
    wait_connected(&handle).await;

    // The next frame after the reconnect ping is this ping, not the create.
    handle.ping().await.unwrap();
    assert_eq!(relay.next_inbound().await, ClientMessage::Ping);
    assert!(store.get_task(&task.record_id).await.unwrap().unwrap().needs_sync);
}

#[tokio::test]
async fn test_run_without_handle_keeps_serving() {
    init_logging();
    let mut relay = MockRelay::spawn(vec![remote_task("r1", "Buy bread")]).await;
    let store = open_store().await;
    let client = SyncClientBuilder::new(&relay.url, store.clone())
        .with_reconnect_delay(Duration::from_millis(100))
        .build();
    let running = tokio::spawn(client.run());

    assert_eq!(relay.next_inbound().await, ClientMessage::Ping);
    let store = &store;
    eventually(|| async move { store.get_task("r1").await.unwrap().is_some() }).await;

    relay.push(&ServerMessage::TaskCreated(remote_task("r2", "Water plants")));
    eventually(|| async move { store.get_task("r2").await.unwrap().is_some() }).await;

    relay.drop_connections();
    assert_eq!(relay.next_inbound().await, ClientMessage::Ping);
    assert!(!running.is_finished());
    running.abort();
}

#[tokio::test]
async fn test_disconnect_stops_client() {
    init_logging();
    let mut relay = MockRelay::spawn(Vec::new()).await;
    let store = open_store().await;
    let handle = SyncClientBuilder::new(&relay.url, store).build().start();
    relay.next_inbound().await;
    wait_connected(&handle).await;

    handle.disconnect().await;
    let mut rx = handle.status_rx();
    timeout(WAIT, rx.wait_for(|s| *s == ConnectionStatus::Disconnected))
        .await
        .expect("Timed out waiting for disconnect")
        .unwrap();

    assert!(!handle.is_connected());
    assert!(matches!(handle.ping().await, Err(SyncError::Closed)));
}
