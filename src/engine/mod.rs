//! Event loop engine: one background task per user that keeps the local
//! store converged with the remote event log.
//!
//! [`spawn_event_loop`] starts the task and returns a handle. The loop
//! polls on a timer, on demand through [`EventLoopHandle::poll_now`], and
//! immediately again whenever an event announces more pending data. A
//! fatal classification (credential errors) logs the user out and ends
//! the task; an engine is spawn-once and a fresh login builds a new one.

mod apply;
mod classify;
mod event_loop;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::constants::{POLL_CHANNEL_CAPACITY, STOP_GRACE_TIMEOUT};
use crate::events::EventBus;
use crate::remote::{EventClient, UserSession};
use crate::store::Store;

use event_loop::EventLoop;

/// Handle for controlling a running event loop.
pub struct EventLoopHandle {
    poll_tx: mpsc::Sender<oneshot::Sender<()>>,
    stop_tx: mpsc::Sender<()>,
    stopped_rx: std::sync::Mutex<Option<oneshot::Receiver<()>>>,
    running: Arc<AtomicBool>,
}

/// Spawn the event loop for one user and return a handle to control it.
pub fn spawn_event_loop(
    store: Arc<Store>,
    client: Arc<dyn EventClient>,
    user: Arc<dyn UserSession>,
    bus: EventBus,
    poll_interval: Duration,
) -> EventLoopHandle {
    let (poll_tx, poll_rx) = mpsc::channel(POLL_CHANNEL_CAPACITY);
    let (stop_tx, stop_rx) = mpsc::channel(1);
    let (notify_stopped, stopped_rx) = oneshot::channel();
    let running = Arc::new(AtomicBool::new(true));

    let engine = EventLoop::new(
        store,
        client,
        user,
        bus,
        poll_interval,
        poll_rx,
        stop_rx,
        Arc::clone(&running),
        notify_stopped,
    );
    tokio::spawn(engine.run());

    EventLoopHandle {
        poll_tx,
        stop_tx,
        stopped_rx: std::sync::Mutex::new(Some(stopped_rx)),
        running,
    }
}

impl EventLoopHandle {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Poll right away and wait until the resulting iteration has fetched
    /// and applied its event (or concluded with a swallowed error), so
    /// callers observe the store after that event. Overlapping calls are
    /// serialized by the loop. A no-op once the loop has stopped.
    pub async fn poll_now(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.poll_tx.send(done_tx).await.is_err() {
            return;
        }
        done_rx.await.ok();
    }

    /// Signal the loop to stop and wait up to the grace timeout for it to
    /// acknowledge. The loop finishes its current event either way.
    pub async fn stop(&self) {
        if !self.is_running() {
            return;
        }

        self.stop_tx.try_send(()).ok();

        let receiver = self.stopped_rx.lock().unwrap().take();
        if let Some(receiver) = receiver {
            match tokio::time::timeout(STOP_GRACE_TIMEOUT, receiver).await {
                Ok(_) => tracing::info!("Event loop was stopped"),
                Err(_) => tracing::warn!("Timed out waiting for event loop to stop"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use std::sync::atomic::AtomicU32;
    use std::time::Instant;

    use async_trait::async_trait;
    use tokio::sync::broadcast::error::TryRecvError;

    use crate::events::BridgeEvent;
    use crate::remote::types::{
        Address, AddressDelta, DeltaAction, Event, Label, LabelDelta, LabelKind, Message,
        MessageCount, MessageDelta, MessageFlags, MessagePatch, RefreshFlags,
    };
    use crate::remote::RemoteError;
    use crate::store::ImapUpdate;

    /// Poll interval long enough that tests are driven purely by the
    /// startup poll and `poll_now`.
    const TEST_POLL_INTERVAL: Duration = Duration::from_secs(3600);
    const USER_ID: &str = "user-1";

    struct ScriptedClient {
        /// Responses popped per `get_event` call; when exhausted the
        /// client answers with a no-op event echoing the cursor.
        responses: Mutex<VecDeque<Result<Event, RemoteError>>>,
        seen_since_ids: Mutex<Vec<String>>,
        fetches: Mutex<HashMap<String, Result<Option<Message>, RemoteError>>>,
        addresses: Mutex<Vec<Address>>,
        /// Address list installed by the next `update_profile`.
        next_addresses: Mutex<Option<Vec<Address>>>,
        get_event_delay: Option<Duration>,
    }

    impl ScriptedClient {
        fn new(responses: Vec<Result<Event, RemoteError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into_iter().collect()),
                seen_since_ids: Mutex::new(Vec::new()),
                fetches: Mutex::new(HashMap::new()),
                addresses: Mutex::new(Vec::new()),
                next_addresses: Mutex::new(None),
                get_event_delay: None,
            })
        }
    }

    #[async_trait]
    impl EventClient for ScriptedClient {
        async fn get_event(&self, since_id: &str) -> Result<Event, RemoteError> {
            if let Some(delay) = self.get_event_delay {
                tokio::time::sleep(delay).await;
            }
            self.seen_since_ids
                .lock()
                .unwrap()
                .push(since_id.to_string());
            match self.responses.lock().unwrap().pop_front() {
                Some(response) => response,
                None => Ok(Event {
                    event_id: since_id.to_string(),
                    ..Event::default()
                }),
            }
        }

        async fn fetch_message(&self, message_id: &str) -> Result<Option<Message>, RemoteError> {
            self.fetches
                .lock()
                .unwrap()
                .get(message_id)
                .cloned()
                .unwrap_or(Ok(None))
        }

        fn addresses(&self) -> Vec<Address> {
            self.addresses.lock().unwrap().clone()
        }
    }

    struct TestUser {
        client: Arc<ScriptedClient>,
        logouts: AtomicU32,
        closed_connections: Mutex<Vec<String>>,
        profile_failure: Mutex<Option<RemoteError>>,
    }

    impl TestUser {
        fn new(client: Arc<ScriptedClient>) -> Arc<Self> {
            Arc::new(Self {
                client,
                logouts: AtomicU32::new(0),
                closed_connections: Mutex::new(Vec::new()),
                profile_failure: Mutex::new(None),
            })
        }
    }

    #[async_trait]
    impl UserSession for TestUser {
        fn id(&self) -> &str {
            USER_ID
        }

        async fn update_profile(&self) -> Result<(), RemoteError> {
            if let Some(err) = self.profile_failure.lock().unwrap().clone() {
                return Err(err);
            }
            if let Some(next) = self.client.next_addresses.lock().unwrap().take() {
                *self.client.addresses.lock().unwrap() = next;
            }
            Ok(())
        }

        async fn logout(&self) -> anyhow::Result<()> {
            self.logouts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn primary_email(&self) -> String {
            self.client
                .addresses()
                .first()
                .map(|a| a.email.clone())
                .unwrap_or_default()
        }

        fn active_emails(&self) -> Vec<String> {
            self.client
                .addresses()
                .into_iter()
                .filter(|a| a.receive)
                .map(|a| a.email)
                .collect()
        }

        async fn close_connection(&self, email: &str) {
            self.closed_connections
                .lock()
                .unwrap()
                .push(email.to_string());
        }
    }

    struct Harness {
        store: Arc<Store>,
        client: Arc<ScriptedClient>,
        user: Arc<TestUser>,
        /// Subscribed before the engine is spawned so no emission is missed.
        events: tokio::sync::broadcast::Receiver<BridgeEvent>,
        handle: EventLoopHandle,
    }

    async fn spawn_harness(
        responses: Vec<Result<Event, RemoteError>>,
        initial_cursor: Option<&str>,
    ) -> Harness {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        if let Some(cursor) = initial_cursor {
            store.set_event_id(USER_ID, cursor).await.unwrap();
        }
        // Silence the per-iteration sync nudge so tests observe only the
        // triggers the scenario itself causes.
        store.sync().set_sync_finished(true);

        let client = ScriptedClient::new(responses);
        let user = TestUser::new(Arc::clone(&client));
        let bus = EventBus::new();
        let events = bus.subscribe();

        let handle = spawn_event_loop(
            Arc::clone(&store),
            client.clone() as Arc<dyn EventClient>,
            user.clone() as Arc<dyn UserSession>,
            bus,
            TEST_POLL_INTERVAL,
        );

        Harness {
            store,
            client,
            user,
            events,
            handle,
        }
    }

    fn event(id: &str) -> Event {
        Event {
            event_id: id.to_string(),
            ..Event::default()
        }
    }

    fn message_create(id: &str, labels: &[&str]) -> MessageDelta {
        MessageDelta {
            id: id.to_string(),
            action: DeltaAction::Create,
            created: Some(Message {
                id: id.to_string(),
                time: 1700000000,
                subject: format!("Subject {}", id),
                unread: true,
                flags: MessageFlags::RECEIVED,
                label_ids: labels.iter().map(|l| l.to_string()).collect(),
                ..Message::default()
            }),
            updated: None,
        }
    }

    async fn wait_for_cursor(store: &Store, expected: &str) {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            if store.get_event_id(USER_ID).await.unwrap() == expected {
                return;
            }
            assert!(
                Instant::now() < deadline,
                "cursor never reached {expected:?}"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn wait_until_stopped(handle: &EventLoopHandle) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while handle.is_running() {
            assert!(Instant::now() < deadline, "engine never stopped");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn drain_events(rx: &mut tokio::sync::broadcast::Receiver<BridgeEvent>) -> Vec<BridgeEvent> {
        let mut events = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(event) => events.push(event),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return events,
                Err(TryRecvError::Lagged(_)) => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_cold_start_offline_then_recovers() {
        // Startup poll: cursor is empty, both the head fetch and the
        // event fetch fail offline.
        let mut harness = spawn_harness(
            vec![
                Err(RemoteError::NotReachable),
                Err(RemoteError::NotReachable),
                // Next iteration: head event arrives, then a no-op fetch.
                Ok(event("e0")),
                Ok(event("e0")),
            ],
            None,
        )
        .await;

        harness.handle.poll_now().await;
        harness.handle.poll_now().await;

        assert_eq!(harness.store.get_event_id(USER_ID).await.unwrap(), "e0");
        assert!(harness.handle.is_running());

        let seen = drain_events(&mut harness.events);
        assert!(seen.contains(&BridgeEvent::InternetOff));
        assert!(seen.contains(&BridgeEvent::InternetOn));

        // The head was fetched with an empty since-id, never replaying
        // history.
        let since_ids = harness.client.seen_since_ids.lock().unwrap().clone();
        assert_eq!(since_ids[0], "");

        harness.handle.stop().await;
    }

    #[tokio::test]
    async fn test_message_create_then_flag_update() {
        let mut create = event("e1");
        create.messages = vec![message_create("m1", &["INBOX"])];

        let mut update = event("e2");
        update.messages = vec![MessageDelta {
            id: "m1".to_string(),
            action: DeltaAction::UpdateFlags,
            created: None,
            updated: Some(MessagePatch {
                time: 1700000000,
                unread: Some(false),
                flags: Some(MessageFlags::RECEIVED | MessageFlags::ANSWERED),
                ..MessagePatch::default()
            }),
        }];

        let harness = spawn_harness(
            vec![Ok(event("e0")), Ok(create), Ok(update)],
            Some("e0"),
        )
        .await;

        harness.handle.poll_now().await;
        let stored = harness
            .store
            .get_message(USER_ID, "m1")
            .await
            .unwrap()
            .unwrap();
        assert!(stored.unread);
        assert_eq!(harness.store.get_event_id(USER_ID).await.unwrap(), "e1");

        harness.handle.poll_now().await;
        let stored = harness
            .store
            .get_message(USER_ID, "m1")
            .await
            .unwrap()
            .unwrap();
        assert!(!stored.unread);
        assert!(stored.flags.contains(MessageFlags::ANSWERED));
        assert_eq!(harness.store.get_event_id(USER_ID).await.unwrap(), "e2");

        harness.handle.stop().await;
    }

    #[tokio::test]
    async fn test_update_for_unknown_message_is_skipped() {
        let mut update = event("e3");
        update.messages = vec![MessageDelta {
            id: "mX".to_string(),
            action: DeltaAction::Update,
            created: None,
            updated: Some(MessagePatch {
                time: 42,
                subject: Some("ghost".to_string()),
                ..MessagePatch::default()
            }),
        }];

        // The remote does not know mX either; the update is stale.
        let harness =
            spawn_harness(vec![Ok(event("e2")), Ok(update)], Some("e2")).await;
        harness.handle.poll_now().await;

        assert!(
            harness
                .store
                .get_message(USER_ID, "mX")
                .await
                .unwrap()
                .is_none()
        );
        assert_eq!(harness.store.get_event_id(USER_ID).await.unwrap(), "e3");

        harness.handle.stop().await;
    }

    #[tokio::test]
    async fn test_update_falls_back_to_remote_fetch() {
        let mut update = event("e1");
        update.messages = vec![MessageDelta {
            id: "m7".to_string(),
            action: DeltaAction::Update,
            created: None,
            updated: Some(MessagePatch {
                time: 50,
                unread: Some(false),
                ..MessagePatch::default()
            }),
        }];

        let harness =
            spawn_harness(vec![Ok(event("e0")), Ok(update)], Some("e0")).await;
        harness.client.fetches.lock().unwrap().insert(
            "m7".to_string(),
            Ok(Some(Message {
                id: "m7".to_string(),
                time: 10,
                subject: "fetched".to_string(),
                unread: true,
                label_ids: vec!["INBOX".to_string()],
                ..Message::default()
            })),
        );

        harness.handle.poll_now().await;

        let stored = harness
            .store
            .get_message(USER_ID, "m7")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.subject, "fetched");
        assert_eq!(stored.time, 50);
        assert!(!stored.unread);

        harness.handle.stop().await;
    }

    #[tokio::test]
    async fn test_sparse_label_patch_reconciles() {
        let mut create = event("e1");
        create.messages = vec![message_create("m1", &["L1", "L2"])];

        let mut patch = event("e4");
        patch.messages = vec![MessageDelta {
            id: "m1".to_string(),
            action: DeltaAction::Update,
            created: None,
            updated: Some(MessagePatch {
                time: 1700000000,
                label_ids_added: vec!["L3".to_string()],
                label_ids_removed: vec!["L1".to_string()],
                ..MessagePatch::default()
            }),
        }];

        let harness = spawn_harness(
            vec![Ok(event("e0")), Ok(create), Ok(patch)],
            Some("e0"),
        )
        .await;

        harness.handle.poll_now().await;
        harness.handle.poll_now().await;

        let stored = harness
            .store
            .get_message(USER_ID, "m1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.label_ids, vec!["L2", "L3"]);

        harness.handle.stop().await;
    }

    #[tokio::test]
    async fn test_refresh_skips_appliers_and_triggers_sync() {
        let mut refresh = event("e5");
        refresh.refresh = RefreshFlags::MAIL;
        // These deltas must be ignored.
        refresh.messages = vec![message_create("mIgnored", &["INBOX"])];

        let harness =
            spawn_harness(vec![Ok(event("e4")), Ok(refresh)], Some("e4")).await;
        let mut sync_requests = harness.store.take_sync_requests().unwrap();

        harness.handle.poll_now().await;

        assert_eq!(harness.store.get_event_id(USER_ID).await.unwrap(), "e5");
        assert!(
            harness
                .store
                .get_message(USER_ID, "mIgnored")
                .await
                .unwrap()
                .is_none()
        );
        assert!(!harness.store.sync().is_sync_finished());
        assert!(sync_requests.try_recv().is_ok());

        harness.handle.stop().await;
    }

    #[tokio::test]
    async fn test_invalid_token_is_fatal_and_logs_out_once() {
        let mut harness =
            spawn_harness(vec![Err(RemoteError::InvalidToken)], Some("e5")).await;

        wait_until_stopped(&harness.handle).await;

        assert_eq!(harness.user.logouts.load(Ordering::SeqCst), 1);
        // No connectivity event for a credential failure.
        assert!(drain_events(&mut harness.events).is_empty());
        // The cursor did not move.
        assert_eq!(harness.store.get_event_id(USER_ID).await.unwrap(), "e5");

        // The engine is spawn-once: further control calls are no-ops.
        harness.handle.poll_now().await;
        harness.handle.stop().await;
        assert!(!harness.handle.is_running());
    }

    #[tokio::test]
    async fn test_unauthorized_is_fatal() {
        let harness =
            spawn_harness(vec![Err(RemoteError::Unauthorized)], Some("e1")).await;
        wait_until_stopped(&harness.handle).await;
        assert_eq!(harness.user.logouts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_upgrade_required_keeps_polling() {
        let mut harness = spawn_harness(
            vec![Ok(event("e0")), Err(RemoteError::UpgradeApplication)],
            Some("e0"),
        )
        .await;

        harness.handle.poll_now().await;
        harness.handle.poll_now().await;

        assert!(harness.handle.is_running());
        assert!(drain_events(&mut harness.events).contains(&BridgeEvent::UpgradeApplication));
        assert_eq!(harness.user.logouts.load(Ordering::SeqCst), 0);

        harness.handle.stop().await;
    }

    #[tokio::test]
    async fn test_more_flag_chains_fetches_without_timer() {
        let mut first = event("e1");
        first.more = true;
        first.messages = vec![message_create("m1", &["INBOX"])];

        let mut second = event("e2");
        second.messages = vec![message_create("m2", &["INBOX"])];

        let harness = spawn_harness(vec![Ok(first), Ok(second)], Some("e0")).await;

        // The startup poll applies e1; More chains straight into e2 with
        // the ticker still hours away.
        wait_for_cursor(&harness.store, "e2").await;
        assert!(
            harness
                .store
                .get_message(USER_ID, "m2")
                .await
                .unwrap()
                .is_some()
        );

        harness.handle.stop().await;
    }

    #[tokio::test]
    async fn test_poll_now_observes_applied_event() {
        let mut create = event("e1");
        create.messages = vec![message_create("m1", &["INBOX"])];

        let harness =
            spawn_harness(vec![Ok(event("e0")), Ok(create)], Some("e0")).await;

        // First poll_now rides behind the startup iteration; the second
        // consumes the create event. By the time it returns, both the
        // store and the cursor must reflect e1.
        harness.handle.poll_now().await;
        harness.handle.poll_now().await;

        assert!(
            harness
                .store
                .get_message(USER_ID, "m1")
                .await
                .unwrap()
                .is_some()
        );
        assert_eq!(harness.store.get_event_id(USER_ID).await.unwrap(), "e1");

        harness.handle.stop().await;
    }

    #[tokio::test]
    async fn test_address_deltas_emit_lifecycle_events() {
        let initial = vec![
            Address {
                id: "a1".to_string(),
                email: "primary@example.com".to_string(),
                receive: true,
            },
            Address {
                id: "a2".to_string(),
                email: "gone@example.com".to_string(),
                receive: true,
            },
        ];
        let refreshed = vec![
            Address {
                id: "a1".to_string(),
                email: "primary@example.com".to_string(),
                receive: false,
            },
            Address {
                id: "a3".to_string(),
                email: "new@example.com".to_string(),
                receive: true,
            },
        ];

        let mut address_event = event("e1");
        address_event.addresses = vec![
            AddressDelta {
                id: "a3".to_string(),
                action: DeltaAction::Create,
                address: Some(refreshed[1].clone()),
            },
            AddressDelta {
                id: "a1".to_string(),
                action: DeltaAction::Update,
                address: Some(refreshed[0].clone()),
            },
            AddressDelta {
                id: "a2".to_string(),
                action: DeltaAction::Delete,
                address: None,
            },
        ];

        let mut harness =
            spawn_harness(vec![Ok(event("e0")), Ok(address_event)], Some("e0")).await;
        *harness.client.addresses.lock().unwrap() = initial;
        *harness.client.next_addresses.lock().unwrap() = Some(refreshed.clone());

        harness.handle.poll_now().await;
        harness.handle.poll_now().await;

        let seen = drain_events(&mut harness.events);
        assert!(seen.contains(&BridgeEvent::AddressChanged(
            "primary@example.com".to_string()
        )));
        // Receive flip on a1 and deletion of a2 both invalidate sessions.
        assert!(seen.contains(&BridgeEvent::AddressChangedLogout(
            "primary@example.com".to_string()
        )));
        assert!(seen.contains(&BridgeEvent::AddressChangedLogout(
            "gone@example.com".to_string()
        )));
        assert_eq!(
            *harness.user.closed_connections.lock().unwrap(),
            vec!["gone@example.com"]
        );

        // The refreshed list landed in the store.
        assert_eq!(harness.store.addresses(USER_ID).await.unwrap(), refreshed);

        harness.handle.stop().await;
    }

    #[tokio::test]
    async fn test_profile_update_failure_logs_out_but_is_not_fatal() {
        let mut address_event = event("e1");
        address_event.addresses = vec![AddressDelta {
            id: "a1".to_string(),
            action: DeltaAction::Create,
            address: None,
        }];

        let harness =
            spawn_harness(vec![Ok(event("e0")), Ok(address_event)], Some("e0")).await;
        *harness.user.profile_failure.lock().unwrap() =
            Some(RemoteError::Other("profile fetch failed".to_string()));

        harness.handle.poll_now().await;
        harness.handle.poll_now().await;

        // Applier failure logged the user out, but a generic error does
        // not kill the loop.
        assert_eq!(harness.user.logouts.load(Ordering::SeqCst), 1);
        assert!(harness.handle.is_running());
        // The failed event was not committed.
        assert_eq!(harness.store.get_event_id(USER_ID).await.unwrap(), "e0");

        harness.handle.stop().await;
    }

    #[tokio::test]
    async fn test_label_deltas_upsert_and_delete() {
        let label = Label {
            id: "L1".to_string(),
            name: "Work".to_string(),
            color: String::new(),
            hidden: false,
            kind: LabelKind::Folder,
        };

        let mut create = event("e1");
        create.labels = vec![LabelDelta {
            id: "L1".to_string(),
            action: DeltaAction::Create,
            label: Some(label.clone()),
        }];

        let mut delete = event("e2");
        delete.labels = vec![LabelDelta {
            id: "L1".to_string(),
            action: DeltaAction::Delete,
            label: None,
        }];

        let harness = spawn_harness(
            vec![Ok(event("e0")), Ok(create), Ok(delete)],
            Some("e0"),
        )
        .await;

        harness.handle.poll_now().await;
        assert_eq!(
            harness.store.get_mailbox(USER_ID, "L1").await.unwrap(),
            Some(label)
        );

        harness.handle.poll_now().await;
        assert!(
            harness
                .store
                .get_mailbox(USER_ID, "L1")
                .await
                .unwrap()
                .is_none()
        );

        harness.handle.stop().await;
    }

    #[tokio::test]
    async fn test_count_drift_triggers_sync() {
        let mut counts = event("e1");
        counts.message_counts = vec![MessageCount {
            label_id: "INBOX".to_string(),
            total: 12,
            unread: 3,
        }];

        let harness =
            spawn_harness(vec![Ok(event("e0")), Ok(counts)], Some("e0")).await;
        let mut sync_requests = harness.store.take_sync_requests().unwrap();

        harness.handle.poll_now().await;
        harness.handle.poll_now().await;

        // The local store is empty, so the reported counts diverge.
        assert!(sync_requests.try_recv().is_ok());
        assert!(!harness.store.sync().is_sync_finished());

        harness.handle.stop().await;
    }

    #[tokio::test]
    async fn test_notices_alert_every_active_address() {
        let mut notice = event("e1");
        notice.notices = vec!["scheduled maintenance".to_string()];

        let harness =
            spawn_harness(vec![Ok(event("e0")), Ok(notice)], Some("e0")).await;
        *harness.client.addresses.lock().unwrap() = vec![
            Address {
                id: "a1".to_string(),
                email: "one@example.com".to_string(),
                receive: true,
            },
            Address {
                id: "a2".to_string(),
                email: "two@example.com".to_string(),
                receive: true,
            },
        ];

        let (tx, mut rx) = mpsc::channel(8);
        harness.store.set_imap_update_channel(tx);

        harness.handle.poll_now().await;
        harness.handle.poll_now().await;

        for expected in ["one@example.com", "two@example.com"] {
            match rx.try_recv().unwrap() {
                ImapUpdate::Status { address, info } => {
                    assert_eq!(address, expected);
                    assert_eq!(info, "scheduled maintenance");
                }
                other => panic!("unexpected update {other:?}"),
            }
        }

        harness.handle.stop().await;
    }

    #[tokio::test]
    async fn test_stop_returns_within_grace_while_engine_is_wedged() {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        store.set_event_id(USER_ID, "e0").await.unwrap();
        store.sync().set_sync_finished(true);

        // A client that hangs far beyond the grace timeout.
        let client = Arc::new(ScriptedClient {
            responses: Mutex::new(VecDeque::new()),
            seen_since_ids: Mutex::new(Vec::new()),
            fetches: Mutex::new(HashMap::new()),
            addresses: Mutex::new(Vec::new()),
            next_addresses: Mutex::new(None),
            get_event_delay: Some(Duration::from_secs(30)),
        });
        let user = TestUser::new(Arc::clone(&client));

        let handle = spawn_event_loop(
            store,
            client as Arc<dyn EventClient>,
            user as Arc<dyn UserSession>,
            EventBus::new(),
            TEST_POLL_INTERVAL,
        );

        // Let the startup iteration wedge inside get_event.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = Instant::now();
        handle.stop().await;
        let elapsed = started.elapsed();

        assert!(elapsed >= STOP_GRACE_TIMEOUT);
        assert!(elapsed < STOP_GRACE_TIMEOUT + Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_replaying_an_event_is_a_noop() {
        let mut create = event("e1");
        create.messages = vec![message_create("m1", &["INBOX", "L2"])];
        let replay = create.clone();

        let harness = spawn_harness(
            vec![Ok(event("e0")), Ok(create), Ok(replay)],
            Some("e0"),
        )
        .await;

        harness.handle.poll_now().await;
        harness.handle.poll_now().await;
        let first = harness
            .store
            .get_message(USER_ID, "m1")
            .await
            .unwrap()
            .unwrap();

        harness.handle.poll_now().await;
        let second = harness
            .store
            .get_message(USER_ID, "m1")
            .await
            .unwrap()
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(harness.store.get_event_id(USER_ID).await.unwrap(), "e1");

        harness.handle.stop().await;
    }
}
