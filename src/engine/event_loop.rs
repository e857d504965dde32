//! The per-user event loop: polls the remote event log, applies deltas,
//! and advances the durable cursor.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};

use crate::events::{BridgeEvent, EventBus};
use crate::remote::{EventClient, UserSession};
use crate::store::Store;

use super::classify::{classify, fd_near_ulimit};

pub(crate) struct EventLoop {
    pub(crate) user_id: String,
    pub(crate) current_event_id: String,
    pub(crate) has_internet: bool,

    pub(crate) store: Arc<Store>,
    pub(crate) client: Arc<dyn EventClient>,
    pub(crate) user: Arc<dyn UserSession>,
    pub(crate) bus: EventBus,

    poll_interval: Duration,
    poll_rx: mpsc::Receiver<oneshot::Sender<()>>,
    stop_rx: mpsc::Receiver<()>,
    running: Arc<AtomicBool>,
    notify_stopped: Option<oneshot::Sender<()>>,
}

impl EventLoop {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        store: Arc<Store>,
        client: Arc<dyn EventClient>,
        user: Arc<dyn UserSession>,
        bus: EventBus,
        poll_interval: Duration,
        poll_rx: mpsc::Receiver<oneshot::Sender<()>>,
        stop_rx: mpsc::Receiver<()>,
        running: Arc<AtomicBool>,
        notify_stopped: oneshot::Sender<()>,
    ) -> Self {
        Self {
            user_id: user.id().to_string(),
            current_event_id: String::new(),
            has_internet: true,
            store,
            client,
            user,
            bus,
            poll_interval,
            poll_rx,
            stop_rx,
            running,
            notify_stopped: Some(notify_stopped),
        }
    }

    pub(crate) async fn run(mut self) {
        self.current_event_id = match self.store.get_event_id(&self.user_id).await {
            Ok(id) => id,
            Err(err) => {
                tracing::warn!("Could not read persisted event cursor: {err:#}");
                String::new()
            }
        };

        tracing::info!(
            user_id = %self.user_id,
            last_event_id = %self.current_event_id,
            "Subscribed to event stream"
        );

        let mut ticker = tokio::time::interval_at(
            Instant::now() + self.poll_interval,
            self.poll_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Poll immediately on startup; afterwards the ticker takes over.
        let mut rearm = true;

        loop {
            let mut poll_done: Option<oneshot::Sender<()>> = None;

            if rearm {
                rearm = false;
                // A stop issued between rearm and this iteration still wins.
                match self.stop_rx.try_recv() {
                    Ok(()) | Err(mpsc::error::TryRecvError::Disconnected) => break,
                    Err(mpsc::error::TryRecvError::Empty) => {}
                }
            } else {
                tokio::select! {
                    _ = self.stop_rx.recv() => break,
                    request = self.poll_rx.recv() => match request {
                        Some(done) => poll_done = Some(done),
                        None => break,
                    },
                    _ = ticker.tick() => {}
                }
            }

            // First run for this user: initialize the cursor to the
            // current head so history is not replayed. Failure here is
            // expected offline; the next iteration retries.
            if self.current_event_id.is_empty() {
                if let Err(err) = self.init_event_id().await {
                    tracing::warn!("Could not set initial event id: {err:#}");
                }
            }

            // Nudge the full sync if it has not completed yet; it runs
            // independently of event processing.
            if !self.store.sync().is_sync_finished() {
                self.store.sync().trigger_sync();
            }

            let result = self.process_next_event().await;

            // The poll caller observes that this iteration's event has
            // been fetched and applied (or its failure classified).
            if let Some(done) = poll_done.take() {
                done.send(()).ok();
            }

            match result {
                Ok(more) => {
                    if more {
                        rearm = true;
                    }
                }
                Err(err) => {
                    tracing::error!("Cannot process event, stopping event loop: {err:#}");
                    // The loop cannot restart without a fresh credential,
                    // so a fatal error means the user is logged out.
                    if let Err(logout_err) = self.user.logout().await {
                        tracing::error!(
                            "Failed to logout user after event loop error: {logout_err:#}"
                        );
                    }
                    break;
                }
            }
        }

        self.running.store(false, Ordering::Release);
        if let Some(notify) = self.notify_stopped.take() {
            notify.send(()).ok();
        }
        tracing::info!(
            user_id = %self.user_id,
            last_event_id = %self.current_event_id,
            "Event stream subscription stopped"
        );
    }

    /// Initialize the cursor from the current head event without
    /// replaying history.
    async fn init_event_id(&mut self) -> Result<()> {
        tracing::trace!("Setting first event id");

        let event = self
            .client
            .get_event("")
            .await
            .context("failed to fetch head event")?;

        self.current_event_id = event.event_id;
        self.store
            .set_event_id(&self.user_id, &self.current_event_id)
            .await
            .context("failed to persist initial event id")?;

        Ok(())
    }

    /// One fetch-apply-advance step. `Ok(more)` asks the caller to poll
    /// again without waiting for the ticker; `Err` is fatal and stops
    /// the loop.
    async fn process_next_event(&mut self) -> Result<bool> {
        match self.poll_and_apply().await {
            Ok(more) => Ok(more),
            Err(err) => {
                let classification = classify(&err, fd_near_ulimit());

                if classification.offline {
                    tracing::warn!("Remote service unreachable");
                    self.bus.emit(BridgeEvent::InternetOff);
                    self.has_internet = false;
                }
                if classification.restart {
                    tracing::warn!("File descriptor usage near ulimit");
                    self.bus.emit(BridgeEvent::RestartBridge);
                }
                if classification.upgrade {
                    tracing::warn!("Application upgrade required");
                    self.bus.emit(BridgeEvent::UpgradeApplication);
                }

                if classification.fatal {
                    Err(err)
                } else {
                    tracing::debug!("Transient event loop error skipped: {err:#}");
                    Ok(false)
                }
            }
        }
    }

    async fn poll_and_apply(&mut self) -> Result<bool> {
        tracing::trace!(current_event_id = %self.current_event_id, "Polling next event");

        let event = self
            .client
            .get_event(&self.current_event_id)
            .await
            .context("failed to fetch next event")?;

        if !self.has_internet {
            self.bus.emit(BridgeEvent::InternetOn);
            self.has_internet = true;
        }

        self.apply_event(&event)
            .await
            .with_context(|| format!("failed to apply event {}", event.event_id))?;

        if self.current_event_id != event.event_id {
            self.current_event_id = event.event_id.clone();
            // A failed write leaves the in-memory cursor advanced so the
            // same event is not reapplied while the process lives; a
            // crash before the next successful write replays it, which
            // the appliers tolerate.
            if let Err(err) = self
                .store
                .set_event_id(&self.user_id, &event.event_id)
                .await
            {
                tracing::warn!("Could not persist event cursor: {err:#}");
            }
        }

        Ok(event.more)
    }
}
