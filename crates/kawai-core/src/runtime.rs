use std::{sync::Arc, time::Instant};

use kawai_client::{AnswerService, ApiKey};
use thiserror::Error;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    debounce::{DebounceSettings, TimerSlot},
    host::{is_escape, HostBridge},
    session::{Effect, FetchTicket, Session, SessionEvent, SessionSnapshot},
};

#[derive(Debug, Clone, Copy, Error)]
#[error("palette session has shut down")]
pub struct PaletteClosed;

/// Sending side of a running palette session.
#[derive(Clone)]
pub struct PaletteHandle {
    events: mpsc::UnboundedSender<SessionEvent>,
    snapshots: watch::Receiver<SessionSnapshot>,
}

impl PaletteHandle {
    pub fn show(&self) -> Result<(), PaletteClosed> {
        self.send(SessionEvent::Mounted)
    }

    pub fn set_query(&self, text: impl Into<String>) -> Result<(), PaletteClosed> {
        self.send(SessionEvent::QueryChanged(text.into()))
    }

    pub fn clear_and_focus(&self) -> Result<(), PaletteClosed> {
        self.send(SessionEvent::ClearAndFocus)
    }

    /// Forwards a key observation; only `Escape` does anything.
    pub fn key(&self, key: &str) -> Result<(), PaletteClosed> {
        if is_escape(key) {
            self.send(SessionEvent::EscapePressed)
        } else {
            Ok(())
        }
    }

    pub fn unmount(&self) -> Result<(), PaletteClosed> {
        self.send(SessionEvent::Unmount)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.clone()
    }

    fn send(&self, event: SessionEvent) -> Result<(), PaletteClosed> {
        self.events.send(event).map_err(|_| PaletteClosed)
    }
}

#[derive(Clone)]
pub struct PaletteRuntimeBuilder {
    settings: DebounceSettings,
    service: AnswerService,
    host: Arc<dyn HostBridge>,
}

impl PaletteRuntimeBuilder {
    pub fn new(service: AnswerService, host: Arc<dyn HostBridge>) -> Self {
        Self {
            settings: DebounceSettings::default(),
            service,
            host,
        }
    }

    #[must_use]
    pub fn debounce(mut self, settings: DebounceSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Starts the session loop on the current runtime and mounts it.
    pub fn spawn(self) -> (PaletteHandle, JoinHandle<()>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session = Session::new(self.settings);
        let (snapshots_tx, snapshots_rx) = watch::channel(session.snapshot());

        let runtime = PaletteRuntime {
            session,
            timer: TimerSlot::new(),
            service: self.service,
            host: self.host,
            events_tx: events_tx.clone(),
            events_rx,
            snapshots: snapshots_tx,
            shutdown: CancellationToken::new(),
        };

        let handle = PaletteHandle {
            events: events_tx,
            snapshots: snapshots_rx,
        };
        (handle, tokio::spawn(runtime.run()))
    }
}

/// Single owner of the [`Session`]. Every mutation happens on this task; timer
/// and fetch tasks only post events back.
struct PaletteRuntime {
    session: Session,
    timer: TimerSlot,
    service: AnswerService,
    host: Arc<dyn HostBridge>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
    snapshots: watch::Sender<SessionSnapshot>,
    shutdown: CancellationToken,
}

impl PaletteRuntime {
    async fn run(mut self) {
        info!(target: "kawai_runtime", "palette session started");
        self.dispatch(SessionEvent::Mounted);

        while !self.shutdown.is_cancelled() {
            let Some(event) = self.events_rx.recv().await else {
                break;
            };
            self.dispatch(event);
        }

        self.timer.cancel();
        self.shutdown.cancel();
        info!(target: "kawai_runtime", "palette session ended");
    }

    fn dispatch(&mut self, event: SessionEvent) {
        debug!(target: "kawai_runtime", event = ?event, "handling event");
        let effects = self.session.handle(event);
        for effect in effects {
            self.apply(effect);
        }
        let next = self.session.snapshot();
        self.snapshots.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next.clone();
                true
            }
        });
    }

    fn apply(&mut self, effect: Effect) {
        match effect {
            Effect::RetrieveSecret => {
                let host = self.host.clone();
                let events = self.events_tx.clone();
                tokio::spawn(async move {
                    let result = host.retrieve_secret().await;
                    let _ = events.send(SessionEvent::SecretResolved(result));
                });
            }
            Effect::ArmTimer { generation, delay } => {
                self.timer.arm(generation, delay, self.events_tx.clone(), |generation| {
                    SessionEvent::TimerFired { generation }
                });
            }
            Effect::CancelTimer => self.timer.cancel(),
            Effect::StartFetch { ticket, api_key } => self.start_fetch(ticket, api_key),
            Effect::FocusInput => self.host.focus_input(),
            Effect::HideWindow => {
                let host = self.host.clone();
                let events = self.events_tx.clone();
                tokio::spawn(async move {
                    if let Err(error) = host.hide_window().await {
                        let _ = events.send(SessionEvent::HideFailed(error));
                    }
                });
            }
            Effect::Shutdown => self.shutdown.cancel(),
        }
    }

    fn start_fetch(&self, ticket: FetchTicket, api_key: Option<ApiKey>) {
        let service = self.service.clone();
        let events = self.events_tx.clone();
        let cancelled = self.shutdown.child_token();

        tokio::spawn(async move {
            let started = Instant::now();
            let outcome = tokio::select! {
                () = cancelled.cancelled() => {
                    debug!(
                        target: "kawai_runtime",
                        generation = ticket.generation,
                        "fetch abandoned on shutdown"
                    );
                    return;
                }
                outcome = service.fetch_answer(api_key.as_ref(), &ticket.query) => outcome,
            };

            let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            match &outcome {
                Ok(_) => info!(
                    target: "kawai_runtime",
                    generation = ticket.generation,
                    latency_ms,
                    success = true,
                    "fetch settled"
                ),
                Err(error) => warn!(
                    target: "kawai_runtime",
                    generation = ticket.generation,
                    latency_ms,
                    error = %error,
                    "fetch failed"
                ),
            }

            let _ = events.send(SessionEvent::FetchSettled { ticket, outcome });
        });
    }
}
