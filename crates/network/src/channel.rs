//! Canal de session avec l'agent
//!
//! Le canal porte la machine d'état de la connexion et isole le contrôleur
//! du transport : les envois ne bloquent jamais, les événements entrants sont
//! relayés dans une file consommée par le contrôleur.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use audio::TransportEnvelope;

use crate::utils::format_duration;
use crate::{
    AgentTransport, ChannelState, ChannelStats, LinkTasks, NetworkConfig, NetworkError, NetworkResult,
    SessionConfig, SessionEvent, TransportLink,
};

/// État partagé entre le canal et sa tâche de relais
///
/// Toutes les transitions passent par ce verrou : une connexion qui aboutit
/// après `close()` le voit et se referme d'elle-même.
struct ChannelInner {
    state: ChannelState,
    state_tx: watch::Sender<ChannelState>,
    outbound: Option<mpsc::Sender<TransportEnvelope>>,
    tasks: Option<LinkTasks>,
    relay: Option<JoinHandle<()>>,
}

impl ChannelInner {
    fn set_state(&mut self, state: ChannelState) {
        if self.state != state {
            debug!(from = %self.state, to = %state, "transition du canal");
            self.state = state;
            self.state_tx.send_replace(state);
        }
    }
}

#[derive(Default)]
struct Counters {
    sent: AtomicU64,
    dropped: AtomicU64,
    received: AtomicU64,
}

fn lock(inner: &Mutex<ChannelInner>) -> MutexGuard<'_, ChannelInner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Canal duplex vers l'agent distant, pour la durée d'un appel
///
/// ```text
/// Idle -> Connecting -> Open -> Closing -> Closed
///              |          |
///              +--> Error <+
/// ```
///
/// # Example
/// ```rust
/// use std::sync::Arc;
/// use network::{NetworkConfig, SessionChannel, SessionConfig, SimulatedTransport};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = NetworkConfig::test_config();
/// let transport = Arc::new(SimulatedTransport::new(config.clone()));
/// let channel = SessionChannel::new(transport, config);
///
/// let mut events = channel.connect(&SessionConfig::audio_only("agent", "consigne")).await?;
/// channel.close().await;
/// # Ok(())
/// # }
/// ```
pub struct SessionChannel {
    transport: Arc<dyn AgentTransport>,
    config: NetworkConfig,
    session_id: u32,
    inner: Arc<Mutex<ChannelInner>>,
    counters: Arc<Counters>,
}

impl SessionChannel {
    pub fn new(transport: Arc<dyn AgentTransport>, config: NetworkConfig) -> Self {
        let (state_tx, _) = watch::channel(ChannelState::Idle);

        Self {
            transport,
            config,
            session_id: fastrand::u32(1..=u32::MAX),
            inner: Arc::new(Mutex::new(ChannelInner {
                state: ChannelState::Idle,
                state_tx,
                outbound: None,
                tasks: None,
                relay: None,
            })),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Identifiant local de la session (pour les logs)
    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    pub fn state(&self) -> ChannelState {
        lock(&self.inner).state
    }

    /// Suit les transitions d'état du canal
    pub fn subscribe_state(&self) -> watch::Receiver<ChannelState> {
        lock(&self.inner).state_tx.subscribe()
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            envelopes_sent: self.counters.sent.load(Ordering::Relaxed),
            envelopes_dropped: self.counters.dropped.load(Ordering::Relaxed),
            events_received: self.counters.received.load(Ordering::Relaxed),
        }
    }

    /// Ouvre la session et rend la file des événements entrants
    ///
    /// Ne réussit qu'une fois l'agent ayant acquitté la session. La file se
    /// termine par `Closed` ou `Error` (ou se ferme après `close()`).
    ///
    /// # Errors
    /// - `InvalidState` si le canal n'est pas `Idle`
    /// - `ConnectionTimeout` / `ConnectionFailed` / `Handshake` : le canal passe en `Error`
    /// - `Cancelled` si `close()` a été appelé pendant la connexion
    pub async fn connect(&self, session: &SessionConfig) -> NetworkResult<mpsc::Receiver<SessionEvent>> {
        {
            let mut inner = lock(&self.inner);
            if inner.state != ChannelState::Idle {
                return Err(NetworkError::invalid_state("connect", inner.state));
            }
            inner.set_state(ChannelState::Connecting);
        }

        info!(
            session_id = self.session_id,
            transport = %self.transport.describe(),
            "🔌 Ouverture de la session"
        );

        let started = Instant::now();
        let opened = match tokio::time::timeout(self.config.connect_timeout, self.transport.open(session)).await {
            Ok(result) => result,
            Err(_) => Err(NetworkError::timeout(self.config.connect_timeout)),
        };

        let link = match opened {
            Ok(link) => link,
            Err(e) => {
                let mut inner = lock(&self.inner);
                if inner.state != ChannelState::Connecting {
                    debug!(session_id = self.session_id, "échec de connexion après fermeture : {}", e);
                    return Err(NetworkError::Cancelled);
                }
                inner.set_state(ChannelState::Error);
                warn!(session_id = self.session_id, "❌ Session non ouverte : {}", e);
                return Err(e);
            }
        };

        let TransportLink { outbound, events, tasks } = link;
        let (events_tx, events_rx) = mpsc::channel(self.config.event_queue_size);

        let rejected = {
            let mut inner = lock(&self.inner);
            if inner.state == ChannelState::Connecting {
                inner.outbound = Some(outbound);
                inner.tasks = Some(tasks);
                inner.relay = Some(tokio::spawn(relay(
                    events,
                    events_tx,
                    Arc::clone(&self.inner),
                    Arc::clone(&self.counters),
                    self.session_id,
                    self.config.close_timeout,
                )));
                inner.set_state(ChannelState::Open);
                None
            } else {
                Some((outbound, tasks))
            }
        };

        // Fermé pendant la connexion : on referme aussitôt le lien
        if let Some((outbound, tasks)) = rejected {
            info!(session_id = self.session_id, "connexion aboutie après fermeture, abandon du lien");
            drop(outbound);
            tasks.shutdown(self.config.close_timeout).await;
            return Err(NetworkError::Cancelled);
        }

        info!(
            session_id = self.session_id,
            "✅ Session ouverte en {}",
            format_duration(started.elapsed())
        );
        Ok(events_rx)
    }

    /// Envoie une enveloppe sans jamais bloquer
    ///
    /// Retourne `false` si l'enveloppe a été droppée : canal pas ouvert, ou
    /// file d'envoi pleine (réseau trop lent).
    pub fn send(&self, envelope: TransportEnvelope) -> bool {
        let inner = lock(&self.inner);

        let outbound = match inner.outbound.as_ref() {
            Some(outbound) if inner.state.can_send() => outbound,
            _ => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        };

        match outbound.try_send(envelope) {
            Ok(()) => {
                self.counters.sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(session_id = self.session_id, "file d'envoi pleine, bloc droppé");
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Ferme le canal ; idempotent, utilisable à tout moment
    ///
    /// Appelé pendant `connect()`, le canal est immédiatement `Closed` et la
    /// connexion en cours se refermera d'elle-même en aboutissant.
    pub async fn close(&self) {
        let (tasks, relay) = {
            let mut inner = lock(&self.inner);
            if matches!(inner.state, ChannelState::Closing | ChannelState::Closed) {
                return;
            }
            inner.set_state(ChannelState::Closing);
            inner.outbound.take();
            (inner.tasks.take(), inner.relay.take())
        };

        if let Some(relay) = relay {
            relay.abort();
        }
        if let Some(tasks) = tasks {
            tasks.shutdown(self.config.close_timeout).await;
        }

        lock(&self.inner).set_state(ChannelState::Closed);

        let stats = self.stats();
        info!(
            session_id = self.session_id,
            sent = stats.envelopes_sent,
            dropped = stats.envelopes_dropped,
            received = stats.events_received,
            "🔚 Session fermée"
        );
    }
}

impl Drop for SessionChannel {
    fn drop(&mut self) {
        let mut inner = lock(&self.inner);
        inner.outbound.take();
        if let Some(relay) = inner.relay.take() {
            relay.abort();
        }
        if let Some(tasks) = inner.tasks.take() {
            tasks.abort();
        }
    }
}

/// Relaie les événements du lien vers le contrôleur
///
/// Sur un événement terminal, le canal passe en `Closed`/`Error` avant que
/// l'événement soit remis : le contrôleur qui le reçoit voit l'état final.
async fn relay(
    mut incoming: mpsc::Receiver<SessionEvent>,
    forward: mpsc::Sender<SessionEvent>,
    inner: Arc<Mutex<ChannelInner>>,
    counters: Arc<Counters>,
    session_id: u32,
    close_timeout: Duration,
) {
    let terminal = loop {
        match incoming.recv().await {
            Some(event) if event.is_terminal() => break event,
            Some(event) => {
                counters.received.fetch_add(1, Ordering::Relaxed);
                if forward.send(event).await.is_err() {
                    debug!(session_id, "plus de consommateur d'événements");
                    return;
                }
            }
            None => break SessionEvent::Closed { reason: None },
        }
    };

    let tasks = {
        let mut inner = lock(&inner);
        if inner.state == ChannelState::Open {
            let next = match terminal {
                SessionEvent::Error(_) => ChannelState::Error,
                _ => ChannelState::Closed,
            };
            inner.set_state(next);
            inner.outbound.take();
            inner.relay.take();
            inner.tasks.take()
        } else {
            None
        }
    };

    match &terminal {
        SessionEvent::Error(message) => warn!(session_id, "❌ Erreur de session : {}", message),
        SessionEvent::Closed { reason } => info!(session_id, ?reason, "Session fermée par l'agent"),
        _ => {}
    }

    let _ = forward.send(terminal).await;

    if let Some(tasks) = tasks {
        tasks.shutdown(close_timeout).await;
    }
}
