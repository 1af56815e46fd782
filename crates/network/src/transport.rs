//! Transports vers l'agent vocal
//!
//! - `WebSocketTransport` : connexion websocket réelle (tokio-tungstenite)
//! - `SimulatedTransport` : agent simulé en mémoire pour les tests
//!
//! Dans les deux cas, le lien est servi par des tâches tokio : une tâche
//! d'écriture qui vide la file d'envoi, une tâche de lecture qui convertit
//! les messages reçus en `SessionEvent`.

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use audio::TransportEnvelope;

use crate::protocol::{ClientMessage, ServerMessage};
use crate::utils::mask_secret;
use crate::{
    AgentTransport, LinkTasks, NetworkConfig, NetworkError, NetworkResult, SessionConfig,
    SessionEvent, TransportLink,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Transport websocket vers le service d'agent
///
/// # Example
/// ```rust,no_run
/// use network::{AgentTransport, NetworkConfig, SessionConfig, WebSocketTransport};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let transport = WebSocketTransport::new(NetworkConfig::default())?;
/// let session = SessionConfig::audio_only("agent-voix", "Bonjour");
/// let link = transport.open(&session).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct WebSocketTransport {
    config: NetworkConfig,
}

impl WebSocketTransport {
    /// Crée un transport ; la configuration est validée immédiatement
    pub fn new(config: NetworkConfig) -> NetworkResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Attend l'acquittement `setupComplete` de l'agent
    async fn await_setup_complete(read: &mut SplitStream<WsStream>) -> NetworkResult<()> {
        loop {
            let payload = match read.next().await {
                Some(Ok(Message::Text(text))) => text.as_bytes().to_vec(),
                Some(Ok(Message::Binary(bytes))) => bytes.to_vec(),
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|f| f.reason.to_string())
                        .unwrap_or_else(|| "fermeture sans raison".to_string());
                    return Err(NetworkError::Handshake(reason));
                }
                Some(Ok(_)) => continue, // ping/pong
                Some(Err(e)) => return Err(e.into()),
                None => return Err(NetworkError::Handshake("connexion fermée avant l'acquittement".to_string())),
            };

            match ServerMessage::parse(&payload) {
                Ok(msg) if msg.is_setup_complete() => return Ok(()),
                Ok(_) => debug!("message ignoré avant l'acquittement"),
                Err(e) => warn!("message illisible avant l'acquittement : {}", e),
            }
        }
    }

    /// Tâche d'écriture : une enveloppe = un message `realtimeInput`
    async fn write_loop(
        mut write: SplitSink<WsStream, Message>,
        mut outbound: mpsc::Receiver<TransportEnvelope>,
    ) {
        while let Some(envelope) = outbound.recv().await {
            let json = match ClientMessage::audio(envelope).to_json() {
                Ok(json) => json,
                Err(e) => {
                    warn!("enveloppe non sérialisable : {}", e);
                    continue;
                }
            };

            if let Err(e) = write.send(Message::Text(json.into())).await {
                warn!("envoi websocket impossible : {}", e);
                break;
            }
        }

        // File fermée : fermeture propre côté client
        let _ = write.send(Message::Close(None)).await;
        let _ = write.close().await;
        debug!("tâche d'écriture terminée");
    }

    /// Tâche de lecture : convertit les messages en événements
    async fn read_loop(mut read: SplitStream<WsStream>, events: mpsc::Sender<SessionEvent>) {
        let terminal = loop {
            let payload = match read.next().await {
                Some(Ok(Message::Text(text))) => text.as_bytes().to_vec(),
                Some(Ok(Message::Binary(bytes))) => bytes.to_vec(),
                Some(Ok(Message::Close(frame))) => {
                    break SessionEvent::Closed {
                        reason: frame.map(|f| f.reason.to_string()).filter(|r| !r.is_empty()),
                    };
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => break SessionEvent::Error(e.to_string()),
                None => break SessionEvent::Closed { reason: None },
            };

            let message = match ServerMessage::parse(&payload) {
                Ok(message) => message,
                Err(e) => {
                    warn!(bytes = payload.len(), "message de l'agent ignoré : {}", e);
                    continue;
                }
            };

            if message.is_go_away() {
                warn!("l'agent annonce une fermeture prochaine");
            }

            for event in message.into_events() {
                if events.send(event).await.is_err() {
                    return; // Plus de consommateur
                }
            }
        };

        debug!(?terminal, "tâche de lecture terminée");
        let _ = events.send(terminal).await;
    }
}

#[async_trait]
impl AgentTransport for WebSocketTransport {
    async fn open(&self, session: &SessionConfig) -> NetworkResult<TransportLink> {
        let url = self.config.endpoint_url()?;

        info!(
            endpoint = %self.config.endpoint,
            key = ?self.config.api_key.as_deref().map(mask_secret),
            agent = %session.agent_id,
            "📡 Connexion à l'agent..."
        );

        let (ws, _response) = connect_async(url.as_str()).await?;
        let (mut write, mut read) = ws.split();

        let setup = ClientMessage::setup(session).to_json()?;
        write.send(Message::Text(setup.into())).await?;

        Self::await_setup_complete(&mut read).await?;
        info!("✅ Session acquittée par l'agent");

        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.outbound_queue_size);
        let (events_tx, events_rx) = mpsc::channel(self.config.event_queue_size);

        let writer = tokio::spawn(Self::write_loop(write, outbound_rx));
        let reader = tokio::spawn(Self::read_loop(read, events_tx));

        Ok(TransportLink {
            outbound: outbound_tx,
            events: events_rx,
            tasks: LinkTasks::new(vec![writer, reader]),
        })
    }

    fn describe(&self) -> String {
        format!("websocket {}", self.config.endpoint)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct AgentState {
    sent: Mutex<Vec<TransportEnvelope>>,
    setups: Mutex<Vec<SessionConfig>>,
    events: Mutex<Option<mpsc::Sender<SessionEvent>>>,
    opens: AtomicUsize,
    connected: AtomicBool,
}

/// Côté distant d'un `SimulatedTransport`
///
/// Permet au test d'injecter des événements et d'observer ce qui a été
/// envoyé par le client.
#[derive(Clone, Default)]
pub struct SimulatedAgent {
    state: Arc<AgentState>,
}

impl SimulatedAgent {
    /// Injecte un événement dans la session courante
    ///
    /// Retourne `false` s'il n'y a pas de session ouverte.
    pub fn push(&self, event: SessionEvent) -> bool {
        let events = lock(&self.state.events);
        match events.as_ref() {
            Some(sender) => sender.try_send(event).is_ok(),
            None => false,
        }
    }

    /// Injecte un bloc audio
    pub fn push_audio(&self, envelope: TransportEnvelope) -> bool {
        self.push(SessionEvent::Audio(envelope))
    }

    /// Ferme la session côté agent
    pub fn close_remote(&self, reason: Option<&str>) -> bool {
        let pushed = self.push(SessionEvent::Closed {
            reason: reason.map(str::to_string),
        });
        self.disconnect();
        pushed
    }

    /// Fait échouer la session côté transport
    pub fn fail_remote(&self, message: &str) -> bool {
        let pushed = self.push(SessionEvent::Error(message.to_string()));
        self.disconnect();
        pushed
    }

    fn disconnect(&self) {
        lock(&self.state.events).take();
        self.state.connected.store(false, Ordering::Release);
    }

    /// Enveloppes reçues par l'agent, dans l'ordre
    pub fn sent(&self) -> Vec<TransportEnvelope> {
        lock(&self.state.sent).clone()
    }

    pub fn sent_count(&self) -> usize {
        lock(&self.state.sent).len()
    }

    /// Attend que l'agent ait reçu au moins `count` enveloppes
    pub async fn wait_for_sent(&self, count: usize, within: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + within;
        while self.sent_count() < count {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        true
    }

    /// Configurations de session reçues, une par ouverture réussie
    pub fn setups(&self) -> Vec<SessionConfig> {
        lock(&self.state.setups).clone()
    }

    /// Tentatives d'ouverture (réussies ou non)
    pub fn open_count(&self) -> usize {
        self.state.opens.load(Ordering::Acquire)
    }

    /// Vrai tant qu'un lien est ouvert et que sa file d'envoi vit
    pub fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::Acquire)
    }
}

/// Transport simulé pour les tests
///
/// Cette implémentation permet de tester le canal et le contrôleur en
/// simulant différentes conditions (délai d'ouverture, refus, latence
/// d'envoi) sans réseau.
pub struct SimulatedTransport {
    config: NetworkConfig,
    agent: SimulatedAgent,
    open_delay: Duration,
    send_latency: Duration,
    failure: Option<String>,
}

impl SimulatedTransport {
    /// Crée un nouveau transport simulé
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            config,
            agent: SimulatedAgent::default(),
            open_delay: Duration::ZERO,
            send_latency: Duration::ZERO,
            failure: None,
        }
    }

    /// Délai avant acquittement de la session
    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    /// Latence de traitement de chaque enveloppe côté agent
    pub fn with_send_latency(mut self, latency: Duration) -> Self {
        self.send_latency = latency;
        self
    }

    /// Toute ouverture échoue avec ce message (après le délai d'ouverture)
    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.failure = Some(message.into());
        self
    }

    pub fn agent(&self) -> SimulatedAgent {
        self.agent.clone()
    }
}

#[async_trait]
impl AgentTransport for SimulatedTransport {
    async fn open(&self, session: &SessionConfig) -> NetworkResult<TransportLink> {
        self.agent.state.opens.fetch_add(1, Ordering::AcqRel);

        if !self.open_delay.is_zero() {
            tokio::time::sleep(self.open_delay).await;
        }

        if let Some(message) = &self.failure {
            return Err(NetworkError::ConnectionFailed(message.clone()));
        }

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<TransportEnvelope>(self.config.outbound_queue_size);
        let (events_tx, events_rx) = mpsc::channel(self.config.event_queue_size);

        lock(&self.agent.state.setups).push(session.clone());
        *lock(&self.agent.state.events) = Some(events_tx);
        self.agent.state.connected.store(true, Ordering::Release);

        let agent = self.agent.clone();
        let latency = self.send_latency;
        let writer = tokio::spawn(async move {
            while let Some(envelope) = outbound_rx.recv().await {
                if !latency.is_zero() {
                    tokio::time::sleep(latency).await;
                }
                lock(&agent.state.sent).push(envelope);
            }
            // Le client a fermé sa file d'envoi
            agent.disconnect();
        });

        debug!(agent = %session.agent_id, "session simulée ouverte");

        Ok(TransportLink {
            outbound: outbound_tx,
            events: events_rx,
            tasks: LinkTasks::new(vec![writer]),
        })
    }

    fn describe(&self) -> String {
        "agent simulé".to_string()
    }
}
