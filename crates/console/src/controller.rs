//! Contrôleur d'appel
//!
//! Le contrôleur est une tâche tokio (acteur) qui possède toutes les
//! ressources d'un appel : sortie audio, capture micro, canal de session et
//! planificateur de lecture. L'interface ne lui parle qu'à travers un
//! `CallHandle` (commandes) et observe un `CallStatus` (watch).
//!
//! Acquisition : sortie audio, puis capture, puis canal. La libération se
//! fait dans l'ordre inverse, par un seul chemin (`teardown`) quelle que soit
//! la raison de la fin d'appel.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use audio::{
    AudioCapture, AudioCodec, AudioConfig, AudioFrame, AudioOutput, CpalCapture, CpalOutput, PcmCodec,
    PlaybackScheduler,
};
use network::{AgentTransport, NetworkResult, SessionChannel, SessionEvent, WebSocketTransport};

use crate::{CallError, CallResult, ConsoleConfig};

/// Fabrique de capture, appelée à chaque début d'appel
pub type CaptureFactory = Box<dyn Fn(&AudioConfig) -> Box<dyn AudioCapture> + Send + Sync>;

/// Fabrique de sortie audio, appelée à chaque début d'appel
pub type OutputFactory = Box<dyn Fn(&AudioConfig) -> Box<dyn AudioOutput> + Send + Sync>;

/// Périphériques et transport utilisés par le contrôleur
pub struct CallDevices {
    pub capture: CaptureFactory,
    pub output: OutputFactory,
    pub transport: Arc<dyn AgentTransport>,
}

impl CallDevices {
    /// Micro et haut-parleurs par défaut (cpal), agent distant en websocket
    pub fn system(config: &ConsoleConfig) -> CallResult<Self> {
        let transport = WebSocketTransport::new(config.network.clone())?;

        Ok(Self {
            capture: Box::new(|audio: &AudioConfig| -> Box<dyn AudioCapture> {
                Box::new(CpalCapture::new(audio.clone()))
            }),
            output: Box::new(|audio: &AudioConfig| -> Box<dyn AudioOutput> {
                Box::new(CpalOutput::new(audio.clone()))
            }),
            transport: Arc::new(transport),
        })
    }
}

/// État de l'appel vu par l'interface
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Connecting,
    Open,
    Closing,
    Error,
}

impl CallState {
    /// Un appel est en cours ou en train de s'établir
    pub fn is_active(&self) -> bool {
        matches!(self, CallState::Connecting | CallState::Open)
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CallState::Idle => "en attente",
            CallState::Connecting => "connexion",
            CallState::Open => "en ligne",
            CallState::Closing => "raccrochage",
            CallState::Error => "erreur",
        };
        f.write_str(label)
    }
}

/// Instantané publié à chaque changement
#[derive(Clone, Debug, PartialEq)]
pub struct CallStatus {
    pub state: CallState,

    /// Secondes écoulées depuis l'ouverture de la session
    pub elapsed_seconds: u64,

    /// Identifiant du canal de l'appel en cours
    pub session_id: Option<u32>,

    /// Erreur qui a terminé le dernier appel
    pub last_error: Option<CallError>,

    /// De l'audio de l'agent est planifié ou en cours de lecture
    pub playing: bool,
}

impl Default for CallStatus {
    fn default() -> Self {
        Self {
            state: CallState::Idle,
            elapsed_seconds: 0,
            session_id: None,
            last_error: None,
            playing: false,
        }
    }
}

/// Durée d'appel au format `m:ss`
///
/// # Example
/// ```rust
/// use console::format_elapsed;
///
/// assert_eq!(format_elapsed(0), "0:00");
/// assert_eq!(format_elapsed(75), "1:15");
/// ```
pub fn format_elapsed(seconds: u64) -> String {
    format!("{}:{:02}", seconds / 60, seconds % 60)
}

enum Command {
    Toggle(oneshot::Sender<CallResult<CallState>>),
    Stop(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// Poignée clonable vers le contrôleur
#[derive(Clone)]
pub struct CallHandle {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<CallStatus>,
}

impl CallHandle {
    /// Démarre un appel, ou raccroche celui en cours
    ///
    /// Au démarrage, ne rend la main qu'une fois la session ouverte (`Open`),
    /// en échec, ou annulée par un nouveau `toggle_call()` (`Idle`).
    pub async fn toggle_call(&self) -> CallResult<CallState> {
        let (reply, response) = oneshot::channel();
        self.request(Command::Toggle(reply)).await?;
        response.await.map_err(|_| CallError::ControllerGone)?
    }

    /// Raccroche si un appel est en cours ; sans effet sinon
    pub async fn stop_call(&self) -> CallResult<()> {
        let (reply, response) = oneshot::channel();
        self.request(Command::Stop(reply)).await?;
        response.await.map_err(|_| CallError::ControllerGone)
    }

    /// Raccroche et arrête la tâche du contrôleur
    pub async fn shutdown(&self) -> CallResult<()> {
        let (reply, response) = oneshot::channel();
        self.request(Command::Shutdown(reply)).await?;
        response.await.map_err(|_| CallError::ControllerGone)
    }

    pub fn status(&self) -> CallStatus {
        self.status.borrow().clone()
    }

    /// Suit les changements d'état (pour l'affichage)
    pub fn subscribe(&self) -> watch::Receiver<CallStatus> {
        self.status.clone()
    }

    async fn request(&self, command: Command) -> CallResult<()> {
        self.commands.send(command).await.map_err(|_| CallError::ControllerGone)
    }
}

/// Ressources d'un appel, dans l'ordre d'acquisition
#[derive(Default)]
struct ActiveCall {
    output: Option<Box<dyn AudioOutput>>,
    capture: Option<Box<dyn AudioCapture>>,
    channel: Option<Arc<SessionChannel>>,
    frames: Option<mpsc::Receiver<AudioFrame>>,
    uplink: Option<Uplink>,
}

/// Pompe montante en cours et son signal d'arrêt
struct Uplink {
    task: JoinHandle<()>,
    stop: oneshot::Sender<()>,
}

/// Acteur qui possède l'appel en cours
pub struct CallController {
    config: ConsoleConfig,
    devices: CallDevices,
    codec: PcmCodec,
    client_name: String,

    commands: mpsc::Receiver<Command>,
    status: CallStatus,
    status_tx: watch::Sender<CallStatus>,

    call: Option<ActiveCall>,
    scheduler: PlaybackScheduler,
    pending_start: Option<oneshot::Sender<CallResult<CallState>>>,
    connecting: Option<JoinHandle<NetworkResult<mpsc::Receiver<SessionEvent>>>>,
    events: Option<mpsc::Receiver<SessionEvent>>,
    ticker: Option<Interval>,
}

impl CallController {
    /// Lance le contrôleur pour le dossier du client `client_name`
    ///
    /// # Example
    /// ```rust,no_run
    /// use console::{CallController, CallDevices, ConsoleConfig};
    ///
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let config = ConsoleConfig::default();
    /// let devices = CallDevices::system(&config)?;
    /// let handle = CallController::spawn(config, devices, "Jeanne Martin");
    ///
    /// handle.toggle_call().await?; // décroche
    /// handle.toggle_call().await?; // raccroche
    /// # Ok(())
    /// # }
    /// ```
    pub fn spawn(config: ConsoleConfig, devices: CallDevices, client_name: impl Into<String>) -> CallHandle {
        let (commands_tx, commands) = mpsc::channel(16);
        let (status_tx, status_rx) = watch::channel(CallStatus::default());

        let controller = CallController {
            codec: PcmCodec::new(&config.audio),
            config,
            devices,
            client_name: client_name.into(),
            commands,
            status: CallStatus::default(),
            status_tx,
            call: None,
            scheduler: PlaybackScheduler::new(),
            pending_start: None,
            connecting: None,
            events: None,
            ticker: None,
        };
        tokio::spawn(controller.run());

        CallHandle {
            commands: commands_tx,
            status: status_rx,
        }
    }

    async fn run(mut self) {
        debug!("contrôleur d'appel démarré");

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        // Plus aucune poignée : on libère tout et on s'arrête
                        self.teardown(None).await;
                        break;
                    };
                    if self.handle_command(command).await {
                        break;
                    }
                }
                joined = join_connect(&mut self.connecting) => {
                    self.connecting = None;
                    self.on_connected(joined).await;
                }
                event = next_event(&mut self.events) => {
                    self.on_event(event).await;
                }
                ended = join_uplink(&mut self.call) => {
                    self.on_uplink_ended(ended).await;
                }
                _ = next_tick(&mut self.ticker) => {
                    self.status.elapsed_seconds += 1;
                    self.publish();
                }
            }
        }

        debug!("contrôleur d'appel arrêté");
    }

    /// Retourne `true` si le contrôleur doit s'arrêter
    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Toggle(reply) => {
                match self.status.state {
                    CallState::Idle | CallState::Error | CallState::Closing => {
                        self.start(reply).await;
                    }
                    CallState::Connecting | CallState::Open => {
                        info!("📴 Raccrochage demandé");
                        self.teardown(None).await;
                        let _ = reply.send(Ok(self.status.state));
                    }
                }
                false
            }
            Command::Stop(reply) => {
                if self.call.is_some() {
                    info!("📴 Raccrochage demandé");
                    self.teardown(None).await;
                }
                let _ = reply.send(());
                false
            }
            Command::Shutdown(reply) => {
                self.teardown(None).await;
                let _ = reply.send(());
                true
            }
        }
    }

    /// Acquiert les ressources et lance la connexion
    ///
    /// La réponse est gardée jusqu'à l'ouverture de la session.
    async fn start(&mut self, reply: oneshot::Sender<CallResult<CallState>>) {
        self.status = CallStatus {
            state: CallState::Connecting,
            ..CallStatus::default()
        };
        self.publish();
        self.pending_start = Some(reply);

        info!(client = %self.client_name, "📞 Démarrage de l'appel");

        if let Err(e) = self.acquire().await {
            warn!("❌ Appel impossible : {}", e);
            self.teardown(Some(e)).await;
        }
    }

    async fn acquire(&mut self) -> CallResult<()> {
        let call = self.call.insert(ActiveCall::default());

        let mut output = (self.devices.output)(&self.config.audio);
        let opened = output.open().await;
        // Gardée même en cas d'échec : le teardown la refermera
        let output = call.output.insert(output);
        opened?;
        debug!(device = %output.device_info(), "🔊 Sortie audio ouverte");

        let mut capture = (self.devices.capture)(&self.config.audio);
        let frames = capture.open().await;
        let capture = call.capture.insert(capture);
        call.frames = Some(frames?);
        debug!(device = %capture.device_info(), "🎤 Capture ouverte");

        let channel = Arc::new(SessionChannel::new(
            Arc::clone(&self.devices.transport),
            self.config.network.clone(),
        ));
        call.channel = Some(Arc::clone(&channel));
        self.status.session_id = Some(channel.session_id());
        self.publish();

        let session = self.config.session_config(&self.client_name);
        self.connecting = Some(tokio::spawn(async move { channel.connect(&session).await }));
        Ok(())
    }

    async fn on_connected(&mut self, joined: Result<NetworkResult<mpsc::Receiver<SessionEvent>>, JoinError>) {
        let events = match joined {
            Ok(Ok(events)) => events,
            Ok(Err(e)) if e.is_cancellation() => return,
            Ok(Err(e)) => {
                self.teardown(Some(e.into())).await;
                return;
            }
            Err(e) => {
                self.teardown(Some(CallError::Connection(e.to_string()))).await;
                return;
            }
        };

        let Some(call) = self.call.as_mut() else {
            return;
        };
        let (Some(channel), Some(mut frames)) = (call.channel.clone(), call.frames.take()) else {
            return;
        };

        // Blocs capturés pendant la connexion : jamais envoyés
        let mut discarded = 0;
        while frames.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            debug!(discarded, "blocs antérieurs à l'ouverture ignorés");
        }

        let (stop, stopped) = oneshot::channel();
        call.uplink = Some(Uplink {
            task: tokio::spawn(uplink(frames, self.codec.clone(), channel, stopped)),
            stop,
        });
        self.events = Some(events);

        let mut ticker = tokio::time::interval_at(Instant::now() + Duration::from_secs(1), Duration::from_secs(1));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.ticker = Some(ticker);

        self.status.state = CallState::Open;
        self.status.elapsed_seconds = 0;
        self.publish();
        info!(session_id = ?self.status.session_id, "✅ Appel en ligne");

        if let Some(reply) = self.pending_start.take() {
            let _ = reply.send(Ok(CallState::Open));
        }
    }

    async fn on_event(&mut self, event: Option<SessionEvent>) {
        match event {
            Some(SessionEvent::Audio(envelope)) => {
                let Some(output) = self.call.as_ref().and_then(|call| call.output.as_deref()) else {
                    return;
                };

                match self.codec.decode(&envelope) {
                    Ok(buffer) => {
                        if let Err(e) = self.scheduler.schedule(output, buffer) {
                            warn!("buffer non planifié : {}", e);
                        }
                    }
                    Err(e) => {
                        // Erreur locale : le buffer est ignoré, l'appel continue
                        warn!(bytes = envelope.data.len(), "⚠️ {}", CallError::from(e));
                    }
                }
                self.publish();
            }
            Some(SessionEvent::Interrupted) => {
                if let Some(output) = self.call.as_ref().and_then(|call| call.output.as_deref()) {
                    let stopped = self.scheduler.stop_all(output);
                    info!(stopped, "🤚 Agent interrompu, lecture coupée");
                }
                self.publish();
            }
            Some(SessionEvent::TurnComplete) => {
                debug!("fin du tour de parole de l'agent");
            }
            Some(SessionEvent::Closed { reason }) => {
                info!(?reason, "📴 Session fermée par l'agent");
                self.teardown(None).await;
            }
            Some(SessionEvent::Error(message)) => {
                self.teardown(Some(CallError::Connection(message))).await;
            }
            None => {
                self.events = None;
                if self.status.state == CallState::Open {
                    self.teardown(None).await;
                }
            }
        }
    }

    /// La pompe montante ne s'arrête d'elle-même que si la capture est perdue
    async fn on_uplink_ended(&mut self, ended: Result<(), JoinError>) {
        let Some(call) = self.call.as_mut() else {
            return;
        };
        call.uplink = None;

        let reason = call.capture.as_ref().and_then(|capture| capture.stream_error());
        let failure = match (reason, ended) {
            (Some(e), _) => CallError::from(e),
            (None, Err(e)) => CallError::Device(format!("pompe montante : {}", e)),
            (None, Ok(())) => CallError::Device("flux micro interrompu".to_string()),
        };

        warn!("🎤 Micro perdu : {}", failure);
        self.teardown(Some(failure)).await;
    }

    /// Libère tout ce que l'appel a acquis, dans l'ordre inverse
    ///
    /// Idempotent. Les échecs de libération sont journalisés et n'arrêtent
    /// pas les étapes suivantes.
    async fn teardown(&mut self, failure: Option<CallError>) {
        if let Some(mut call) = self.call.take() {
            self.status.state = CallState::Closing;
            self.publish();

            // Plus aucun bloc ne sort une fois la fermeture commencée
            if let Some(capture) = call.capture.as_ref() {
                capture.stop_emitting();
            }
            // Les blocs déjà capturés partent encore, le canal est toujours ouvert
            if let Some(uplink) = call.uplink.take() {
                let _ = uplink.stop.send(());
                if let Err(e) = uplink.task.await {
                    warn!("pompe montante interrompue : {}", e);
                }
            }

            if let Some(output) = call.output.as_deref() {
                self.scheduler.stop_all(output);
            }

            self.ticker = None;
            self.events = None;
            // Une connexion encore en cours se refermera seule après close()
            self.connecting = None;

            if let Some(channel) = call.channel.take() {
                channel.close().await;
                let stats = channel.stats();
                debug!(
                    sent = stats.envelopes_sent,
                    dropped = stats.envelopes_dropped,
                    drop_pct = stats.drop_percentage(),
                    received = stats.events_received,
                    "canal libéré"
                );
            }

            call.frames = None;
            if let Some(mut capture) = call.capture.take() {
                if let Err(e) = capture.close().await {
                    error!("{}", CallError::Resource(format!("capture : {}", e)));
                }
            }

            if let Some(mut output) = call.output.take() {
                if let Err(e) = output.close().await {
                    error!("{}", CallError::Resource(format!("sortie audio : {}", e)));
                }
            }
        }

        self.status = CallStatus {
            state: if failure.is_some() { CallState::Error } else { CallState::Idle },
            last_error: failure.clone(),
            ..CallStatus::default()
        };
        self.publish();

        if let Some(reply) = self.pending_start.take() {
            let _ = reply.send(match failure {
                Some(e) => Err(e),
                None => Ok(self.status.state),
            });
        }
    }

    fn publish(&mut self) {
        self.status.playing = self.scheduler.active_count() > 0;
        self.status_tx.send_replace(self.status.clone());
    }
}

/// Pompe montante : bloc capturé -> enveloppe -> canal
///
/// `send` ne bloque jamais : un canal lent se traduit par des blocs perdus.
/// Sur `stop`, les blocs restés en file sont envoyés avant de rendre la main.
/// Sans `stop`, la pompe ne se termine qu'à la fermeture de la file (micro
/// perdu).
async fn uplink(
    mut frames: mpsc::Receiver<AudioFrame>,
    codec: PcmCodec,
    channel: Arc<SessionChannel>,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;
            _ = &mut stop => {
                while let Ok(frame) = frames.try_recv() {
                    forward(&codec, &channel, frame);
                }
                return;
            }
            frame = frames.recv() => match frame {
                Some(frame) => forward(&codec, &channel, frame),
                None => return,
            },
        }
    }
}

fn forward(codec: &PcmCodec, channel: &SessionChannel, frame: AudioFrame) {
    if !channel.send(codec.encode(&frame)) {
        debug!(sequence = frame.sequence_number, "bloc non envoyé");
    }
}

async fn join_connect<T>(task: &mut Option<JoinHandle<T>>) -> Result<T, JoinError> {
    match task {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

async fn join_uplink(call: &mut Option<ActiveCall>) -> Result<(), JoinError> {
    match call.as_mut().and_then(|call| call.uplink.as_mut()) {
        Some(uplink) => (&mut uplink.task).await,
        None => std::future::pending().await,
    }
}

async fn next_event(events: &mut Option<mpsc::Receiver<SessionEvent>>) -> Option<SessionEvent> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(0), "0:00");
        assert_eq!(format_elapsed(9), "0:09");
        assert_eq!(format_elapsed(60), "1:00");
        assert_eq!(format_elapsed(3599), "59:59");
        assert_eq!(format_elapsed(3600), "60:00");
    }

    #[test]
    fn test_call_state_helpers() {
        assert!(CallState::Open.is_active());
        assert!(CallState::Connecting.is_active());
        assert!(!CallState::Error.is_active());
        assert_eq!(CallState::Open.to_string(), "en ligne");
        assert_eq!(CallStatus::default().state, CallState::Idle);
    }
}
