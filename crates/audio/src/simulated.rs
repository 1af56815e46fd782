//! Périphériques simulés pour les tests
//!
//! Ces implémentations remplacent le microphone et les haut-parleurs quand
//! aucun matériel n'est disponible. Chaque périphérique expose une "sonde"
//! clonable qui permet au test de piloter le périphérique (émettre des
//! blocs, avancer l'horloge) et de vérifier ce qui a été ouvert ou libéré.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::debug;

use crate::{
    AudioCapture, AudioConfig, AudioError, AudioFrame, AudioOutput, AudioResult, OnEnded,
    PlaybackBuffer, VoiceId,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Échec à provoquer à l'ouverture d'un périphérique simulé
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SimulatedFailure {
    PermissionDenied,
    NoDevice,
}

impl SimulatedFailure {
    fn to_error(self) -> AudioError {
        match self {
            SimulatedFailure::PermissionDenied => {
                AudioError::PermissionDenied("refus simulé".to_string())
            }
            SimulatedFailure::NoDevice => AudioError::NoDeviceFound,
        }
    }
}

#[derive(Default)]
struct CaptureState {
    sender: Mutex<Option<mpsc::Sender<AudioFrame>>>,
    failure: Mutex<Option<AudioError>>,
    open: AtomicBool,
    emitting: AtomicBool,
    opens: AtomicUsize,
    closes: AtomicUsize,
    emitted: AtomicU64,
    dropped: AtomicU64,
    sequence: AtomicU64,
}

/// Sonde d'une capture simulée
#[derive(Clone, Default)]
pub struct CaptureProbe {
    state: Arc<CaptureState>,
    sample_rate: u32,
}

impl CaptureProbe {
    /// Simule le callback audio : émet un bloc si la capture l'autorise
    ///
    /// Retourne `true` si le bloc a été placé dans la file.
    pub fn emit(&self, samples: Vec<i16>) -> bool {
        if !self.state.emitting.load(Ordering::Acquire) {
            return false;
        }

        let sender = lock(&self.state.sender);
        let Some(sender) = sender.as_ref() else {
            return false;
        };

        let sequence = self.state.sequence.fetch_add(1, Ordering::AcqRel);
        match sender.try_send(AudioFrame::new(samples, self.sample_rate, sequence)) {
            Ok(()) => {
                self.state.emitted.fetch_add(1, Ordering::AcqRel);
                true
            }
            Err(_) => {
                self.state.dropped.fetch_add(1, Ordering::AcqRel);
                false
            }
        }
    }

    /// Émet un bloc de silence de la taille donnée
    pub fn emit_silence(&self, sample_count: usize) -> bool {
        self.emit(vec![0; sample_count])
    }

    /// Simule la perte du micro en cours de capture
    ///
    /// La file des blocs se ferme et `stream_error()` donne la raison ; le
    /// périphérique reste à libérer par `close()`.
    pub fn fail(&self, message: &str) {
        self.state.emitting.store(false, Ordering::Release);
        *lock(&self.state.failure) = Some(AudioError::StreamError(message.to_string()));
        lock(&self.state.sender).take();
    }

    pub fn is_open(&self) -> bool {
        self.state.open.load(Ordering::Acquire)
    }

    pub fn is_emitting(&self) -> bool {
        self.state.emitting.load(Ordering::Acquire)
    }

    pub fn open_count(&self) -> usize {
        self.state.opens.load(Ordering::Acquire)
    }

    /// Nombre de libérations effectives (fermetures d'une capture ouverte)
    pub fn close_count(&self) -> usize {
        self.state.closes.load(Ordering::Acquire)
    }

    pub fn emitted_count(&self) -> u64 {
        self.state.emitted.load(Ordering::Acquire)
    }

    pub fn dropped_count(&self) -> u64 {
        self.state.dropped.load(Ordering::Acquire)
    }
}

/// Capture simulée pilotée par sa sonde
pub struct SimulatedCapture {
    config: AudioConfig,
    probe: CaptureProbe,
    failure: Option<SimulatedFailure>,
}

impl SimulatedCapture {
    pub fn new(config: AudioConfig) -> Self {
        let probe = CaptureProbe {
            state: Arc::new(CaptureState::default()),
            sample_rate: config.input_sample_rate,
        };
        Self {
            config,
            probe,
            failure: None,
        }
    }

    /// Capture dont l'ouverture échoue systématiquement
    pub fn failing(config: AudioConfig, failure: SimulatedFailure) -> Self {
        Self {
            failure: Some(failure),
            ..Self::new(config)
        }
    }

    pub fn probe(&self) -> CaptureProbe {
        self.probe.clone()
    }
}

#[async_trait]
impl AudioCapture for SimulatedCapture {
    async fn open(&mut self) -> AudioResult<mpsc::Receiver<AudioFrame>> {
        if let Some(failure) = self.failure {
            return Err(failure.to_error());
        }
        if self.probe.is_open() {
            return Err(AudioError::ConfigError("capture déjà ouverte".to_string()));
        }

        let (sender, receiver) = mpsc::channel(self.config.capture_queue_frames.max(1));
        *lock(&self.probe.state.sender) = Some(sender);
        *lock(&self.probe.state.failure) = None;
        self.probe.state.open.store(true, Ordering::Release);
        self.probe.state.sequence.store(0, Ordering::Release);
        self.probe.state.emitting.store(true, Ordering::Release);
        self.probe.state.opens.fetch_add(1, Ordering::AcqRel);

        debug!("🎤 Capture simulée ouverte");
        Ok(receiver)
    }

    async fn close(&mut self) -> AudioResult<()> {
        self.probe.state.emitting.store(false, Ordering::Release);
        lock(&self.probe.state.sender).take();
        if self.probe.state.open.swap(false, Ordering::AcqRel) {
            self.probe.state.closes.fetch_add(1, Ordering::AcqRel);
            debug!("🛑 Capture simulée fermée");
        }
        Ok(())
    }

    fn stop_emitting(&self) {
        self.probe.state.emitting.store(false, Ordering::Release);
    }

    fn stream_error(&self) -> Option<AudioError> {
        lock(&self.probe.state.failure).clone()
    }

    fn is_recording(&self) -> bool {
        self.probe.is_open()
    }

    fn device_info(&self) -> String {
        "Microphone simulé".to_string()
    }
}

/// Trace d'une planification reçue par la sortie simulée
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScheduledRecord {
    pub voice: VoiceId,
    pub start: f64,
    pub duration: f64,
    pub sample_rate: u32,
}

struct SimVoice {
    record: ScheduledRecord,
    on_ended: OnEnded,
}

#[derive(Default)]
struct OutputState {
    clock: Mutex<f64>,
    open: AtomicBool,
    opens: AtomicUsize,
    closes: AtomicUsize,
    stopped: AtomicUsize,
    voices: Mutex<Vec<SimVoice>>,
    history: Mutex<Vec<ScheduledRecord>>,
}

/// Sonde d'une sortie simulée : horloge manuelle et historique
#[derive(Clone, Default)]
pub struct OutputProbe {
    state: Arc<OutputState>,
}

impl OutputProbe {
    /// Positionne l'horloge et termine les voix dont la fin est atteinte
    ///
    /// Les callbacks de fin sont appelés hors verrou, comme depuis le
    /// thread audio.
    pub fn set_time(&self, seconds: f64) {
        *lock(&self.state.clock) = seconds;

        let finished: Vec<SimVoice> = {
            let mut voices = lock(&self.state.voices);
            let (done, pending): (Vec<_>, Vec<_>) = voices
                .drain(..)
                .partition(|v| v.record.start + v.record.duration <= seconds + 1e-9);
            *voices = pending;
            done
        };

        for voice in finished {
            (voice.on_ended)();
        }
    }

    /// Avance l'horloge d'une durée relative
    pub fn advance(&self, seconds: f64) {
        let now = *lock(&self.state.clock);
        self.set_time(now + seconds);
    }

    pub fn now(&self) -> f64 {
        *lock(&self.state.clock)
    }

    /// Toutes les planifications reçues depuis la création
    pub fn scheduled(&self) -> Vec<ScheduledRecord> {
        lock(&self.state.history).clone()
    }

    pub fn active_voices(&self) -> usize {
        lock(&self.state.voices).len()
    }

    pub fn stopped_count(&self) -> usize {
        self.state.stopped.load(Ordering::Acquire)
    }

    pub fn is_open(&self) -> bool {
        self.state.open.load(Ordering::Acquire)
    }

    pub fn open_count(&self) -> usize {
        self.state.opens.load(Ordering::Acquire)
    }

    pub fn close_count(&self) -> usize {
        self.state.closes.load(Ordering::Acquire)
    }
}

/// Sortie simulée à horloge manuelle
pub struct SimulatedOutput {
    sample_rate: u32,
    probe: OutputProbe,
    failure: Option<SimulatedFailure>,
}

impl SimulatedOutput {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            probe: OutputProbe::default(),
            failure: None,
        }
    }

    pub fn failing(sample_rate: u32, failure: SimulatedFailure) -> Self {
        Self {
            failure: Some(failure),
            ..Self::new(sample_rate)
        }
    }

    pub fn probe(&self) -> OutputProbe {
        self.probe.clone()
    }
}

#[async_trait]
impl AudioOutput for SimulatedOutput {
    async fn open(&mut self) -> AudioResult<()> {
        if let Some(failure) = self.failure {
            return Err(failure.to_error());
        }
        if !self.probe.state.open.swap(true, Ordering::AcqRel) {
            self.probe.state.opens.fetch_add(1, Ordering::AcqRel);
        }
        Ok(())
    }

    async fn close(&mut self) -> AudioResult<()> {
        if self.probe.state.open.swap(false, Ordering::AcqRel) {
            lock(&self.probe.state.voices).clear();
            self.probe.state.closes.fetch_add(1, Ordering::AcqRel);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.probe.is_open()
    }

    fn current_time(&self) -> f64 {
        self.probe.now()
    }

    fn schedule(
        &self,
        voice: VoiceId,
        buffer: PlaybackBuffer,
        start_at: f64,
        on_ended: OnEnded,
    ) -> AudioResult<()> {
        if !self.probe.is_open() {
            return Err(AudioError::NotOpen);
        }

        let record = ScheduledRecord {
            voice,
            start: start_at,
            duration: buffer.duration(),
            sample_rate: buffer.sample_rate,
        };
        lock(&self.probe.state.history).push(record);
        lock(&self.probe.state.voices).push(SimVoice { record, on_ended });
        Ok(())
    }

    fn stop(&self, voice: VoiceId) -> bool {
        let mut voices = lock(&self.probe.state.voices);
        let before = voices.len();
        voices.retain(|v| v.record.voice != voice);
        let removed = voices.len() != before;
        if removed {
            self.probe.state.stopped.fetch_add(1, Ordering::AcqRel);
        }
        removed
    }

    fn device_info(&self) -> String {
        format!("Sortie simulée ({} Hz)", self.sample_rate)
    }
}
