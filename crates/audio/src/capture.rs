//! Module de capture audio utilisant cpal
//!
//! Ce module implémente le trait AudioCapture en utilisant la librairie cpal
//! (Cross-Platform Audio Library) pour capturer l'audio depuis le microphone.
//!
//! Le périphérique tourne à son format natif. Le callback cpal :
//! 1. réduit en mono (moyenne des canaux)
//! 2. rééchantillonne au taux d'entrée configuré
//! 3. découpe en blocs fixes convertis en i16
//! 4. pousse chaque bloc dans une file bornée sans jamais bloquer

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::{AudioCapture, AudioConfig, AudioError, AudioFrame, AudioResult};

type FrameSender = Arc<Mutex<Option<mpsc::Sender<AudioFrame>>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Rééchantillonneur linéaire en flux
///
/// Garde le dernier échantillon du paquet précédent pour interpoler à la
/// jonction entre deux callbacks.
#[derive(Debug)]
struct LinearResampler {
    /// Pas dans le signal source par échantillon produit
    step: f64,
    /// Position du prochain échantillon à produire, relative à `last`
    pos: f64,
    last: Option<f32>,
}

impl LinearResampler {
    fn new(from_rate: u32, to_rate: u32) -> Self {
        Self {
            step: from_rate as f64 / to_rate as f64,
            pos: 0.0,
            last: None,
        }
    }

    fn is_passthrough(&self) -> bool {
        (self.step - 1.0).abs() < f64::EPSILON
    }

    fn process(&mut self, input: &[f32], out: &mut Vec<f32>) {
        if input.is_empty() {
            return;
        }
        if self.is_passthrough() {
            out.extend_from_slice(input);
            return;
        }

        // Signal vu par l'interpolateur : [last?] + input
        let last = self.last;
        let offset = usize::from(last.is_some());
        let len = input.len() + offset;
        let at = |i: usize| -> f32 {
            match (i, last) {
                (0, Some(last)) => last,
                _ => input[i - offset],
            }
        };

        while (self.pos.floor() as usize) + 1 < len {
            let idx = self.pos.floor() as usize;
            let frac = (self.pos - idx as f64) as f32;
            let a = at(idx);
            let b = at(idx + 1);
            out.push(a + (b - a) * frac);
            self.pos += self.step;
        }

        // Le dernier échantillon devient l'indice 0 du prochain paquet
        self.pos -= (len - 1) as f64;
        self.last = input.last().copied();
    }
}

/// Assemble les échantillons du périphérique en blocs fixes
///
/// Fonction pure vis-à-vis du thread audio : pas d'I/O, pas de verrou.
#[derive(Debug)]
pub struct FrameAssembler {
    channels: usize,
    target_rate: u32,
    block_size: usize,
    resampler: LinearResampler,
    mono: Vec<f32>,
    pending: Vec<f32>,
    next_sequence: u64,
}

impl FrameAssembler {
    /// # Arguments
    /// * `device_channels` - Canaux entrelacés fournis par le périphérique
    /// * `device_rate` - Taux natif du périphérique
    /// * `config` - Taux cible et taille de bloc
    pub fn new(device_channels: u16, device_rate: u32, config: &AudioConfig) -> Self {
        Self {
            channels: usize::from(device_channels.max(1)),
            target_rate: config.input_sample_rate,
            block_size: config.block_size.max(1),
            resampler: LinearResampler::new(device_rate, config.input_sample_rate),
            mono: Vec::new(),
            pending: Vec::with_capacity(config.block_size * 2),
            next_sequence: 0,
        }
    }

    /// Ajoute des échantillons entrelacés et retourne les blocs complets
    pub fn push(&mut self, interleaved: &[f32]) -> Vec<AudioFrame> {
        self.mono.clear();
        self.mono.extend(
            interleaved
                .chunks(self.channels)
                .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32),
        );

        self.resampler.process(&self.mono, &mut self.pending);

        let mut frames = Vec::new();
        while self.pending.len() >= self.block_size {
            let block: Vec<f32> = self.pending.drain(..self.block_size).collect();
            frames.push(AudioFrame::from_f32(&block, self.target_rate, self.next_sequence));
            self.next_sequence += 1;
        }
        frames
    }

    /// Échantillons en attente d'un bloc complet
    pub fn pending_samples(&self) -> usize {
        self.pending.len()
    }
}

/// Implémentation de capture audio avec cpal
///
/// # Architecture thread
///
/// cpal fonctionne avec des callbacks. Le callback assemble les blocs et les
/// envoie avec `try_send` : si la file est pleine (réseau lent), le bloc est
/// perdu mais le thread audio n'attend jamais.
///
/// Le drapeau `emitting` est coupé au début d'une fermeture de session :
/// à partir de là, plus aucun bloc ne sort, même si le stream tourne encore.
pub struct CpalCapture {
    /// Configuration audio de notre application
    config: AudioConfig,

    /// Stream audio actif (None si fermé)
    stream: Option<Stream>,

    /// Autorise le callback à émettre des blocs
    emitting: Arc<AtomicBool>,

    /// Blocs perdus faute de place dans la file
    dropped_frames: Arc<AtomicU64>,

    /// Côté émetteur de la file, partagé entre les deux callbacks cpal
    ///
    /// Le callback d'erreur le retire quand le périphérique disparaît : la
    /// file se ferme et le consommateur voit la fin du flux.
    sender: FrameSender,

    /// Raison de l'arrêt du flux, le cas échéant
    failure: Arc<Mutex<Option<AudioError>>>,

    /// Nom du périphérique pour debug
    device_name: String,
}

impl CpalCapture {
    /// Crée une capture ; le microphone n'est acquis qu'à `open()`
    pub fn new(config: AudioConfig) -> Self {
        Self {
            config,
            stream: None,
            emitting: Arc::new(AtomicBool::new(false)),
            dropped_frames: Arc::new(AtomicU64::new(0)),
            sender: Arc::new(Mutex::new(None)),
            failure: Arc::new(Mutex::new(None)),
            device_name: "Périphérique inconnu".to_string(),
        }
    }

    /// Nombre de blocs perdus depuis la dernière ouverture
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Acquire)
    }

    /// Choisit la configuration du périphérique
    ///
    /// Le taux d'entrée est utilisé tel quel si le périphérique le supporte,
    /// sinon on garde sa config par défaut et on rééchantillonne.
    fn select_config(&self, device: &Device) -> AudioResult<(StreamConfig, SampleFormat)> {
        let default_config = device.default_input_config()?;

        debug!(
            sample_rate = default_config.sample_rate(),
            channels = default_config.channels(),
            format = ?default_config.sample_format(),
            "config par défaut du périphérique de capture"
        );

        let target = self.config.input_sample_rate;
        let format = default_config.sample_format();

        let native = device
            .supported_input_configs()
            .map_err(|e| AudioError::ConfigError(format!("Impossible d'obtenir configs supportées: {}", e)))?
            .find(|range| {
                range.sample_format() == format
                    && range.channels() == default_config.channels()
                    && target >= range.min_sample_rate()
                    && target <= range.max_sample_rate()
            });

        match native {
            Some(range) => Ok((range.with_sample_rate(target).config(), format)),
            None => {
                debug!(target_rate = target, "taux cible non supporté, rééchantillonnage logiciel");
                Ok((default_config.config(), format))
            }
        }
    }

    /// Construit le stream de capture pour un format d'échantillon donné
    fn build_stream<T>(
        &self,
        device: &Device,
        config: &StreamConfig,
    ) -> AudioResult<Stream>
    where
        T: SizedSample,
        f32: FromSample<T>,
    {
        let mut assembler = FrameAssembler::new(config.channels, config.sample_rate, &self.config);
        let emitting = Arc::clone(&self.emitting);
        let dropped = Arc::clone(&self.dropped_frames);
        let sender = Arc::clone(&self.sender);
        let lost_sender = Arc::clone(&self.sender);
        let lost_emitting = Arc::clone(&self.emitting);
        let failure = Arc::clone(&self.failure);
        let mut converted: Vec<f32> = Vec::new();

        let stream = device.build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                if !emitting.load(Ordering::Acquire) {
                    return;
                }

                converted.clear();
                converted.extend(data.iter().map(|&s| f32::from_sample(s)));

                let frames = assembler.push(&converted);
                if frames.is_empty() {
                    return;
                }

                let guard = lock(&sender);
                let Some(queue) = guard.as_ref() else {
                    return; // Flux perdu ou capture fermée
                };
                for frame in frames {
                    // Fermeture commencée entre deux blocs : on s'arrête là
                    if !emitting.load(Ordering::Acquire) {
                        return;
                    }
                    if queue.try_send(frame).is_err() {
                        // File pleine ou consommateur parti - bloc perdu
                        dropped.fetch_add(1, Ordering::AcqRel);
                    }
                }
            },
            move |err| {
                error!("❌ Erreur stream audio : {}", err);

                // Micro perdu : on ferme la file pour prévenir le consommateur
                if matches!(err, cpal::StreamError::DeviceNotAvailable) {
                    lost_emitting.store(false, Ordering::Release);
                    *lock(&failure) = Some(AudioError::StreamError(err.to_string()));
                    lock(&lost_sender).take();
                }
            },
            None,
        )?;

        Ok(stream)
    }
}

#[async_trait]
impl AudioCapture for CpalCapture {
    async fn open(&mut self) -> AudioResult<mpsc::Receiver<AudioFrame>> {
        if self.stream.is_some() {
            return Err(AudioError::ConfigError("capture déjà ouverte".to_string()));
        }

        // Obtient l'host audio par défaut du système
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or(AudioError::NoDeviceFound)?;

        self.device_name = device
            .description()
            .ok()
            .map(|desc| desc.name().to_string())
            .unwrap_or_else(|| "Périphérique inconnu".to_string());

        let (stream_config, sample_format) = self.select_config(&device)?;
        let (sender, receiver) = mpsc::channel(self.config.capture_queue_frames.max(1));
        *lock(&self.sender) = Some(sender);
        *lock(&self.failure) = None;

        let stream = match sample_format {
            SampleFormat::F32 => self.build_stream::<f32>(&device, &stream_config),
            SampleFormat::I16 => self.build_stream::<i16>(&device, &stream_config),
            SampleFormat::U16 => self.build_stream::<u16>(&device, &stream_config),
            other => Err(AudioError::ConfigError(format!(
                "Format d'échantillon non supporté : {:?}",
                other
            ))),
        };
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                lock(&self.sender).take();
                return Err(e);
            }
        };

        self.dropped_frames.store(0, Ordering::Release);
        self.emitting.store(true, Ordering::Release);

        if let Err(e) = stream.play() {
            self.emitting.store(false, Ordering::Release);
            lock(&self.sender).take();
            return Err(e.into());
        }

        info!(
            device = %self.device_name,
            device_rate = stream_config.sample_rate,
            block_ms = self.config.block_duration_ms(),
            "🎤 Capture audio démarrée"
        );

        self.stream = Some(stream);
        Ok(receiver)
    }

    async fn close(&mut self) -> AudioResult<()> {
        self.emitting.store(false, Ordering::Release);
        // Ferme la file : le consommateur voit la fin du flux
        lock(&self.sender).take();

        let Some(stream) = self.stream.take() else {
            return Ok(()); // Déjà fermé ou jamais ouvert
        };

        let paused = stream.pause();
        // Le drop du stream libère le périphérique
        drop(stream);

        info!(dropped_frames = self.dropped_frames(), "🛑 Capture audio arrêtée");

        if let Err(e) = paused {
            warn!("pause du stream de capture impossible : {}", e);
            return Err(e.into());
        }
        Ok(())
    }

    fn stop_emitting(&self) {
        self.emitting.store(false, Ordering::Release);
    }

    fn stream_error(&self) -> Option<AudioError> {
        lock(&self.failure).clone()
    }

    fn is_recording(&self) -> bool {
        self.stream.is_some()
    }

    fn device_info(&self) -> String {
        self.device_name.clone()
    }
}

// Implémentation de Drop pour nettoyer proprement
impl Drop for CpalCapture {
    fn drop(&mut self) {
        self.emitting.store(false, Ordering::Release);
        if self.stream.is_some() {
            debug!("🧹 Nettoyage automatique de la capture audio");
        }
    }
}
