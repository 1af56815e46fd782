//! Module de lecture audio utilisant cpal
//!
//! Ce module implémente le trait AudioOutput : un contexte de sortie qui
//! expose une horloge et joue des buffers planifiés à des instants absolus.
//!
//! Contrairement à une simple file FIFO, chaque buffer (une "voix") a un
//! instant de départ en frames. Le callback cpal mixe toutes les voix qui
//! recouvrent le bloc demandé, puis avance l'horloge.

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info, warn};

use crate::{
    AudioConfig, AudioError, AudioOutput, AudioResult, OnEnded, PlaybackBuffer, VoiceId,
};

/// Buffer planifié dans le mixeur
struct Voice {
    id: VoiceId,
    /// Première frame (horloge de sortie) où la voix est audible
    start_frame: u64,
    /// Échantillons mono au taux du périphérique
    samples: Vec<f32>,
    on_ended: Option<OnEnded>,
}

impl Voice {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

/// Mixeur à indexation absolue
///
/// `frames_rendered` est l'horloge : le nombre de frames déjà livrées au
/// périphérique. Aucune allocation dans `render` hormis la liste des
/// callbacks de fin.
#[derive(Default)]
pub(crate) struct Mixer {
    voices: Vec<Voice>,
    frames_rendered: u64,
}

impl Mixer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn frames_rendered(&self) -> u64 {
        self.frames_rendered
    }

    pub(crate) fn active(&self) -> usize {
        self.voices.len()
    }

    /// Ajoute une voix ; une voix planifiée dans le passé démarre maintenant
    fn add(&mut self, id: VoiceId, start_frame: u64, samples: Vec<f32>, on_ended: OnEnded) {
        self.voices.push(Voice {
            id,
            start_frame: start_frame.max(self.frames_rendered),
            samples,
            on_ended: Some(on_ended),
        });
    }

    /// Retire une voix sans appeler son callback de fin
    fn remove(&mut self, id: VoiceId) -> bool {
        let before = self.voices.len();
        self.voices.retain(|voice| voice.id != id);
        self.voices.len() != before
    }

    fn clear(&mut self) -> usize {
        let count = self.voices.len();
        self.voices.clear();
        count
    }

    /// Remplit `out` (entrelacé sur `channels`) et avance l'horloge
    ///
    /// Le mono est dupliqué sur tous les canaux. Retourne les callbacks des
    /// voix terminées : l'appelant les exécute hors du verrou.
    pub(crate) fn render(&mut self, out: &mut [f32], channels: usize) -> Vec<OnEnded> {
        let channels = channels.max(1);
        let frames = out.len() / channels;
        out.fill(0.0);

        let block_start = self.frames_rendered;
        let block_end = block_start + frames as u64;

        for voice in &self.voices {
            let from = voice.start_frame.max(block_start);
            let to = voice.end_frame().min(block_end);

            for abs in from..to {
                let sample = voice.samples[(abs - voice.start_frame) as usize];
                let base = (abs - block_start) as usize * channels;
                for slot in &mut out[base..base + channels] {
                    *slot += sample;
                }
            }
        }

        for slot in out.iter_mut() {
            *slot = slot.clamp(-1.0, 1.0);
        }

        self.frames_rendered = block_end;

        let mut ended = Vec::new();
        self.voices.retain_mut(|voice| {
            if voice.end_frame() <= block_end {
                if let Some(callback) = voice.on_ended.take() {
                    ended.push(callback);
                }
                false
            } else {
                true
            }
        });
        ended
    }
}

/// Place un buffer sur l'horloge du périphérique
///
/// Début et fin sont arrondis depuis les instants absolus, puis les
/// échantillons rééchantillonnés sont tronqués ou complétés à cette
/// longueur : deux buffers consécutifs se touchent à la frame près, même
/// quand le taux du périphérique n'est pas un multiple du taux source.
fn place_on_device(buffer: PlaybackBuffer, start_at: f64, device_rate: u32) -> (u64, Vec<f32>) {
    let start_at = start_at.max(0.0);
    let rate = device_rate as f64;
    let start_frame = (start_at * rate).round() as u64;
    let end_frame = ((start_at + buffer.duration()) * rate).round() as u64;
    let frames = end_frame.saturating_sub(start_frame) as usize;

    let mut samples = if buffer.sample_rate == device_rate {
        buffer.samples
    } else {
        buffer.resampled(device_rate).samples
    };
    let tail = samples.last().copied().unwrap_or(0.0);
    samples.resize(frames, tail);

    (start_frame, samples)
}

fn lock_mixer(mixer: &Mutex<Mixer>) -> MutexGuard<'_, Mixer> {
    mixer.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Contexte de sortie audio avec cpal
///
/// Cette structure gère :
/// - La découverte du périphérique de sortie (haut-parleurs)
/// - Le flux de sortie et son horloge en frames
/// - Le rééchantillonnage des buffers vers le taux du périphérique
///
/// # Architecture thread
///
/// Le contrôleur planifie des voix via `schedule()`. Le callback cpal
/// (thread temps réel) mixe les voix et publie l'horloge dans un atomique,
/// ce qui permet de lire `current_time()` sans toucher au verrou du mixeur.
pub struct CpalOutput {
    /// Configuration audio de notre application
    config: AudioConfig,

    /// Stream audio actif (None si fermé)
    stream: Option<Stream>,

    /// Voix planifiées, partagées avec le callback
    mixer: Arc<Mutex<Mixer>>,

    /// Horloge publiée par le callback (frames livrées)
    clock_frames: Arc<AtomicU64>,

    /// Taux réel du périphérique, connu après `open()`
    device_rate: Arc<AtomicU32>,

    /// Nom du périphérique pour debug
    device_name: String,
}

impl CpalOutput {
    /// Crée un contexte de sortie ; le périphérique n'est ouvert qu'à `open()`
    pub fn new(config: AudioConfig) -> Self {
        let device_rate = Arc::new(AtomicU32::new(config.output_sample_rate));
        Self {
            config,
            stream: None,
            mixer: Arc::new(Mutex::new(Mixer::new())),
            clock_frames: Arc::new(AtomicU64::new(0)),
            device_rate,
            device_name: "Périphérique de sortie inconnu".to_string(),
        }
    }

    /// Nombre de voix encore planifiées ou en cours
    pub fn active_voices(&self) -> usize {
        lock_mixer(&self.mixer).active()
    }

    /// Choisit la configuration du périphérique
    ///
    /// On garde la config par défaut : le rééchantillonnage se fait de notre
    /// côté, buffer par buffer.
    fn select_config(device: &Device) -> AudioResult<(StreamConfig, SampleFormat)> {
        let default_config = device.default_output_config()?;

        debug!(
            sample_rate = default_config.sample_rate(),
            channels = default_config.channels(),
            format = ?default_config.sample_format(),
            "config par défaut du périphérique de sortie"
        );

        Ok((default_config.config(), default_config.sample_format()))
    }

    /// Construit le stream de sortie pour un format d'échantillon donné
    fn build_stream<T>(&self, device: &Device, config: &StreamConfig) -> AudioResult<Stream>
    where
        T: SizedSample + FromSample<f32>,
    {
        let channels = config.channels as usize;
        let mixer = Arc::clone(&self.mixer);
        let clock = Arc::clone(&self.clock_frames);

        // Buffer de travail réutilisé d'un callback à l'autre
        let mut scratch: Vec<f32> = Vec::new();

        let stream = device.build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                scratch.resize(data.len(), 0.0);

                let ended = {
                    let mut guard = lock_mixer(&mixer);
                    let ended = guard.render(&mut scratch, channels);
                    clock.store(guard.frames_rendered(), Ordering::Release);
                    ended
                };

                for (out, &sample) in data.iter_mut().zip(scratch.iter()) {
                    *out = T::from_sample(sample);
                }

                for callback in ended {
                    callback();
                }
            },
            move |err| {
                error!("❌ Erreur stream audio sortie : {}", err);
            },
            None,
        )?;

        Ok(stream)
    }
}

#[async_trait]
impl AudioOutput for CpalOutput {
    async fn open(&mut self) -> AudioResult<()> {
        if self.stream.is_some() {
            return Ok(()); // Déjà ouvert
        }

        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or(AudioError::NoDeviceFound)?;

        self.device_name = device
            .description()
            .ok()
            .map(|desc| desc.name().to_string())
            .unwrap_or_else(|| "Périphérique inconnu".to_string());

        let (stream_config, sample_format) = Self::select_config(&device)?;

        // Nouvelle horloge à chaque ouverture
        *lock_mixer(&self.mixer) = Mixer::new();
        self.clock_frames.store(0, Ordering::Release);
        self.device_rate.store(stream_config.sample_rate, Ordering::Release);

        let stream = match sample_format {
            SampleFormat::F32 => self.build_stream::<f32>(&device, &stream_config)?,
            SampleFormat::I16 => self.build_stream::<i16>(&device, &stream_config)?,
            SampleFormat::U16 => self.build_stream::<u16>(&device, &stream_config)?,
            other => {
                return Err(AudioError::ConfigError(format!(
                    "Format d'échantillon non supporté : {:?}",
                    other
                )))
            }
        };
        stream.play()?;

        info!(
            device = %self.device_name,
            device_rate = stream_config.sample_rate,
            source_rate = self.config.output_sample_rate,
            "🔊 Contexte de sortie ouvert"
        );

        self.stream = Some(stream);
        Ok(())
    }

    async fn close(&mut self) -> AudioResult<()> {
        let Some(stream) = self.stream.take() else {
            return Ok(()); // Déjà fermé
        };

        let dropped = lock_mixer(&self.mixer).clear();
        let paused = stream.pause();
        drop(stream);

        info!(dropped_voices = dropped, "🛑 Contexte de sortie fermé");

        if let Err(e) = paused {
            warn!("pause du stream de sortie impossible : {}", e);
            return Err(e.into());
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn current_time(&self) -> f64 {
        let rate = self.device_rate.load(Ordering::Acquire);
        if rate == 0 {
            return 0.0;
        }
        self.clock_frames.load(Ordering::Acquire) as f64 / rate as f64
    }

    fn schedule(
        &self,
        voice: VoiceId,
        buffer: PlaybackBuffer,
        start_at: f64,
        on_ended: OnEnded,
    ) -> AudioResult<()> {
        if self.stream.is_none() {
            return Err(AudioError::NotOpen);
        }

        let rate = self.device_rate.load(Ordering::Acquire);
        let (start_frame, samples) = place_on_device(buffer, start_at, rate);

        lock_mixer(&self.mixer).add(voice, start_frame, samples, on_ended);
        Ok(())
    }

    fn stop(&self, voice: VoiceId) -> bool {
        lock_mixer(&self.mixer).remove(voice)
    }

    fn device_info(&self) -> String {
        self.device_name.clone()
    }
}

// Implémentation de Drop pour nettoyer proprement
impl Drop for CpalOutput {
    fn drop(&mut self) {
        if self.stream.is_some() {
            debug!("🧹 Nettoyage automatique du contexte de sortie");
            // Le stream sera automatiquement arrêté quand il sera dropped
        }
    }
}
