//! Types de données pour le pont vocal
//!
//! Ce module définit les structures qui circulent dans la chaîne audio :
//! - AudioFrame : bloc PCM 16 bits capturé au micro
//! - TransportEnvelope : bloc encodé prêt à partir sur le réseau (ou reçu)
//! - PlaybackBuffer : échantillons décodés prêts à être planifiés
//! - VoiceId : identifiant d'une lecture planifiée sur la sortie

use std::time::Instant;
use serde::{Deserialize, Serialize};

/// Type pour un échantillon PCM linéaire signé 16 bits
///
/// C'est le format échangé avec l'agent distant dans les deux sens.
pub type Sample = i16;

/// Facteur de normalisation entre i16 et f32
///
/// On divise par 32768 (et non 32767) pour que -32768 donne exactement -1.0.
pub const PCM_SCALE: f32 = 32768.0;

/// Bloc d'audio capturé (PCM linéaire mono)
///
/// Un bloc couvre une durée fixe (~256 ms pour 4096 échantillons à 16 kHz).
/// Il est immuable une fois capturé et passe d'étape en étape par move.
#[derive(Clone, Debug, PartialEq)]
pub struct AudioFrame {
    /// Échantillons mono au taux d'entrée
    pub samples: Vec<Sample>,

    /// Fréquence d'échantillonnage des échantillons (Hz)
    pub sample_rate: u32,

    /// Numéro de séquence attribué à la capture
    ///
    /// Incrémenté pour chaque bloc émis, permet de vérifier l'ordre en aval.
    pub sequence_number: u64,

    /// Instant de fin de capture du bloc
    pub timestamp: Instant,
}

impl AudioFrame {
    /// Crée un nouveau bloc à partir d'échantillons déjà convertis en i16
    ///
    /// # Example
    /// ```rust
    /// use audio::AudioFrame;
    ///
    /// let frame = AudioFrame::new(vec![0, 1200, -1200, 0], 16000, 7);
    /// assert_eq!(frame.sequence_number, 7);
    /// ```
    pub fn new(samples: Vec<Sample>, sample_rate: u32, sequence_number: u64) -> Self {
        Self {
            samples,
            sample_rate,
            sequence_number,
            timestamp: Instant::now(),
        }
    }

    /// Convertit des échantillons flottants [-1.0, 1.0] en bloc PCM 16 bits
    ///
    /// Les valeurs hors plage sont écrêtées, un NaN devient du silence.
    pub fn from_f32(samples: &[f32], sample_rate: u32, sequence_number: u64) -> Self {
        let pcm = samples.iter().map(|&s| f32_to_pcm(s)).collect();
        Self::new(pcm, sample_rate, sequence_number)
    }

    /// Crée un bloc de silence
    pub fn silence(sample_count: usize, sample_rate: u32, sequence_number: u64) -> Self {
        Self::new(vec![0; sample_count], sample_rate, sequence_number)
    }

    /// Nombre d'échantillons du bloc
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Durée du bloc en secondes
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// Sérialise les échantillons en little-endian (2 bytes par échantillon)
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.samples.len() * 2);
        for sample in &self.samples {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        bytes
    }
}

/// Conversion d'un échantillon flottant vers i16 avec écrêtage
pub fn f32_to_pcm(sample: f32) -> Sample {
    if sample.is_nan() {
        return 0;
    }
    let scaled = sample.clamp(-1.0, 1.0) * PCM_SCALE;
    scaled.clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// Enveloppe de transport : un bloc PCM encodé en base64 + son format
///
/// La même forme sert dans les deux sens (`mimeType` / `data` sur le fil).
/// Une enveloppe sortante est créée par bloc, envoyée immédiatement et
/// jamais conservée après l'envoi.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportEnvelope {
    /// Descripteur de format, ex. `audio/pcm;rate=16000`
    pub mime_type: String,

    /// Octets PCM encodés en base64
    pub data: String,
}

impl TransportEnvelope {
    pub fn new(mime_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            mime_type: mime_type.into(),
            data: data.into(),
        }
    }

    /// Indique si le descripteur annonce de l'audio
    pub fn is_audio(&self) -> bool {
        self.mime_type.starts_with("audio/")
    }

    /// Extrait le paramètre `rate=` du descripteur s'il est présent
    ///
    /// ```rust
    /// use audio::TransportEnvelope;
    ///
    /// let env = TransportEnvelope::new("audio/pcm;rate=24000", "");
    /// assert_eq!(env.declared_rate(), Some(24000));
    /// ```
    pub fn declared_rate(&self) -> Option<u32> {
        self.mime_type
            .split(';')
            .skip(1)
            .filter_map(|param| param.trim().strip_prefix("rate="))
            .find_map(|value| value.trim().parse().ok())
    }
}

/// Buffer décodé prêt à être planifié pour la lecture
///
/// Échantillons flottants normalisés [-1.0, 1.0], mono.
#[derive(Clone, Debug, PartialEq)]
pub struct PlaybackBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl PlaybackBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self { samples, sample_rate }
    }

    /// Durée du buffer en secondes
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Rééchantillonne le buffer vers un autre taux (interpolation linéaire)
    pub fn resampled(&self, target_rate: u32) -> PlaybackBuffer {
        PlaybackBuffer::new(
            resample_linear(&self.samples, self.sample_rate, target_rate),
            target_rate,
        )
    }
}

/// Rééchantillonnage linéaire d'un buffer complet
///
/// Suffisant pour de la voix ; aucun filtrage anti-repliement.
pub fn resample_linear(input: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if input.is_empty() || from_rate == 0 || to_rate == 0 || from_rate == to_rate {
        return input.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = ((input.len() as f64 / ratio).round() as usize).max(1);
    let last = input.len() - 1;

    (0..out_len)
        .map(|i| {
            let pos = i as f64 * ratio;
            let idx = (pos.floor() as usize).min(last);
            let frac = (pos - idx as f64) as f32;
            let a = input[idx];
            let b = input[(idx + 1).min(last)];
            a + (b - a) * frac
        })
        .collect()
}

/// Identifiant d'une lecture planifiée sur un contexte de sortie
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VoiceId(pub u64);

impl std::fmt::Display for VoiceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "voice#{}", self.0)
    }
}
