//! Codec PCM linéaire pour l'échange avec l'agent vocal
//!
//! Ce module implémente le trait AudioCodec pour le seul format échangé :
//! du PCM 16 bits little-endian, mono, encodé en base64 dans une enveloppe
//! `{mimeType, data}`.
//!
//! - Montant : AudioFrame (i16) -> bytes LE -> base64
//! - Descendant : base64 -> bytes LE -> i16 -> f32 normalisé [-1.0, 1.0]
//!
//! Aucune compression : le transcodage n'est pas géré.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use tracing::debug;

use crate::{
    pcm_mime_type, AudioCodec, AudioConfig, AudioError, AudioFrame, AudioResult, PlaybackBuffer,
    TransportEnvelope, PCM_SCALE,
};

/// Codec PCM sans état
///
/// Il ne garde que les taux de la configuration : le taux d'entrée sert de
/// repli pour un bloc sans taux, le taux de sortie pour un payload reçu
/// dont le descripteur n'annonce pas de `rate=`.
#[derive(Clone, Debug)]
pub struct PcmCodec {
    input_sample_rate: u32,
    output_sample_rate: u32,
}

impl PcmCodec {
    /// Crée un codec à partir de la configuration audio
    ///
    /// # Example
    /// ```rust
    /// use audio::{AudioCodec, AudioConfig, AudioFrame, PcmCodec};
    ///
    /// let codec = PcmCodec::new(&AudioConfig::default());
    /// let envelope = codec.encode(&AudioFrame::new(vec![1, -1], 16000, 0));
    /// assert_eq!(envelope.mime_type, "audio/pcm;rate=16000");
    /// assert_eq!(envelope.data, "AQD//w==");
    /// ```
    pub fn new(config: &AudioConfig) -> Self {
        Self {
            input_sample_rate: config.input_sample_rate,
            output_sample_rate: config.output_sample_rate,
        }
    }

    /// Décode des octets PCM bruts (sans base64)
    pub fn decode_bytes(&self, bytes: &[u8], sample_rate: u32) -> AudioResult<PlaybackBuffer> {
        if bytes.is_empty() {
            return Err(AudioError::Protocol("payload vide".to_string()));
        }

        // Un échantillon tronqué signifie un payload corrompu
        if bytes.len() % 2 != 0 {
            return Err(AudioError::Protocol(format!(
                "longueur impaire ({} octets) pour du PCM 16 bits",
                bytes.len()
            )));
        }

        let samples = bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / PCM_SCALE)
            .collect();

        Ok(PlaybackBuffer::new(samples, sample_rate))
    }
}

impl AudioCodec for PcmCodec {
    fn encode(&self, frame: &AudioFrame) -> TransportEnvelope {
        let rate = if frame.sample_rate == 0 {
            self.input_sample_rate
        } else {
            frame.sample_rate
        };

        TransportEnvelope::new(
            pcm_mime_type(rate),
            STANDARD.encode(frame.to_le_bytes()),
        )
    }

    fn decode(&self, envelope: &TransportEnvelope) -> AudioResult<PlaybackBuffer> {
        if !envelope.mime_type.is_empty() && !envelope.mime_type.starts_with("audio/pcm") {
            return Err(AudioError::Protocol(format!(
                "format non supporté: {}",
                envelope.mime_type
            )));
        }

        let sample_rate = envelope.declared_rate().unwrap_or(self.output_sample_rate);
        if sample_rate == 0 {
            return Err(AudioError::Protocol("taux d'échantillonnage nul".to_string()));
        }

        let bytes = STANDARD
            .decode(envelope.data.trim())
            .map_err(|e| AudioError::Protocol(format!("base64 invalide: {}", e)))?;

        let buffer = self.decode_bytes(&bytes, sample_rate)?;
        debug!(samples = buffer.len(), sample_rate, "payload audio décodé");
        Ok(buffer)
    }
}
