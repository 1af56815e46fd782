//! Configuration audio du pont vocal
//!
//! Les taux d'échantillonnage et la taille de bloc ne sont pas des invariants :
//! ils doivent seulement rester cohérents entre la capture, le format annoncé
//! sur le fil et le décodage de la réponse.

use serde::{Deserialize, Serialize};

/// Configuration principale de la chaîne audio
///
/// `#[derive(Serialize, Deserialize)]` : permet de charger depuis un fichier
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Fréquence de capture envoyée à l'agent (Hz)
    ///
    /// 16000 Hz = format attendu par l'agent vocal
    pub input_sample_rate: u32,

    /// Fréquence de l'audio synthétisé renvoyé par l'agent (Hz)
    pub output_sample_rate: u32,

    /// Nombre de canaux transmis (la voix reste en mono)
    pub channels: u16,

    /// Nombre d'échantillons par bloc capturé
    ///
    /// 4096 échantillons à 16 kHz = 256 ms par bloc
    pub block_size: usize,

    /// Profondeur de la file entre le callback de capture et l'envoi
    ///
    /// Quand la file est pleine, le bloc est perdu plutôt que de bloquer
    /// le thread audio.
    pub capture_queue_frames: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: 16000,   // 16 kHz - entrée agent
            output_sample_rate: 24000,  // 24 kHz - sortie agent
            channels: 1,                // Mono pour la voix
            block_size: 4096,           // ~256 ms par bloc
            capture_queue_frames: 8,    // ~2 s de marge
        }
    }
}

impl AudioConfig {
    /// Durée d'un bloc capturé en millisecondes
    ///
    /// Exemple : 4096 / 16000 * 1000 = 256 ms
    pub fn block_duration_ms(&self) -> f64 {
        if self.input_sample_rate == 0 {
            return 0.0;
        }
        self.block_size as f64 * 1000.0 / self.input_sample_rate as f64
    }

    /// Descripteur de format des blocs envoyés
    pub fn input_mime_type(&self) -> String {
        pcm_mime_type(self.input_sample_rate)
    }

    /// Descripteur de format attendu pour l'audio reçu
    pub fn output_mime_type(&self) -> String {
        pcm_mime_type(self.output_sample_rate)
    }

    /// Valide que la configuration est cohérente
    pub fn validate(&self) -> Result<(), String> {
        for (name, rate) in [("entrée", self.input_sample_rate), ("sortie", self.output_sample_rate)] {
            if !(8000..=48000).contains(&rate) {
                return Err(format!("Sample rate {} invalide: {} (doit être entre 8000 et 48000)", name, rate));
            }
        }

        if self.channels != 1 {
            return Err(format!("Nombre de canaux invalide: {} (seul le mono est transmis)", self.channels));
        }

        if self.block_size < 256 || self.block_size > 16384 {
            return Err(format!("Taille de bloc invalide: {} (doit être entre 256 et 16384)", self.block_size));
        }

        if self.capture_queue_frames == 0 {
            return Err("La file de capture doit contenir au moins un bloc".to_string());
        }

        Ok(())
    }

    /// Blocs plus courts : moins de latence, plus de messages
    pub fn low_latency() -> Self {
        Self {
            block_size: 2048,           // 128 ms
            capture_queue_frames: 16,
            ..Default::default()
        }
    }
}

/// Descripteur de PCM 16 bits mono à un taux donné
pub fn pcm_mime_type(sample_rate: u32) -> String {
    format!("audio/pcm;rate={}", sample_rate)
}
