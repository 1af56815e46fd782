//! Crate audio du pont vocal - capture, encodage et lecture gapless
//!
//! Ce crate gère toute la chaîne audio :
//! - Capture microphone avec cpal, découpée en blocs PCM 16 bits
//! - Encodage/décodage PCM + base64 pour le transport
//! - Contexte de sortie cpal avec horloge
//! - Planification gapless des buffers reçus
//! - Périphériques simulés pour les tests

pub mod config;      // Configuration audio
pub mod types;       // Types de données (AudioFrame, etc.)
pub mod traits;      // Traits abstraits
pub mod capture;     // Implémentation capture avec cpal
pub mod playback;    // Implémentation sortie avec cpal
pub mod scheduler;   // Planification gapless
pub mod codec;       // Codec PCM
pub mod devices;     // Inventaire des périphériques
pub mod simulated;   // Périphériques simulés
pub mod error;       // Gestion d'erreurs

// Réexports pour faciliter l'utilisation
pub use config::*;
pub use types::*;
pub use traits::*;
pub use error::*;

// Réexports des implémentations principales
pub use capture::CpalCapture;
pub use playback::CpalOutput;
pub use scheduler::{PlaybackScheduler, ScheduledPlayback};
pub use codec::PcmCodec;
pub use simulated::{SimulatedCapture, SimulatedOutput, SimulatedFailure};

/// Tests d'intégration de la chaîne audio (sans matériel)
#[cfg(test)]
mod integration_tests {
    use super::*;

    #[tokio::test]
    async fn test_capture_to_playback_chain() {
        let config = AudioConfig::default();
        let codec = PcmCodec::new(&config);

        let mut capture = SimulatedCapture::new(config.clone());
        let mic = capture.probe();
        let mut output = SimulatedOutput::new(config.output_sample_rate);
        let speaker = output.probe();

        let mut frames = capture.open().await.unwrap();
        output.open().await.unwrap();

        for _ in 0..3 {
            assert!(mic.emit(vec![1000; config.block_size]));
        }
        capture.stop_emitting();
        capture.close().await.unwrap();

        // Boucle locale : ce qui part est rejoué tel quel
        let mut scheduler = PlaybackScheduler::new();
        let mut last_end: Option<f64> = None;
        while let Some(frame) = frames.recv().await {
            let envelope = codec.encode(&frame);
            let buffer = codec.decode(&envelope).unwrap();
            let scheduled = scheduler.schedule(&output, buffer).unwrap();
            if let Some(end) = last_end {
                assert!((scheduled.start - end).abs() < 1e-9);
            }
            last_end = Some(scheduled.end);
        }

        let records = speaker.scheduled();
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| (r.duration - 0.256).abs() < 1e-9));

        speaker.set_time(1.0);
        assert_eq!(scheduler.active_count(), 0);

        output.close().await.unwrap();
        assert_eq!(mic.close_count(), 1);
        assert_eq!(speaker.close_count(), 1);
    }
}
