//! Traits abstraits pour le système audio
//!
//! Ce module définit les interfaces que doivent implémenter les périphériques
//! et le codec. Le contrôleur d'appel ne manipule que ces traits, ce qui
//! permet de le tester avec les implémentations simulées.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{AudioError, AudioFrame, AudioResult, PlaybackBuffer, TransportEnvelope, VoiceId};

/// Callback appelé quand une lecture planifiée se termine naturellement
///
/// Il n'est pas appelé si la lecture est arrêtée de force.
pub type OnEnded = Box<dyn FnOnce() + Send + 'static>;

/// Trait pour capturer l'audio depuis le microphone
///
/// `#[async_trait]` permet d'avoir des fonctions async dans les traits.
/// `Send + Sync` permet de déplacer la capture dans une tâche tokio.
#[async_trait]
pub trait AudioCapture: Send + Sync {
    /// Ouvre le microphone et commence la capture
    ///
    /// Retourne la file des blocs capturés, dans l'ordre de capture.
    /// La file se ferme quand la capture est fermée. Pour recapturer après
    /// `close()`, il faut rappeler `open()`.
    ///
    /// # Erreurs
    /// - `AudioError::PermissionDenied` : accès au micro refusé
    /// - `AudioError::NoDeviceFound` : aucun microphone
    /// - `AudioError::ConfigError` : format du périphérique non supporté
    ///
    /// # Example
    /// ```rust,no_run
    /// use audio::{AudioCapture, CpalCapture, AudioConfig};
    ///
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let mut capture = CpalCapture::new(AudioConfig::default());
    /// let mut frames = capture.open().await?;
    ///
    /// while let Some(frame) = frames.recv().await {
    ///     println!("Bloc {} : {} échantillons", frame.sequence_number, frame.len());
    /// }
    /// # Ok(())
    /// # }
    /// ```
    async fn open(&mut self) -> AudioResult<mpsc::Receiver<AudioFrame>>;

    /// Ferme le microphone
    ///
    /// Idempotent : sans effet si la capture n'a jamais été ouverte ou est
    /// déjà fermée.
    async fn close(&mut self) -> AudioResult<()>;

    /// Coupe immédiatement l'émission de blocs, sans libérer le périphérique
    ///
    /// Appelé au tout début d'une fermeture de session : aucun bloc ne doit
    /// plus sortir une fois la fermeture commencée.
    fn stop_emitting(&self);

    /// Erreur qui a interrompu le flux en cours de capture
    ///
    /// Quand le micro disparaît, la file des blocs se ferme d'elle-même et
    /// cette méthode en donne la raison. `None` tant que le flux est sain.
    fn stream_error(&self) -> Option<AudioError>;

    /// Vérifie si la capture est ouverte
    fn is_recording(&self) -> bool;

    /// Retourne des informations sur le périphérique utilisé
    fn device_info(&self) -> String {
        "Périphérique inconnu".to_string()
    }
}

/// Trait pour un contexte de sortie audio avec horloge
///
/// La sortie expose une horloge en secondes (`current_time`) et accepte des
/// buffers planifiés à un instant absolu de cette horloge. C'est le
/// `PlaybackScheduler` qui calcule ces instants.
#[async_trait]
pub trait AudioOutput: Send + Sync {
    /// Ouvre le périphérique de sortie et démarre l'horloge
    async fn open(&mut self) -> AudioResult<()>;

    /// Ferme le périphérique ; les lectures en cours sont abandonnées
    ///
    /// Idempotent.
    async fn close(&mut self) -> AudioResult<()>;

    fn is_open(&self) -> bool;

    /// Horloge de sortie en secondes depuis l'ouverture
    fn current_time(&self) -> f64;

    /// Planifie un buffer pour démarrer à `start_at` (horloge de sortie)
    ///
    /// Ne bloque pas. `on_ended` est appelé quand le buffer a été joué
    /// en entier.
    fn schedule(
        &self,
        voice: VoiceId,
        buffer: PlaybackBuffer,
        start_at: f64,
        on_ended: OnEnded,
    ) -> AudioResult<()>;

    /// Arrête une lecture planifiée ou en cours
    ///
    /// Retourne `false` si la lecture était déjà terminée.
    fn stop(&self, voice: VoiceId) -> bool;

    fn device_info(&self) -> String {
        "Périphérique de sortie inconnu".to_string()
    }
}

/// Trait pour encoder les blocs sortants et décoder l'audio reçu
///
/// Côté montant, l'encodage ne peut pas échouer. Côté descendant, un payload
/// invalide produit une `AudioError::Protocol` qui ne concerne que ce buffer.
pub trait AudioCodec: Send + Sync {
    /// Encode un bloc capturé en enveloppe de transport
    fn encode(&self, frame: &AudioFrame) -> TransportEnvelope;

    /// Décode une enveloppe reçue en buffer de lecture
    fn decode(&self, envelope: &TransportEnvelope) -> AudioResult<PlaybackBuffer>;
}
