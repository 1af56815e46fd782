//! Gestion d'erreurs pour le système audio
//!
//! Ce module définit les erreurs de la chaîne audio : acquisition des
//! périphériques, flux cpal, décodage des payloads reçus et libération.

use thiserror::Error;

/// Énumération de toutes les erreurs possibles dans le système audio
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AudioError {
    /// L'accès au microphone a été refusé par le système
    #[error("Accès au microphone refusé: {0}")]
    PermissionDenied(String),

    /// Aucun périphérique audio (microphone ou haut-parleurs) n'a été trouvé
    #[error("Aucun périphérique audio trouvé")]
    NoDeviceFound,

    /// Erreur lors de la configuration des paramètres audio (sample rate, etc.)
    #[error("Erreur de configuration audio: {0}")]
    ConfigError(String),

    /// Erreur remontée par un flux cpal en cours d'utilisation
    #[error("Erreur de flux audio: {0}")]
    StreamError(String),

    /// Payload audio reçu mal formé ou tronqué
    #[error("Payload audio invalide: {0}")]
    Protocol(String),

    /// Opération sur un périphérique qui n'est pas ouvert
    #[error("Périphérique audio non ouvert")]
    NotOpen,

    /// Échec pendant la libération d'une ressource audio
    #[error("Échec de libération: {0}")]
    Release(String),
}

impl AudioError {
    /// Classe un message d'erreur backend : refus d'accès ou erreur générique
    fn from_backend(context: &str, message: String) -> Self {
        let lower = message.to_lowercase();
        if lower.contains("permission") || lower.contains("denied") || lower.contains("not permitted") {
            AudioError::PermissionDenied(message)
        } else {
            AudioError::ConfigError(format!("{}: {}", context, message))
        }
    }
}

/// Conversion des erreurs de démarrage de flux
impl From<cpal::PlayStreamError> for AudioError {
    fn from(err: cpal::PlayStreamError) -> Self {
        match err {
            cpal::PlayStreamError::DeviceNotAvailable => AudioError::NoDeviceFound,
            other => AudioError::from_backend("Erreur démarrage stream", other.to_string()),
        }
    }
}

/// Conversion des erreurs cpal::BuildStreamError
impl From<cpal::BuildStreamError> for AudioError {
    fn from(err: cpal::BuildStreamError) -> Self {
        match err {
            cpal::BuildStreamError::DeviceNotAvailable => AudioError::NoDeviceFound,
            other => AudioError::from_backend("Erreur construction stream", other.to_string()),
        }
    }
}

/// Conversion des erreurs cpal::DefaultStreamConfigError
impl From<cpal::DefaultStreamConfigError> for AudioError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        match err {
            cpal::DefaultStreamConfigError::DeviceNotAvailable => AudioError::NoDeviceFound,
            other => AudioError::from_backend("Erreur config par défaut", other.to_string()),
        }
    }
}

/// Conversion des erreurs cpal::PauseStreamError
impl From<cpal::PauseStreamError> for AudioError {
    fn from(err: cpal::PauseStreamError) -> Self {
        AudioError::Release(format!("Erreur pause stream: {}", err))
    }
}

/// Conversion des erreurs survenant pendant la vie d'un flux
impl From<cpal::StreamError> for AudioError {
    fn from(err: cpal::StreamError) -> Self {
        match err {
            cpal::StreamError::DeviceNotAvailable => AudioError::NoDeviceFound,
            other => AudioError::StreamError(other.to_string()),
        }
    }
}

/// Type Result personnalisé pour notre crate
///
/// Au lieu d'écrire Result<T, AudioError> partout, on peut écrire AudioResult<T>
pub type AudioResult<T> = Result<T, AudioError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = AudioError::NoDeviceFound;
        assert_eq!(error.to_string(), "Aucun périphérique audio trouvé");

        let error = AudioError::ConfigError("Test".to_string());
        assert_eq!(error.to_string(), "Erreur de configuration audio: Test");
    }

    #[test]
    fn test_backend_classification() {
        let err = AudioError::from_backend("ctx", "Access denied by the user".to_string());
        assert!(matches!(err, AudioError::PermissionDenied(_)));

        let err = AudioError::from_backend("ctx", "format not supported".to_string());
        assert_eq!(err, AudioError::ConfigError("ctx: format not supported".to_string()));
    }

    #[test]
    fn test_cpal_conversions() {
        let err: AudioError = cpal::BuildStreamError::DeviceNotAvailable.into();
        assert_eq!(err, AudioError::NoDeviceFound);

        let err: AudioError = cpal::PlayStreamError::DeviceNotAvailable.into();
        assert_eq!(err, AudioError::NoDeviceFound);
    }
}
