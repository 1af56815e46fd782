//! Erreurs du contrôleur d'appel
//!
//! Les erreurs audio et réseau sont reclassées en cinq familles. Seule
//! `Protocol` est locale (un buffer ignoré) ; toutes les autres terminent
//! l'appel en cours.

use thiserror::Error;

use audio::AudioError;
use network::NetworkError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CallError {
    /// Accès au microphone refusé
    #[error("Accès au microphone refusé: {0}")]
    Permission(String),

    /// Pas de périphérique utilisable (ou format non supporté)
    #[error("Périphérique audio indisponible: {0}")]
    Device(String),

    /// Session avec l'agent impossible à ouvrir, ou tombée
    #[error("Session avec l'agent interrompue: {0}")]
    Connection(String),

    /// Payload audio reçu invalide
    #[error("Audio reçu invalide: {0}")]
    Protocol(String),

    /// Une étape de libération a échoué
    #[error("Libération de ressource échouée: {0}")]
    Resource(String),

    /// La tâche du contrôleur ne répond plus
    #[error("Le contrôleur d'appel est arrêté")]
    ControllerGone,
}

pub type CallResult<T> = Result<T, CallError>;

impl CallError {
    /// Faux uniquement pour une erreur de protocole sur un buffer
    pub fn is_fatal(&self) -> bool {
        !matches!(self, CallError::Protocol(_))
    }
}

impl From<AudioError> for CallError {
    fn from(err: AudioError) -> Self {
        match err {
            AudioError::PermissionDenied(message) => CallError::Permission(message),
            AudioError::Protocol(message) => CallError::Protocol(message),
            AudioError::Release(message) => CallError::Resource(message),
            other => CallError::Device(other.to_string()),
        }
    }
}

impl From<NetworkError> for CallError {
    fn from(err: NetworkError) -> Self {
        CallError::Connection(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_error_classification() {
        let err: CallError = AudioError::PermissionDenied("refus".into()).into();
        assert_eq!(err, CallError::Permission("refus".into()));

        let err: CallError = AudioError::NoDeviceFound.into();
        assert!(matches!(err, CallError::Device(_)));

        let err: CallError = AudioError::Protocol("tronqué".into()).into();
        assert!(!err.is_fatal());

        let err: CallError = AudioError::Release("pause".into()).into();
        assert!(matches!(err, CallError::Resource(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_network_error_classification() {
        let err: CallError = NetworkError::Handshake("refusé".into()).into();
        assert!(matches!(err, CallError::Connection(ref m) if m.contains("refusé")));
        assert!(err.is_fatal());
    }
}
