//! Gestion d'erreurs pour la session avec l'agent
//!
//! Ce module définit les erreurs de la connexion websocket et du protocole.
//! Il suit les mêmes patterns que le module audio pour la cohérence du code.

use thiserror::Error;

/// Énumération de toutes les erreurs possibles côté réseau
#[derive(Error, Debug)]
pub enum NetworkError {
    /// La session distante n'a pas pu être ouverte ou est tombée
    #[error("Connexion à l'agent impossible: {0}")]
    ConnectionFailed(String),

    /// Pas d'acquittement de l'agent dans le délai imparti
    #[error("Timeout de connexion après {timeout_ms}ms")]
    ConnectionTimeout { timeout_ms: u64 },

    /// L'agent a refusé ou interrompu la mise en place de la session
    #[error("Échec de la mise en place de la session: {0}")]
    Handshake(String),

    /// La connexion a abouti après une demande de fermeture
    #[error("Connexion annulée: le canal a été fermé entre-temps")]
    Cancelled,

    /// Opération tentée alors que le canal n'est pas dans le bon état
    #[error("Opération {operation} invalide dans l'état {current_state}")]
    InvalidState { operation: String, current_state: String },

    /// URL du service invalide
    #[error("Endpoint invalide: {0}")]
    InvalidEndpoint(String),

    /// Erreur lors de la sérialisation/désérialisation des messages
    #[error("Erreur de sérialisation: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Erreur de configuration réseau
    #[error("Configuration réseau invalide: {0}")]
    ConfigError(String),
}

/// Conversion des erreurs websocket
impl From<tokio_tungstenite::tungstenite::Error> for NetworkError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        NetworkError::ConnectionFailed(err.to_string())
    }
}

/// Conversion automatique des erreurs de parsing d'URL
impl From<url::ParseError> for NetworkError {
    fn from(err: url::ParseError) -> Self {
        NetworkError::InvalidEndpoint(err.to_string())
    }
}

/// Type Result personnalisé pour notre crate network
pub type NetworkResult<T> = Result<T, NetworkError>;

impl NetworkError {
    /// Crée une erreur d'état avec contexte
    pub fn invalid_state(operation: &str, current_state: impl std::fmt::Display) -> Self {
        Self::InvalidState {
            operation: operation.to_string(),
            current_state: current_state.to_string(),
        }
    }

    /// Crée une erreur de timeout à partir de la durée configurée
    pub fn timeout(after: std::time::Duration) -> Self {
        Self::ConnectionTimeout {
            timeout_ms: after.as_millis() as u64,
        }
    }

    /// Vrai si la connexion a été abandonnée suite à une fermeture locale
    pub fn is_cancellation(&self) -> bool {
        matches!(self, NetworkError::Cancelled)
    }

    /// Vrai pour les erreurs de mise en place (connexion, délai, refus)
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            NetworkError::ConnectionFailed(_)
                | NetworkError::ConnectionTimeout { .. }
                | NetworkError::Handshake(_)
        )
    }
}
