//! Types de données pour la session avec l'agent
//!
//! Ce module contient :
//! - SessionConfig : paramètres d'une session (agent, modalité, consigne)
//! - NetworkConfig : configuration de la connexion
//! - ChannelState : machine d'état du canal
//! - SessionEvent : événements entrants remis au contrôleur
//! - ChannelStats : compteurs du canal

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use url::Url;

use audio::TransportEnvelope;

use crate::{NetworkError, NetworkResult};

/// Modalité de réponse demandée à l'agent
///
/// Seul l'audio est attendu : les réponses texte sont ignorées.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResponseModality {
    #[default]
    Audio,
}

/// Paramètres d'une session avec l'agent distant
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Identifiant de l'agent (modèle) distant
    pub agent_id: String,

    /// Toujours `Audio`
    pub response_modality: ResponseModality,

    /// Consigne envoyée à l'agent, déjà personnalisée pour le client
    pub instruction: String,
}

impl SessionConfig {
    /// Session audio uniquement
    pub fn audio_only(agent_id: impl Into<String>, instruction: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            response_modality: ResponseModality::Audio,
            instruction: instruction.into(),
        }
    }
}

/// Configuration de la connexion à l'agent
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// URL websocket du service (ws:// ou wss://)
    pub endpoint: String,

    /// Clé d'API, ajoutée à l'URL en paramètre `key`
    #[serde(skip_serializing)]
    pub api_key: Option<String>,

    /// Délai max pour ouvrir la session et recevoir l'acquittement (défaut: 10s)
    pub connect_timeout: Duration,

    /// Délai laissé aux tâches du lien pour se terminer à la fermeture (défaut: 2s)
    pub close_timeout: Duration,

    /// Enveloppes en attente d'envoi avant de dropper (défaut: 64 ≈ 16s d'audio)
    pub outbound_queue_size: usize,

    /// Événements entrants en attente de traitement (défaut: 256)
    pub event_queue_size: usize,
}

/// Endpoint par défaut du service d'agent vocal
pub const DEFAULT_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_key: None,
            connect_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(2),
            outbound_queue_size: 64,
            event_queue_size: 256,
        }
    }
}

impl NetworkConfig {
    /// Configuration pour les tests (timeouts courts, endpoint local)
    pub fn test_config() -> Self {
        Self {
            endpoint: "ws://127.0.0.1:9/agent".to_string(),
            api_key: None,
            connect_timeout: Duration::from_millis(500),
            close_timeout: Duration::from_millis(100),
            outbound_queue_size: 16,
            event_queue_size: 32,
        }
    }

    /// Valide que la configuration est cohérente
    pub fn validate(&self) -> NetworkResult<()> {
        let url = Url::parse(&self.endpoint)?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(NetworkError::InvalidEndpoint(format!(
                "schéma {} non supporté (ws ou wss attendu)",
                url.scheme()
            )));
        }

        if self.connect_timeout.is_zero() {
            return Err(NetworkError::ConfigError("connect_timeout doit être > 0".to_string()));
        }

        if self.outbound_queue_size == 0 || self.event_queue_size == 0 {
            return Err(NetworkError::ConfigError("les files doivent avoir une capacité > 0".to_string()));
        }

        Ok(())
    }

    /// URL de connexion finale, avec la clé d'API si présente
    pub fn endpoint_url(&self) -> NetworkResult<Url> {
        let mut url = Url::parse(&self.endpoint)?;
        if let Some(key) = self.api_key.as_deref().filter(|k| !k.is_empty()) {
            url.query_pairs_mut().append_pair("key", key);
        }
        Ok(url)
    }
}

/// État du canal de session
///
/// ```text
/// Idle -> Connecting -> Open -> Closing -> Closed
///              |          |
///              +--> Error <+
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
    Error,
}

impl ChannelState {
    /// Seul l'état Open accepte des envois
    pub fn can_send(&self) -> bool {
        matches!(self, ChannelState::Open)
    }

    /// Le canal ne reviendra plus à Open
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChannelState::Closing | ChannelState::Closed | ChannelState::Error)
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelState::Idle => "Idle",
            ChannelState::Connecting => "Connecting",
            ChannelState::Open => "Open",
            ChannelState::Closing => "Closing",
            ChannelState::Closed => "Closed",
            ChannelState::Error => "Error",
        };
        f.write_str(name)
    }
}

/// Événement entrant, remis dans l'ordre d'arrivée
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    /// Bloc d'audio synthétisé (PCM encodé)
    Audio(TransportEnvelope),

    /// L'agent a été interrompu par l'opérateur
    Interrupted,

    /// L'agent a fini son tour de parole
    TurnComplete,

    /// La session a été fermée par l'agent ou le réseau
    Closed { reason: Option<String> },

    /// Erreur de transport
    Error(String),
}

impl SessionEvent {
    /// Fermeture ou erreur : dernier événement d'une session
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionEvent::Closed { .. } | SessionEvent::Error(_))
    }
}

/// Compteurs du canal
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelStats {
    /// Enveloppes remises à la file d'envoi
    pub envelopes_sent: u64,

    /// Enveloppes droppées (canal pas ouvert ou file pleine)
    pub envelopes_dropped: u64,

    /// Événements non terminaux reçus
    pub events_received: u64,
}

impl ChannelStats {
    /// Pourcentage d'enveloppes perdues
    pub fn drop_percentage(&self) -> f32 {
        let total = self.envelopes_sent + self.envelopes_dropped;
        if total == 0 {
            return 0.0;
        }
        (self.envelopes_dropped as f32 / total as f32) * 100.0
    }
}
