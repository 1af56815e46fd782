//! Configuration de la console d'appel
//!
//! Regroupe la configuration audio, la configuration réseau et les
//! paramètres de la session avec l'agent (identifiant, consigne).

use audio::AudioConfig;
use network::{NetworkConfig, SessionConfig};

use crate::{CallError, CallResult};

/// Agent vocal utilisé par défaut
pub const DEFAULT_AGENT_ID: &str = "gemini-2.5-flash-native-audio-preview-12-2025";

/// Emplacement du nom du client dans la consigne
pub const CLIENT_PLACEHOLDER: &str = "{client}";

/// Consigne envoyée à l'agent ; `{client}` est remplacé par le nom du client
pub const DEFAULT_INSTRUCTION: &str = "Tu es l'assistant projet de l'agence et tu parles directement \
avec un membre de l'équipe support. Le client dont le dossier est ouvert s'appelle {client}. \
Aide l'équipe à discuter des détails du projet, donne des conseils techniques ou résume \
oralement les points abordés avec ce client.";

/// Configuration complète de la console
#[derive(Clone, Debug)]
pub struct ConsoleConfig {
    pub audio: AudioConfig,
    pub network: NetworkConfig,

    /// Identifiant de l'agent distant
    pub agent_id: String,

    /// Modèle de consigne, contenant `{client}`
    pub instruction_template: String,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            audio: AudioConfig::default(),
            network: NetworkConfig::default(),
            agent_id: DEFAULT_AGENT_ID.to_string(),
            instruction_template: DEFAULT_INSTRUCTION.to_string(),
        }
    }
}

impl ConsoleConfig {
    /// Configuration pour les tests (timeouts réseau courts)
    pub fn test_config() -> Self {
        Self {
            network: NetworkConfig::test_config(),
            ..Self::default()
        }
    }

    /// Paramètres de session pour le client dont le dossier est ouvert
    ///
    /// # Example
    /// ```rust
    /// use console::ConsoleConfig;
    ///
    /// let session = ConsoleConfig::default().session_config("Jeanne Martin");
    /// assert!(session.instruction.contains("Jeanne Martin"));
    /// ```
    pub fn session_config(&self, client_name: &str) -> SessionConfig {
        let client = client_name.trim();
        let client = if client.is_empty() { "inconnu" } else { client };

        SessionConfig::audio_only(
            self.agent_id.clone(),
            self.instruction_template.replace(CLIENT_PLACEHOLDER, client),
        )
    }

    /// Vérifie la cohérence des trois configurations
    pub fn validate(&self) -> CallResult<()> {
        self.audio.validate().map_err(CallError::Device)?;
        self.network.validate()?;

        if self.agent_id.trim().is_empty() {
            return Err(CallError::Connection("identifiant d'agent vide".to_string()));
        }
        Ok(())
    }
}
