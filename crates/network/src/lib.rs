//! Crate network - Session temps réel avec l'agent vocal distant
//!
//! Ce crate fournit le canal duplex entre la console et l'agent : ouverture
//! de session, envoi des blocs audio encodés, réception des événements
//! (audio synthétisé, interruption, fermeture, erreur).
//!
//! # Architecture
//!
//! Le crate est organisé en plusieurs modules :
//!
//! - `error` : Gestion d'erreurs avec types spécialisés réseau
//! - `types` : Types de données (configurations, états, événements, statistiques)
//! - `protocol` : Messages JSON échangés avec l'agent
//! - `traits` : Trait `AgentTransport` et lien ouvert
//! - `transport` : Implémentations websocket (réelle) et simulée
//! - `channel` : `SessionChannel`, machine d'état de la session
//!
//! # Examples
//!
//! ## Session réelle
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use network::{NetworkConfig, SessionChannel, SessionConfig, SessionEvent, WebSocketTransport};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut config = NetworkConfig::default();
//! config.api_key = std::env::var("AGENT_API_KEY").ok();
//!
//! let transport = Arc::new(WebSocketTransport::new(config.clone())?);
//! let channel = SessionChannel::new(transport, config);
//!
//! let session = SessionConfig::audio_only("agent-voix", "Assiste le client");
//! let mut events = channel.connect(&session).await?;
//!
//! while let Some(event) = events.recv().await {
//!     if let SessionEvent::Audio(envelope) = event {
//!         println!("{} octets encodés reçus", envelope.data.len());
//!     }
//! }
//! channel.close().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Tests et simulation
//!
//! ```rust
//! use std::sync::Arc;
//! use network::{NetworkConfig, SessionChannel, SimulatedTransport};
//!
//! // Agent simulé en mémoire (sans vrai réseau)
//! let config = NetworkConfig::test_config();
//! let transport = SimulatedTransport::new(config.clone());
//! let agent = transport.agent();
//! let channel = SessionChannel::new(Arc::new(transport), config);
//! ```

// Modules internes
mod error;
mod types;
mod protocol;
mod traits;
mod transport;
mod channel;

// Re-exports publics
pub use error::{NetworkError, NetworkResult};

pub use types::{
    ChannelState, ChannelStats, NetworkConfig, ResponseModality, SessionConfig, SessionEvent,
    DEFAULT_ENDPOINT,
};

pub use protocol::{ClientMessage, ServerMessage};

pub use traits::{AgentTransport, LinkTasks, TransportLink};

pub use transport::{SimulatedAgent, SimulatedTransport, WebSocketTransport};

pub use channel::SessionChannel;

/// Fonctions utilitaires pour l'utilisateur final
pub mod utils {
    /// Formate une durée en millisecondes de façon lisible
    ///
    /// # Example
    /// ```rust
    /// use network::utils;
    /// use std::time::Duration;
    ///
    /// let duration = Duration::from_millis(1234);
    /// assert_eq!(utils::format_duration(duration), "1.23s");
    ///
    /// let short_duration = Duration::from_millis(56);
    /// assert_eq!(utils::format_duration(short_duration), "56ms");
    /// ```
    pub fn format_duration(duration: std::time::Duration) -> String {
        let ms = duration.as_millis();

        if ms >= 1000 {
            format!("{:.2}s", ms as f64 / 1000.0)
        } else {
            format!("{}ms", ms)
        }
    }

    /// Masque une clé d'API pour les logs (garde les 4 derniers caractères)
    ///
    /// # Example
    /// ```rust
    /// use network::utils;
    ///
    /// assert_eq!(utils::mask_secret("abcdef123456"), "********3456");
    /// assert_eq!(utils::mask_secret("abc"), "***");
    /// ```
    pub fn mask_secret(secret: &str) -> String {
        let count = secret.chars().count();
        if count <= 4 {
            return "*".repeat(count);
        }
        let visible: String = secret.chars().skip(count - 4).collect();
        format!("{}{}", "*".repeat(count - 4), visible)
    }
}

/// Tests d'intégration du crate complet
#[cfg(test)]
mod integration_tests {
    use super::*;
    use audio::{AudioCodec, AudioConfig, AudioFrame, PcmCodec};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_full_session_with_simulated_agent() {
        let config = NetworkConfig::test_config();
        let transport = SimulatedTransport::new(config.clone());
        let agent = transport.agent();
        let channel = SessionChannel::new(Arc::new(transport), config);

        let audio_config = AudioConfig::default();
        let codec = PcmCodec::new(&audio_config);

        let mut events = channel.connect(&SessionConfig::audio_only("agent", "consigne")).await.unwrap();

        // Montant : blocs capturés -> enveloppes, dans l'ordre
        for seq in 0..4 {
            let frame = AudioFrame::new(vec![seq as i16; 64], audio_config.input_sample_rate, seq);
            assert!(channel.send(codec.encode(&frame)));
        }
        assert!(agent.wait_for_sent(4, Duration::from_secs(1)).await);

        let decoded: Vec<i16> = agent
            .sent()
            .iter()
            .map(|envelope| {
                assert_eq!(envelope.mime_type, "audio/pcm;rate=16000");
                let buffer = codec.decode(envelope).unwrap();
                (buffer.samples[0] * 32768.0).round() as i16
            })
            .collect();
        assert_eq!(decoded, vec![0, 1, 2, 3]);

        // Descendant : audio de l'agent puis fermeture
        let reply = codec.encode(&AudioFrame::new(vec![100; 240], 24000, 0));
        assert!(agent.push_audio(reply.clone()));
        assert!(agent.close_remote(None));

        assert_eq!(events.recv().await, Some(SessionEvent::Audio(reply)));
        assert_eq!(events.recv().await, Some(SessionEvent::Closed { reason: None }));
        assert_eq!(channel.state(), ChannelState::Closed);
    }

    #[test]
    fn test_utility_functions() {
        assert_eq!(utils::format_duration(Duration::from_millis(1500)), "1.50s");
        assert_eq!(utils::format_duration(Duration::from_millis(20)), "20ms");
        assert_eq!(utils::mask_secret("cle-api-secrete"), "***********rete");
        assert_eq!(utils::mask_secret(""), "");
    }

    #[test]
    fn test_config_presets() {
        let default_config = NetworkConfig::default();
        let test_config = NetworkConfig::test_config();

        // Les tests doivent avoir des timeouts très courts
        assert!(test_config.connect_timeout < default_config.connect_timeout);
        assert!(test_config.close_timeout < default_config.close_timeout);
        assert!(default_config.endpoint.starts_with("wss://"));
    }
}
