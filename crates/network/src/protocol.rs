//! Messages JSON échangés avec l'agent
//!
//! Client -> agent :
//! - `{"setup": {...}}` en premier message
//! - `{"realtimeInput": {"mediaChunks": [{"mimeType", "data"}]}}` par bloc
//!
//! Agent -> client :
//! - `{"setupComplete": {}}` acquitte la session
//! - `{"serverContent": {"modelTurn": {"parts": [...]}, "interrupted", "turnComplete"}}`
//! - `{"goAway": {...}}` annonce une fermeture prochaine

use serde::{Deserialize, Serialize};

use audio::TransportEnvelope;

use crate::{NetworkResult, ResponseModality, SessionConfig, SessionEvent};

/// Message envoyé à l'agent
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(SetupMessage),
    RealtimeInput(RealtimeInput),
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupMessage {
    pub model: String,
    pub generation_config: GenerationConfig,
    pub system_instruction: Content,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<ResponseModality>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Content {
    pub parts: Vec<TextPart>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TextPart {
    pub text: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<TransportEnvelope>,
}

impl ClientMessage {
    /// Premier message d'une session
    pub fn setup(config: &SessionConfig) -> Self {
        ClientMessage::Setup(SetupMessage {
            model: config.agent_id.clone(),
            generation_config: GenerationConfig {
                response_modalities: vec![config.response_modality],
            },
            system_instruction: Content {
                parts: vec![TextPart {
                    text: config.instruction.clone(),
                }],
            },
        })
    }

    /// Un bloc audio capturé
    pub fn audio(envelope: TransportEnvelope) -> Self {
        ClientMessage::RealtimeInput(RealtimeInput {
            media_chunks: vec![envelope],
        })
    }

    pub fn to_json(&self) -> NetworkResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Message reçu de l'agent
///
/// Tous les champs sont optionnels : un message inconnu est simplement vide.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<serde_json::Value>,

    #[serde(default)]
    pub server_content: Option<ServerContent>,

    #[serde(default)]
    pub go_away: Option<serde_json::Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<ModelTurn>,

    #[serde(default)]
    pub turn_complete: bool,

    #[serde(default)]
    pub interrupted: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct ModelTurn {
    #[serde(default)]
    pub parts: Vec<ServerPart>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerPart {
    #[serde(default)]
    pub inline_data: Option<TransportEnvelope>,

    #[serde(default)]
    pub text: Option<String>,
}

impl ServerMessage {
    /// Parse un message texte ou binaire
    pub fn parse(bytes: &[u8]) -> NetworkResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn is_setup_complete(&self) -> bool {
        self.setup_complete.is_some()
    }

    pub fn is_go_away(&self) -> bool {
        self.go_away.is_some()
    }

    /// Convertit le message en événements, dans l'ordre du message
    ///
    /// Une interruption passe en premier : l'audio qui suit appartient au
    /// nouveau tour. Chaque partie audio devient un événement.
    pub fn into_events(self) -> Vec<SessionEvent> {
        let Some(content) = self.server_content else {
            return Vec::new();
        };

        let mut events = Vec::new();
        if content.interrupted {
            events.push(SessionEvent::Interrupted);
        }

        if let Some(turn) = content.model_turn {
            events.extend(
                turn.parts
                    .into_iter()
                    .filter_map(|part| part.inline_data)
                    .filter(|data| data.is_audio())
                    .map(SessionEvent::Audio),
            );
        }

        if content.turn_complete {
            events.push(SessionEvent::TurnComplete);
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn test_setup_message_shape() {
        let config = SessionConfig::audio_only("agent-voix", "Assiste Marie Dupont");
        let value: Value = serde_json::from_str(&ClientMessage::setup(&config).to_json().unwrap()).unwrap();

        assert_eq!(
            value,
            json!({
                "setup": {
                    "model": "agent-voix",
                    "generationConfig": { "responseModalities": ["AUDIO"] },
                    "systemInstruction": { "parts": [{ "text": "Assiste Marie Dupont" }] }
                }
            })
        );
    }

    #[test]
    fn test_audio_message_shape() {
        let envelope = TransportEnvelope::new("audio/pcm;rate=16000", "AAE=");
        let value: Value = serde_json::from_str(&ClientMessage::audio(envelope).to_json().unwrap()).unwrap();

        assert_eq!(
            value,
            json!({
                "realtimeInput": {
                    "mediaChunks": [{ "mimeType": "audio/pcm;rate=16000", "data": "AAE=" }]
                }
            })
        );
    }

    #[test]
    fn test_setup_complete() {
        let msg = ServerMessage::parse(br#"{"setupComplete": {}}"#).unwrap();
        assert!(msg.is_setup_complete());
        assert!(msg.into_events().is_empty());
    }

    #[test]
    fn test_server_content_events_in_order() {
        let raw = json!({
            "serverContent": {
                "modelTurn": { "parts": [
                    { "inlineData": { "mimeType": "audio/pcm;rate=24000", "data": "AQA=" } },
                    { "text": "ignoré" },
                    { "inlineData": { "mimeType": "audio/pcm;rate=24000", "data": "AgA=" } },
                    { "inlineData": { "mimeType": "image/png", "data": "xx" } }
                ]},
                "turnComplete": true
            }
        })
        .to_string();

        let events = ServerMessage::parse(raw.as_bytes()).unwrap().into_events();
        assert_eq!(
            events,
            vec![
                SessionEvent::Audio(TransportEnvelope::new("audio/pcm;rate=24000", "AQA=")),
                SessionEvent::Audio(TransportEnvelope::new("audio/pcm;rate=24000", "AgA=")),
                SessionEvent::TurnComplete,
            ]
        );
    }

    #[test]
    fn test_interrupted_and_unknown_messages() {
        let events = ServerMessage::parse(br#"{"serverContent": {"interrupted": true}}"#)
            .unwrap()
            .into_events();
        assert_eq!(events, vec![SessionEvent::Interrupted]);

        let unknown = ServerMessage::parse(br#"{"toolCall": {"x": 1}}"#).unwrap();
        assert_eq!(unknown, ServerMessage::default());

        let go_away = ServerMessage::parse(br#"{"goAway": {"timeLeft": "5s"}}"#).unwrap();
        assert!(go_away.is_go_away());

        assert!(ServerMessage::parse(b"pas du json").is_err());
    }
}
