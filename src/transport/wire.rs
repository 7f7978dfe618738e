//! JSON wire format of the live speech API.
//!
//! Outbound:
//!
//! ```text
//! {"setup":{"model":..,"generationConfig":{..},"systemInstruction":{..}}}
//! {"realtimeInput":{"mediaChunks":[{"mimeType":"audio/pcm;rate=16000","data":"<base64>"}]}}
//! ```
//!
//! Inbound:
//!
//! ```text
//! {"setupComplete":{}}
//! {"serverContent":{"modelTurn":{"parts":[{"inlineData":{"mimeType":..,"data":"<base64>"}}]}}}
//! {"serverContent":{"interrupted":true}}
//! {"serverContent":{"turnComplete":true}}
//! ```
//!
//! Base64 only exists at this boundary; everything inside the crate moves
//! raw sample buffers.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};

use crate::audio::EncodedFrame;
use crate::config::SessionConfig;

// ---------------------------------------------------------------------------
// Shared pieces
// ---------------------------------------------------------------------------

/// A base64 payload tagged with its mime type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    #[serde(default)]
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<Blob>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Content {
    #[serde(default)]
    pub parts: Vec<Part>,
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    pub speech_config: SpeechConfig,
}

/// First message on every channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<Blob>,
}

/// Messages sent to the speech service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(Setup),
    RealtimeInput(RealtimeInput),
}

impl ClientMessage {
    /// Build the setup envelope from the session settings.
    pub fn setup(config: &SessionConfig) -> Self {
        let system_instruction = config.system_instruction.as_ref().map(|text| Content {
            parts: vec![Part {
                text: Some(text.clone()),
                inline_data: None,
            }],
        });

        ClientMessage::Setup(Setup {
            model: config.model.clone(),
            generation_config: GenerationConfig {
                response_modalities: vec![config.response_modality.clone()],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: config.voice_name.clone(),
                        },
                    },
                },
            },
            system_instruction,
        })
    }

    /// Wrap one encoded frame as a realtime audio chunk.
    pub fn audio(frame: &EncodedFrame) -> Self {
        ClientMessage::RealtimeInput(RealtimeInput {
            media_chunks: vec![Blob {
                mime_type: frame.mime_type.to_string(),
                data: BASE64.encode(frame.to_le_bytes()),
            }],
        })
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_turn: Option<Content>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub interrupted: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub turn_complete: bool,
}

/// Messages received from the speech service.  Unknown fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup_complete: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_content: Option<ServerContent>,
}

impl ServerMessage {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// A server turn carrying a single inline audio payload.
    pub fn audio(mime_type: &str, pcm: &[u8]) -> Self {
        ServerMessage {
            setup_complete: None,
            server_content: Some(ServerContent {
                model_turn: Some(Content {
                    parts: vec![Part {
                        text: None,
                        inline_data: Some(Blob {
                            mime_type: mime_type.to_string(),
                            data: BASE64.encode(pcm),
                        }),
                    }],
                }),
                ..ServerContent::default()
            }),
        }
    }

    /// Base64 audio payloads in part order.
    pub fn audio_payloads(&self) -> impl Iterator<Item = &str> {
        self.server_content
            .iter()
            .filter_map(|content| content.model_turn.as_ref())
            .flat_map(|turn| turn.parts.iter())
            .filter_map(|part| part.inline_data.as_ref())
            .map(|blob| blob.data.as_str())
    }

    pub fn is_interrupted(&self) -> bool {
        self.server_content.as_ref().is_some_and(|c| c.interrupted)
    }

    pub fn is_turn_complete(&self) -> bool {
        self.server_content.as_ref().is_some_and(|c| c.turn_complete)
    }

    pub fn is_setup_complete(&self) -> bool {
        self.setup_complete.is_some()
    }
}

/// Decode a base64 payload into raw bytes.
pub fn decode_payload(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    BASE64.decode(data)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn audio_envelope_matches_wire_shape() {
        let frame = EncodedFrame::new(vec![1, -1]);
        let json: serde_json::Value =
            serde_json::from_str(&ClientMessage::audio(&frame).to_json().unwrap()).unwrap();

        assert_eq!(
            json,
            json!({
                "realtimeInput": {
                    "mediaChunks": [{
                        "mimeType": "audio/pcm;rate=16000",
                        "data": "AQD//w=="
                    }]
                }
            })
        );
    }

    #[test]
    fn setup_carries_model_voice_and_modality() {
        let config = SessionConfig::default();
        let json: serde_json::Value =
            serde_json::from_str(&ClientMessage::setup(&config).to_json().unwrap()).unwrap();

        assert_eq!(json["setup"]["model"], config.model.as_str());
        assert_eq!(json["setup"]["generationConfig"]["responseModalities"], json!(["AUDIO"]));
        assert_eq!(
            json["setup"]["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]
                ["voiceName"],
            "Zephyr"
        );
        assert!(json["setup"].get("systemInstruction").is_none());
    }

    #[test]
    fn setup_includes_system_instruction_when_set() {
        let config = SessionConfig {
            system_instruction: Some("Be brief.".into()),
            ..SessionConfig::default()
        };
        let json: serde_json::Value =
            serde_json::from_str(&ClientMessage::setup(&config).to_json().unwrap()).unwrap();
        assert_eq!(json["setup"]["systemInstruction"]["parts"][0]["text"], "Be brief.");
    }

    #[test]
    fn parses_audio_parts_in_order() {
        let text = r#"{"serverContent":{"modelTurn":{"parts":[
            {"text":"hi"},
            {"inlineData":{"mimeType":"audio/pcm;rate=24000","data":"AAA="}},
            {"inlineData":{"data":"AQE="}}
        ]}}}"#;
        let msg = ServerMessage::parse(text).unwrap();
        assert_eq!(msg.audio_payloads().collect::<Vec<_>>(), vec!["AAA=", "AQE="]);
        assert!(!msg.is_interrupted());
    }

    #[test]
    fn parses_control_flags_and_ignores_unknown_fields() {
        let msg = ServerMessage::parse(r#"{"serverContent":{"interrupted":true},"usageMetadata":{}}"#)
            .unwrap();
        assert!(msg.is_interrupted());
        assert_eq!(msg.audio_payloads().count(), 0);

        assert!(ServerMessage::parse(r#"{"setupComplete":{}}"#)
            .unwrap()
            .is_setup_complete());
        assert!(ServerMessage::parse(r#"{"serverContent":{"turnComplete":true}}"#)
            .unwrap()
            .is_turn_complete());
    }

    #[test]
    fn server_audio_message_parses_back() {
        let msg = ServerMessage::audio("audio/pcm;rate=24000", &[0, 64]);
        let parsed = ServerMessage::parse(&serde_json::to_string(&msg).unwrap()).unwrap();
        let payload = parsed.audio_payloads().next().unwrap();
        assert_eq!(decode_payload(payload).unwrap(), vec![0, 64]);
    }

    #[test]
    fn non_json_is_an_error() {
        assert!(ServerMessage::parse("not json").is_err());
    }
}
