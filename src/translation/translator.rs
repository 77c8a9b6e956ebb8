//! The boundary to the speech translation backend.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Synthesized speech returned alongside a translation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslatedAudio {
    /// Raw 16-bit little-endian PCM
    pub pcm: Vec<u8>,
    pub sample_rate: u32,
}

/// What the backend made of one buffered utterance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TranslationResult {
    pub original_text: String,
    pub detected_language: String,
    pub translated_text: String,
    #[serde(default)]
    pub translated_audio: Option<TranslatedAudio>,
    /// Set by backends that report soft failures ("No speech detected") in-band
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TranslationError {
    /// Backend could not be reached or timed out
    Unavailable(String),
    /// Backend answered with a non-success status
    Backend { status: u16, body: String },
    /// Backend answered with something we cannot read
    InvalidResponse(String),
}

impl fmt::Display for TranslationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TranslationError::Unavailable(msg) => write!(f, "Translator unavailable: {}", msg),
            TranslationError::Backend { status, body } => {
                write!(f, "Translator returned {}: {}", status, body)
            }
            TranslationError::InvalidResponse(msg) => write!(f, "Invalid translator response: {}", msg),
        }
    }
}

impl std::error::Error for TranslationError {}

/// Converts buffered speech into translated text and, optionally, audio.
///
/// Calls are blocking and may take seconds; run them on the blocking pool.
pub trait Translator: Send + Sync {
    fn translate(
        &self,
        audio: &[u8],
        target_lang: &str,
        source_lang: Option<&str>,
    ) -> Result<TranslationResult, TranslationError>;
}

/// What a finished translate call turns into for delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum TranslationOutcome {
    /// Synthesized speech for the listeners, at the backend's sample rate
    Audio { pcm: Vec<u8>, sample_rate: u32 },
    TextResult {
        original: String,
        translated: String,
        language: String,
        user_id: String,
    },
    /// Nothing to deliver this cycle
    Error(String),
}

impl TranslationOutcome {
    /// Classify a translate call.
    ///
    /// An error, an in-band failure or an empty transcript all yield
    /// `Error`; otherwise the text result comes first, followed by the
    /// synthesized audio when the backend produced any.
    pub fn from_call(
        call: Result<TranslationResult, TranslationError>,
        target_lang: &str,
        speaker_id: &str,
    ) -> Vec<TranslationOutcome> {
        let result = match call {
            Ok(result) => result,
            Err(err) => return vec![TranslationOutcome::Error(err.to_string())],
        };

        if let Some(reason) = result.error.filter(|e| !e.is_empty()) {
            return vec![TranslationOutcome::Error(reason)];
        }
        if result.original_text.trim().is_empty() {
            return vec![TranslationOutcome::Error("No speech detected".to_string())];
        }

        let mut outcomes = vec![TranslationOutcome::TextResult {
            original: result.original_text,
            translated: result.translated_text,
            language: target_lang.to_string(),
            user_id: speaker_id.to_string(),
        }];
        if let Some(audio) = result.translated_audio.filter(|a| !a.pcm.is_empty()) {
            outcomes.push(TranslationOutcome::Audio {
                pcm: audio.pcm,
                sample_rate: audio.sample_rate,
            });
        }
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(original: &str) -> TranslationResult {
        TranslationResult {
            original_text: original.to_string(),
            detected_language: "es".to_string(),
            translated_text: "hello".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_text_result() {
        let outcomes = TranslationOutcome::from_call(Ok(ok("hola")), "en", "p1");
        assert_eq!(
            outcomes,
            vec![TranslationOutcome::TextResult {
                original: "hola".into(),
                translated: "hello".into(),
                language: "en".into(),
                user_id: "p1".into(),
            }]
        );
    }

    #[test]
    fn test_audio_follows_text() {
        let mut result = ok("hola");
        result.translated_audio = Some(TranslatedAudio {
            pcm: vec![0, 1, 2, 3],
            sample_rate: 16000,
        });
        let outcomes = TranslationOutcome::from_call(Ok(result), "en", "p1");
        assert_eq!(outcomes.len(), 2);
        assert_eq!(
            outcomes[1],
            TranslationOutcome::Audio {
                pcm: vec![0, 1, 2, 3],
                sample_rate: 16000,
            }
        );
    }

    #[test]
    fn test_failures_produce_nothing_to_deliver() {
        let empty = TranslationOutcome::from_call(Ok(ok("   ")), "en", "p1");
        assert!(matches!(empty.as_slice(), [TranslationOutcome::Error(_)]));

        let mut soft = ok("hola");
        soft.error = Some("model overloaded".into());
        let soft = TranslationOutcome::from_call(Ok(soft), "en", "p1");
        assert_eq!(soft, vec![TranslationOutcome::Error("model overloaded".into())]);

        let hard = TranslationOutcome::from_call(
            Err(TranslationError::Unavailable("connection refused".into())),
            "en",
            "p1",
        );
        assert!(matches!(hard.as_slice(), [TranslationOutcome::Error(msg)] if msg.contains("refused")));
    }
}
