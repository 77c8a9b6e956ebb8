//! HTTP client for an external speech translation service.
//!
//! ## Wire Contract:
//! - `GET {endpoint}/health` must answer 2xx at startup
//! - `POST {endpoint}/transcribe-translate?target_lang=xx[&source_lang=yy]`
//!   with an `audio/wav` body answers
//!   `{"original_text","detected_language","translated_text","error"?,
//!     "translated_audio"?: base64 PCM, "audio_sample_rate"?}`

use crate::audio::{encode_wav, PcmFormat};
use crate::config::TranslatorConfig;
use crate::translation::translator::{
    TranslatedAudio, TranslationError, TranslationResult, Translator,
};
use anyhow::{anyhow, Context, Result};
use base64::Engine;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, error, info};

#[derive(serde::Deserialize)]
struct WireResponse {
    #[serde(default)]
    original_text: String,
    #[serde(default)]
    detected_language: String,
    #[serde(default)]
    translated_text: String,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    translated_audio: Option<String>,
    #[serde(default)]
    audio_sample_rate: Option<u32>,
}

pub struct HttpTranslator {
    client: reqwest::Client,
    endpoint: String,
    format: PcmFormat,
    runtime: Handle,
}

impl HttpTranslator {
    /// Build the client and check that the service is up.
    ///
    /// # Errors
    ///
    /// Returns error if the service does not answer its health check
    pub async fn connect(config: &TranslatorConfig, format: PcmFormat) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .context("Failed to build translator HTTP client")?;
        let endpoint = config.endpoint.trim_end_matches('/').to_string();

        let health_url = format!("{}/health", endpoint);
        let response = client
            .get(&health_url)
            .send()
            .await
            .with_context(|| format!("Translator at {} is unreachable", endpoint))?;
        if !response.status().is_success() {
            return Err(anyhow!(
                "Translator health check at {} returned {}",
                health_url,
                response.status()
            ));
        }

        info!(endpoint = %endpoint, "Translator service is reachable");
        Ok(Self {
            client,
            endpoint,
            format,
            runtime: Handle::current(),
        })
    }

    async fn request(
        &self,
        audio: &[u8],
        target_lang: &str,
        source_lang: Option<&str>,
    ) -> Result<TranslationResult, TranslationError> {
        let mut query = vec![("target_lang", target_lang)];
        if let Some(source) = source_lang {
            query.push(("source_lang", source));
        }

        debug!(audio_bytes = audio.len(), target_lang, "Sending audio to translator");

        let response = self
            .client
            .post(format!("{}/transcribe-translate", self.endpoint))
            .query(&query)
            .header("Content-Type", "audio/wav")
            .body(encode_wav(audio, self.format))
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, "Translator request failed");
                TranslationError::Unavailable(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TranslationError::Backend {
                status: status.as_u16(),
                body,
            });
        }

        let wire: WireResponse = response
            .json()
            .await
            .map_err(|e| TranslationError::InvalidResponse(e.to_string()))?;

        let translated_audio = match wire.translated_audio {
            Some(encoded) if !encoded.is_empty() => {
                let pcm = base64::engine::general_purpose::STANDARD
                    .decode(encoded)
                    .map_err(|e| TranslationError::InvalidResponse(format!("audio: {}", e)))?;
                Some(TranslatedAudio {
                    pcm,
                    sample_rate: wire.audio_sample_rate.unwrap_or(self.format.sample_rate),
                })
            }
            _ => None,
        };

        Ok(TranslationResult {
            original_text: wire.original_text,
            detected_language: wire.detected_language,
            translated_text: wire.translated_text,
            translated_audio,
            error: wire.error,
        })
    }
}

impl Translator for HttpTranslator {
    /// Must be called from a blocking thread, never from an async task.
    fn translate(
        &self,
        audio: &[u8],
        target_lang: &str,
        source_lang: Option<&str>,
    ) -> Result<TranslationResult, TranslationError> {
        self.runtime.block_on(self.request(audio, target_lang, source_lang))
    }
}
