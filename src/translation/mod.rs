//! # Translation
//!
//! The blocking translator boundary, its HTTP implementation, and the
//! worker pool that runs translate calls for flushed audio.

pub mod dispatcher;
pub mod http;
pub mod translator;

pub use dispatcher::{FlushDispatcher, FlushJob, TranslationStatsSnapshot};
pub use http::HttpTranslator;
pub use translator::{
    TranslatedAudio, TranslationError, TranslationOutcome, TranslationResult, Translator,
};
