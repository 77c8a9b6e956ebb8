//! # Flush Dispatcher
//!
//! Runs translate calls off the WebSocket receive path and delivers the
//! results to the room.
//!
//! ## Job Flow:
//! 1. Wait for a worker permit (`translation_workers` bounds concurrency)
//! 2. Skip the job if the speaker's session closed while it was queued
//! 3. Group the other room members by language; nobody listening means no call
//! 4. One blocking translate per language, speaker's language as source hint
//! 5. Drop results that arrive after the speaker closed; otherwise deliver
//!    text and audio only to listeners of that language
//!
//! The speaker's in-flight slot is released when the job ends, whatever
//! path it took.

use crate::audio::{encode_wav, PcmFormat};
use crate::error::RelayError;
use crate::protocol::{Outbound, ServerMessage};
use crate::room::{ParticipantId, RoomId, RoomRegistry, SessionFlags};
use crate::translation::translator::{
    TranslationError, TranslationOutcome, TranslationResult, Translator,
};
use actix_web::web::Bytes;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Buffered speech from one participant, ready for translation.
#[derive(Debug)]
pub struct FlushJob {
    pub room_id: RoomId,
    pub speaker_id: ParticipantId,
    pub speaker_lang: String,
    pub audio: Vec<u8>,
    pub flags: Arc<SessionFlags>,
}

/// Translation counters reported by the health endpoints.
#[derive(Debug, Default)]
pub struct TranslationStats {
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    pub discarded: AtomicU64,
    pub skipped: AtomicU64,
}

#[derive(Debug, Default, Clone, Copy, serde::Serialize)]
pub struct TranslationStatsSnapshot {
    pub completed: u64,
    pub failed: u64,
    pub discarded: u64,
    pub skipped: u64,
}

impl TranslationStats {
    pub fn snapshot(&self) -> TranslationStatsSnapshot {
        TranslationStatsSnapshot {
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }
}

struct InFlightGuard(Arc<SessionFlags>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.finish_translation();
    }
}

pub struct FlushDispatcher {
    translator: Arc<dyn Translator>,
    workers: Arc<Semaphore>,
    registry: Arc<RoomRegistry>,
    format: PcmFormat,
    wrap_wav: bool,
    stats: TranslationStats,
}

impl FlushDispatcher {
    pub fn new(
        translator: Arc<dyn Translator>,
        registry: Arc<RoomRegistry>,
        workers: usize,
        format: PcmFormat,
        wrap_wav: bool,
    ) -> Self {
        Self {
            translator,
            workers: Arc::new(Semaphore::new(workers)),
            registry,
            format,
            wrap_wav,
            stats: TranslationStats::default(),
        }
    }

    pub fn stats(&self) -> TranslationStatsSnapshot {
        self.stats.snapshot()
    }

    /// Queue a flush job. The caller must already hold the speaker's
    /// in-flight slot; it is released when the job finishes.
    pub fn dispatch(self: &Arc<Self>, job: FlushJob) -> JoinHandle<()> {
        let dispatcher = self.clone();
        tokio::spawn(async move { dispatcher.run(job).await })
    }

    async fn run(&self, job: FlushJob) {
        let _in_flight = InFlightGuard(job.flags.clone());

        let Ok(_permit) = self.workers.clone().acquire_owned().await else {
            // Semaphore closed: the process is shutting down
            return;
        };

        if job.flags.is_closed() {
            self.stats.skipped.fetch_add(1, Ordering::Relaxed);
            debug!(participant_id = %job.speaker_id, "Speaker left before translation started");
            return;
        }

        let languages = self.listener_languages(&job);
        if languages.is_empty() {
            self.stats.skipped.fetch_add(1, Ordering::Relaxed);
            debug!(room_id = %job.room_id, participant_id = %job.speaker_id, "No listeners, dropping flush");
            return;
        }

        let audio = Arc::new(job.audio);
        for language in languages {
            let call = self.translate(audio.clone(), &language, &job.speaker_lang).await;

            if job.flags.is_closed() {
                self.stats.discarded.fetch_add(1, Ordering::Relaxed);
                debug!(
                    participant_id = %job.speaker_id,
                    target_lang = %language,
                    "Discarding translation for closed session"
                );
                return;
            }

            for outcome in TranslationOutcome::from_call(call, &language, job.speaker_id.as_str()) {
                self.deliver(&job.room_id, &job.speaker_id, &language, audio.len(), outcome);
            }
        }
    }

    /// Header format for synthesized audio: the backend's rate with the
    /// relay's channel layout and sample width.
    fn output_format(&self, sample_rate: u32) -> PcmFormat {
        if sample_rate == 0 {
            return self.format;
        }
        PcmFormat::new(sample_rate, self.format.channels, self.format.bit_depth)
    }

    fn listener_languages(&self, job: &FlushJob) -> BTreeSet<String> {
        self.registry
            .get(&job.room_id)
            .map(|room| {
                room.snapshot()
                    .into_iter()
                    .filter(|p| p.id != job.speaker_id)
                    .map(|p| p.language.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn translate(
        &self,
        audio: Arc<Vec<u8>>,
        target_lang: &str,
        source_lang: &str,
    ) -> Result<TranslationResult, TranslationError> {
        let translator = self.translator.clone();
        let target = target_lang.to_string();
        let source = source_lang.to_string();

        tokio::task::spawn_blocking(move || translator.translate(&audio, &target, Some(&source)))
            .await
            .unwrap_or_else(|e| Err(TranslationError::Unavailable(format!("translate worker failed: {}", e))))
    }

    fn deliver(
        &self,
        room_id: &str,
        speaker_id: &ParticipantId,
        language: &str,
        audio_bytes: usize,
        outcome: TranslationOutcome,
    ) {
        match outcome {
            TranslationOutcome::TextResult {
                original,
                translated,
                language,
                user_id,
            } => {
                self.stats.completed.fetch_add(1, Ordering::Relaxed);
                let frame = Outbound::Event(ServerMessage::TranslationResult {
                    original_text: original,
                    translated_text: translated,
                    language: language.clone(),
                    user_id,
                });
                let report = self
                    .registry
                    .broadcast_to_language(room_id, Some(speaker_id), &language, frame);
                info!(
                    room_id = %room_id,
                    participant_id = %speaker_id,
                    target_lang = %language,
                    audio_bytes,
                    delivered = report.delivered,
                    "Translation delivered"
                );
            }
            TranslationOutcome::Audio { pcm, sample_rate } => {
                let payload = if self.wrap_wav {
                    encode_wav(&pcm, self.output_format(sample_rate))
                } else {
                    pcm
                };
                self.registry.broadcast_to_language(
                    room_id,
                    Some(speaker_id),
                    language,
                    Outbound::Audio(Bytes::from(payload)),
                );
            }
            TranslationOutcome::Error(reason) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                let err = RelayError::Translation(reason);
                warn!(
                    room_id = %room_id,
                    participant_id = %speaker_id,
                    target_lang = %language,
                    audio_bytes,
                    code = err.code(),
                    error = %err,
                    "No translation this cycle"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::session::tests::active_session;
    use crate::audio::session::CloseReason;
    use crate::room::participant::testing::ChannelSink;
    use crate::room::Participant;
    use crate::translation::translator::TranslatedAudio;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    /// Counts calls and records (target, source) pairs.
    #[derive(Default)]
    struct CountingTranslator {
        calls: AtomicUsize,
        requests: Mutex<Vec<(String, Option<String>)>>,
        /// Synthesize audio at this rate when set
        audio_rate: Option<u32>,
    }

    impl Translator for CountingTranslator {
        fn translate(
            &self,
            _audio: &[u8],
            target_lang: &str,
            source_lang: Option<&str>,
        ) -> Result<TranslationResult, TranslationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests
                .lock()
                .unwrap()
                .push((target_lang.to_string(), source_lang.map(str::to_string)));
            Ok(TranslationResult {
                original_text: "hola a todos".into(),
                detected_language: "es".into(),
                translated_text: format!("hello everyone [{}]", target_lang),
                translated_audio: self.audio_rate.map(|sample_rate| TranslatedAudio {
                    pcm: vec![1, 0, 2, 0],
                    sample_rate,
                }),
                error: None,
            })
        }
    }

    /// Blocks each call until the test releases it.
    struct GatedTranslator {
        calls: AtomicUsize,
        release: Mutex<std::sync::mpsc::Receiver<()>>,
    }

    impl Translator for GatedTranslator {
        fn translate(
            &self,
            _audio: &[u8],
            _target_lang: &str,
            _source_lang: Option<&str>,
        ) -> Result<TranslationResult, TranslationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let _ = self.release.lock().unwrap().recv();
            Err(TranslationError::Unavailable("released".into()))
        }
    }

    fn join(registry: &RoomRegistry, session: &crate::audio::ParticipantSession, sink: Arc<ChannelSink>) {
        registry
            .add_participant(Participant::new(
                session.id.clone(),
                session.room_id.clone(),
                session.language.clone(),
                session.flags(),
                sink,
            ))
            .unwrap();
    }

    fn job_for(session: &crate::audio::ParticipantSession, audio: Vec<u8>) -> FlushJob {
        FlushJob {
            room_id: session.room_id.clone(),
            speaker_id: session.id.clone(),
            speaker_lang: session.language.clone(),
            audio,
            flags: session.flags(),
        }
    }

    #[tokio::test]
    async fn test_end_to_end_flush_reaches_other_language_only() {
        let registry = Arc::new(RoomRegistry::new());
        let translator = Arc::new(CountingTranslator::default());
        let dispatcher = Arc::new(FlushDispatcher::new(
            translator.clone(),
            registry.clone(),
            4,
            PcmFormat::default(),
            false,
        ));

        let start = Instant::now();
        let mut speaker = active_session("r1", "es", start);
        let listener = active_session("r1", "en", start);
        let (speaker_sink, mut speaker_rx) = ChannelSink::new();
        let (listener_sink, mut listener_rx) = ChannelSink::new();
        join(&registry, &speaker, speaker_sink);
        join(&registry, &listener, listener_sink);

        let chunk = vec![0u8; 4096];
        for ms in [0u64, 100, 200] {
            assert!(speaker
                .on_audio_at(&chunk, start + Duration::from_millis(ms))
                .unwrap()
                .is_none());
        }
        assert_eq!(translator.calls.load(Ordering::SeqCst), 0);

        let audio = speaker
            .on_audio_at(&chunk, start + Duration::from_millis(700))
            .unwrap()
            .expect("flush should fire");
        dispatcher.dispatch(job_for(&speaker, audio)).await.unwrap();

        assert_eq!(translator.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            translator.requests.lock().unwrap()[0],
            ("en".to_string(), Some("es".to_string()))
        );
        assert!(!speaker.flags().is_translating());

        match listener_rx.try_recv().unwrap() {
            Outbound::Event(ServerMessage::TranslationResult {
                original_text,
                language,
                user_id,
                ..
            }) => {
                assert_eq!(original_text, "hola a todos");
                assert_eq!(language, "en");
                assert_eq!(user_id, speaker.id.to_string());
            }
            other => panic!("unexpected frame: {:?}", other),
        }
        assert!(speaker_rx.try_recv().is_err());
        assert_eq!(dispatcher.stats().completed, 1);
    }

    #[tokio::test]
    async fn test_one_call_per_listener_language() {
        let registry = Arc::new(RoomRegistry::new());
        let translator = Arc::new(CountingTranslator {
            audio_rate: Some(16000),
            ..Default::default()
        });
        let dispatcher = Arc::new(FlushDispatcher::new(
            translator.clone(),
            registry.clone(),
            2,
            PcmFormat::default(),
            true,
        ));

        let now = Instant::now();
        let speaker = active_session("r1", "es", now);
        let en_a = active_session("r1", "en", now);
        let en_b = active_session("r1", "en", now);
        let fr = active_session("r1", "fr", now);
        let (s_sink, _s_rx) = ChannelSink::new();
        let (a_sink, mut a_rx) = ChannelSink::new();
        let (b_sink, mut b_rx) = ChannelSink::new();
        let (f_sink, mut f_rx) = ChannelSink::new();
        join(&registry, &speaker, s_sink);
        join(&registry, &en_a, a_sink);
        join(&registry, &en_b, b_sink);
        join(&registry, &fr, f_sink);

        assert!(speaker.flags().try_begin_translation());
        dispatcher.dispatch(job_for(&speaker, vec![0u8; 8000])).await.unwrap();

        assert_eq!(translator.calls.load(Ordering::SeqCst), 2);

        for rx in [&mut a_rx, &mut b_rx] {
            assert!(matches!(
                rx.try_recv().unwrap(),
                Outbound::Event(ServerMessage::TranslationResult { ref language, .. }) if language == "en"
            ));
            match rx.try_recv().unwrap() {
                Outbound::Audio(bytes) => assert_eq!(&bytes[..4], b"RIFF"),
                other => panic!("expected audio, got {:?}", other),
            }
        }
        assert!(matches!(
            f_rx.try_recv().unwrap(),
            Outbound::Event(ServerMessage::TranslationResult { ref language, .. }) if language == "fr"
        ));
    }

    #[tokio::test]
    async fn test_synthesized_audio_keeps_backend_sample_rate() {
        let registry = Arc::new(RoomRegistry::new());
        let translator = Arc::new(CountingTranslator {
            audio_rate: Some(22050),
            ..Default::default()
        });
        let dispatcher = Arc::new(FlushDispatcher::new(
            translator.clone(),
            registry.clone(),
            1,
            PcmFormat::default(),
            true,
        ));

        let now = Instant::now();
        let speaker = active_session("r1", "es", now);
        let listener = active_session("r1", "en", now);
        let (s_sink, _s_rx) = ChannelSink::new();
        let (l_sink, mut l_rx) = ChannelSink::new();
        join(&registry, &speaker, s_sink);
        join(&registry, &listener, l_sink);

        assert!(speaker.flags().try_begin_translation());
        dispatcher.dispatch(job_for(&speaker, vec![0u8; 8000])).await.unwrap();

        assert!(matches!(
            l_rx.try_recv().unwrap(),
            Outbound::Event(ServerMessage::TranslationResult { .. })
        ));
        match l_rx.try_recv().unwrap() {
            Outbound::Audio(bytes) => {
                let rate = u32::from_le_bytes([bytes[24], bytes[25], bytes[26], bytes[27]]);
                let byte_rate = u32::from_le_bytes([bytes[28], bytes[29], bytes[30], bytes[31]]);
                assert_eq!(rate, 22050);
                assert_eq!(byte_rate, 22050 * 2);
            }
            other => panic!("expected audio, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_no_listeners_skips_translator() {
        let registry = Arc::new(RoomRegistry::new());
        let translator = Arc::new(CountingTranslator::default());
        let dispatcher = Arc::new(FlushDispatcher::new(
            translator.clone(),
            registry.clone(),
            1,
            PcmFormat::default(),
            false,
        ));

        let speaker = active_session("r1", "es", Instant::now());
        let (sink, _rx) = ChannelSink::new();
        join(&registry, &speaker, sink);

        assert!(speaker.flags().try_begin_translation());
        dispatcher.dispatch(job_for(&speaker, vec![0u8; 8000])).await.unwrap();

        assert_eq!(translator.calls.load(Ordering::SeqCst), 0);
        assert!(!speaker.flags().is_translating());
        assert_eq!(dispatcher.stats().skipped, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_at_most_one_translate_in_flight() {
        let (release_tx, release_rx) = std::sync::mpsc::channel();
        let registry = Arc::new(RoomRegistry::new());
        let translator = Arc::new(GatedTranslator {
            calls: AtomicUsize::new(0),
            release: Mutex::new(release_rx),
        });
        let dispatcher = Arc::new(FlushDispatcher::new(
            translator.clone(),
            registry.clone(),
            4,
            PcmFormat::default(),
            false,
        ));

        let start = Instant::now();
        let mut speaker = active_session("r1", "es", start);
        let listener = active_session("r1", "en", start);
        let (s_sink, _s_rx) = ChannelSink::new();
        let (l_sink, mut l_rx) = ChannelSink::new();
        join(&registry, &speaker, s_sink);
        join(&registry, &listener, l_sink);

        let chunk = vec![0u8; 8192];
        assert!(speaker.on_audio_at(&chunk, start).unwrap().is_none());
        let first = speaker
            .on_audio_at(&chunk, start + Duration::from_millis(600))
            .unwrap()
            .expect("first trigger flushes");
        let handle = dispatcher.dispatch(job_for(&speaker, first));

        while translator.calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // Second trigger while the first translate is pending
        let second = speaker
            .on_audio_at(&chunk, start + Duration::from_millis(1200))
            .unwrap();
        assert!(second.is_none());

        release_tx.send(()).unwrap();
        handle.await.unwrap();

        assert_eq!(translator.calls.load(Ordering::SeqCst), 1);
        assert!(!speaker.flags().is_translating());
        assert_eq!(dispatcher.stats().failed, 1);
        assert!(l_rx.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_result_after_close_is_discarded() {
        let (release_tx, release_rx) = std::sync::mpsc::channel();
        let registry = Arc::new(RoomRegistry::new());
        let translator = Arc::new(GatedTranslator {
            calls: AtomicUsize::new(0),
            release: Mutex::new(release_rx),
        });
        let dispatcher = Arc::new(FlushDispatcher::new(
            translator.clone(),
            registry.clone(),
            1,
            PcmFormat::default(),
            false,
        ));

        let now = Instant::now();
        let mut speaker = active_session("r1", "es", now);
        let listener = active_session("r1", "en", now);
        let (s_sink, _s_rx) = ChannelSink::new();
        let (l_sink, mut l_rx) = ChannelSink::new();
        join(&registry, &speaker, s_sink);
        join(&registry, &listener, l_sink);

        assert!(speaker.flags().try_begin_translation());
        let handle = dispatcher.dispatch(job_for(&speaker, vec![0u8; 8000]));
        while translator.calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        speaker.begin_close(&CloseReason::ClientRequested).unwrap();
        release_tx.send(()).unwrap();
        handle.await.unwrap();

        assert_eq!(dispatcher.stats().discarded, 1);
        assert_eq!(dispatcher.stats().failed, 0);
        assert!(l_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_job_for_closed_session_is_skipped() {
        let registry = Arc::new(RoomRegistry::new());
        let translator = Arc::new(CountingTranslator::default());
        let dispatcher = Arc::new(FlushDispatcher::new(
            translator.clone(),
            registry.clone(),
            1,
            PcmFormat::default(),
            false,
        ));

        let mut speaker = active_session("r1", "es", Instant::now());
        assert!(speaker.flags().try_begin_translation());
        speaker.begin_close(&CloseReason::IdleTimeout).unwrap();

        dispatcher.dispatch(job_for(&speaker, vec![0u8; 8000])).await.unwrap();
        assert_eq!(translator.calls.load(Ordering::SeqCst), 0);
        assert!(!speaker.flags().is_translating());
    }
}
