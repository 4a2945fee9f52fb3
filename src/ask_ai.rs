//! Ask AI
//!
//! Spoken or typed questions to the course AI while in a voice channel. The
//! answer is played on this machine only and never enters the mesh.

use async_trait::async_trait;
use log::{info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

use crate::api::{AiAnswer, ApiClient, ApiError};
use crate::voice::{VoiceSession, VoiceState};

/// Local audio playback errors
#[derive(Error, Debug)]
pub enum PlaybackError {
    #[error("No audio output device")]
    NoDevice,
    #[error("Unsupported audio: {0}")]
    Decode(String),
    #[error("Playback failed: {0}")]
    Failed(String),
}

/// Speech capture errors
#[derive(Error, Debug)]
pub enum SpeechError {
    #[error("No speech detected")]
    NoSpeech,
    #[error("Microphone access denied")]
    PermissionDenied,
    #[error("Speech recognition failed: {0}")]
    Failed(String),
}

#[derive(Error, Debug)]
pub enum AskAiError {
    #[error("A question is already being answered")]
    Busy,
    #[error("Join a voice channel to ask the AI")]
    NotJoined,
    #[error("Voice session ended before the answer arrived")]
    SessionEnded,
    #[error("Question is empty")]
    EmptyQuestion,
    #[error("Speech input is not available")]
    SpeechUnavailable,
    #[error(transparent)]
    Speech(#[from] SpeechError),
    #[error(transparent)]
    Request(#[from] ApiError),
}

/// The course AI endpoint
#[async_trait]
pub trait AiClient: Send + Sync {
    async fn voice_query(&self, course_id: &str, question: &str) -> Result<AiAnswer, ApiError>;
}

#[async_trait]
impl AiClient for ApiClient {
    async fn voice_query(&self, course_id: &str, question: &str) -> Result<AiAnswer, ApiError> {
        ApiClient::voice_query(self, course_id, question).await
    }
}

/// Plays an encoded clip on the local output device, returning when done
#[async_trait]
pub trait AudioSink: Send + Sync {
    async fn play(&self, encoded: Vec<u8>) -> Result<(), PlaybackError>;
}

/// Turns one spoken utterance into text
#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    async fn listen(&self) -> Result<String, SpeechError>;
}

/// How the answer reached the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Played,
    /// No audio came back; show the text
    Displayed,
    /// Audio came back but could not be played; show the text
    PlaybackFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AskOutcome {
    pub question: String,
    pub answer: String,
    pub delivery: Delivery,
}

struct LoadingGuard<'a>(&'a AtomicBool);

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Ask AI for one course, tied to the voice session it is offered in.
///
/// At most one question is outstanding per voice session, however many
/// helpers share it. An answer is only delivered to the membership it was
/// asked in.
pub struct AskAi {
    client: Arc<dyn AiClient>,
    sink: Arc<dyn AudioSink>,
    recognizer: Option<Arc<dyn SpeechRecognizer>>,
    voice: VoiceSession,
    course_id: String,
    loading: Arc<AtomicBool>,
}

impl AskAi {
    pub fn new(
        client: Arc<dyn AiClient>,
        sink: Arc<dyn AudioSink>,
        voice: VoiceSession,
        course_id: impl Into<String>,
    ) -> Self {
        Self {
            client,
            sink,
            recognizer: None,
            loading: voice.query_flag(),
            voice,
            course_id: course_id.into(),
        }
    }

    pub fn with_recognizer(mut self, recognizer: Arc<dyn SpeechRecognizer>) -> Self {
        self.recognizer = Some(recognizer);
        self
    }

    pub fn course_id(&self) -> &str {
        &self.course_id
    }

    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::Acquire)
    }

    pub fn is_available(&self) -> bool {
        self.voice.state() == VoiceState::Joined
    }

    fn begin(&self) -> Result<(LoadingGuard<'_>, u64), AskAiError> {
        let epoch = self.voice.joined_epoch().ok_or(AskAiError::NotJoined)?;
        self.loading
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| AskAiError::Busy)?;
        Ok((LoadingGuard(&self.loading), epoch))
    }

    fn still_joined(&self, epoch: u64) -> Result<(), AskAiError> {
        if self.voice.joined_epoch() == Some(epoch) {
            Ok(())
        } else {
            info!("Dropping AI answer for course {}: voice session ended", self.course_id);
            Err(AskAiError::SessionEnded)
        }
    }

    /// Ask a typed question
    pub async fn ask_text(&self, question: &str) -> Result<AskOutcome, AskAiError> {
        let question = question.trim();
        if question.is_empty() {
            return Err(AskAiError::EmptyQuestion);
        }
        let (_loading, epoch) = self.begin()?;
        self.query(question, epoch).await
    }

    /// Listen for a spoken question, then ask it
    pub async fn ask_spoken(&self) -> Result<AskOutcome, AskAiError> {
        let recognizer = self.recognizer.clone().ok_or(AskAiError::SpeechUnavailable)?;
        let (_loading, epoch) = self.begin()?;

        let transcript = recognizer.listen().await?;
        self.still_joined(epoch)?;
        let question = transcript.trim();
        if question.is_empty() {
            return Err(SpeechError::NoSpeech.into());
        }
        self.query(question, epoch).await
    }

    async fn query(&self, question: &str, epoch: u64) -> Result<AskOutcome, AskAiError> {
        info!("Asking AI for course {}", self.course_id);
        let reply = self.client.voice_query(&self.course_id, question).await?;
        self.still_joined(epoch)?;

        let delivery = match reply.audio() {
            Ok(Some(audio)) => match self.sink.play(audio).await {
                Ok(()) => Delivery::Played,
                Err(e) => {
                    warn!("AI answer playback failed: {}", e);
                    Delivery::PlaybackFailed(e.to_string())
                }
            },
            Ok(None) => Delivery::Displayed,
            Err(e) => {
                warn!("AI answer audio unusable: {}", e);
                Delivery::PlaybackFailed(e.to_string())
            }
        };

        Ok(AskOutcome {
            question: question.to_string(),
            answer: reply.answer,
            delivery,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelSettings;
    use crate::testing::{wait_until, FakeCapture, FakePeerConnector, MemoryConnector, ServerEnd};
    use crate::voice::VoiceDeps;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;
    use url::Url;

    #[derive(Default)]
    struct FakeAi {
        calls: AtomicUsize,
        questions: Mutex<Vec<String>>,
        gate: Option<Arc<Notify>>,
        audio_base64: Option<String>,
        fail: bool,
    }

    #[async_trait]
    impl AiClient for FakeAi {
        async fn voice_query(&self, course_id: &str, question: &str) -> Result<AiAnswer, ApiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.questions.lock().push(format!("{}:{}", course_id, question));
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.fail {
                return Err(ApiError::Status {
                    status: 403,
                    detail: "Not enrolled in this course".into(),
                });
            }
            Ok(AiAnswer {
                answer: format!("About {}", question),
                audio_base64: self.audio_base64.clone(),
            })
        }
    }

    #[derive(Default)]
    struct FakeSink {
        played: Mutex<Vec<Vec<u8>>>,
        broken: bool,
    }

    #[async_trait]
    impl AudioSink for FakeSink {
        async fn play(&self, encoded: Vec<u8>) -> Result<(), PlaybackError> {
            if self.broken {
                return Err(PlaybackError::NoDevice);
            }
            self.played.lock().push(encoded);
            Ok(())
        }
    }

    struct FakeRecognizer(Mutex<Option<Result<String, SpeechError>>>);

    #[async_trait]
    impl SpeechRecognizer for FakeRecognizer {
        async fn listen(&self) -> Result<String, SpeechError> {
            self.0.lock().take().unwrap_or(Err(SpeechError::NoSpeech))
        }
    }

    async fn joined_voice() -> (VoiceSession, ServerEnd) {
        let connector = Arc::new(MemoryConnector::new());
        let deps = VoiceDeps {
            connector: connector.clone(),
            capture: Arc::new(FakeCapture::new()),
            peers: Arc::new(FakePeerConnector::new()),
        };
        let settings = ChannelSettings::new(Url::parse("ws://localhost:8000").unwrap(), "t");
        let (voice, _events) = VoiceSession::new(deps, settings);
        voice.join("5").await.unwrap();
        let server = connector.accept().await;
        (voice, server)
    }

    fn ask(voice: VoiceSession, ai: Arc<FakeAi>, sink: Arc<FakeSink>) -> AskAi {
        AskAi::new(ai, sink, voice, "12")
    }

    #[tokio::test]
    async fn test_requires_joined_voice() {
        let (voice, _server) = joined_voice().await;
        let ai = Arc::new(FakeAi::default());
        let asker = ask(voice.clone(), ai.clone(), Arc::new(FakeSink::default()));

        voice.leave();
        assert!(matches!(
            asker.ask_text("what is a mutex?").await,
            Err(AskAiError::NotJoined)
        ));
        assert_eq!(ai.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_text_answer_without_audio_is_displayed() {
        let (voice, _server) = joined_voice().await;
        let ai = Arc::new(FakeAi::default());
        let sink = Arc::new(FakeSink::default());
        let asker = ask(voice, ai.clone(), sink.clone());

        let outcome = asker.ask_text("  what is a mutex?  ").await.unwrap();
        assert_eq!(outcome.delivery, Delivery::Displayed);
        assert_eq!(outcome.answer, "About what is a mutex?");
        assert_eq!(ai.questions.lock().clone(), vec!["12:what is a mutex?"]);
        assert!(sink.played.lock().is_empty());
        assert!(!asker.is_loading());
    }

    #[tokio::test]
    async fn test_audio_answer_is_played_locally() {
        let (voice, mut server) = joined_voice().await;
        let ai = Arc::new(FakeAi {
            audio_base64: Some("SUQzBA==".into()),
            ..FakeAi::default()
        });
        let sink = Arc::new(FakeSink::default());
        let asker = ask(voice, ai, sink.clone());

        let outcome = asker.ask_text("explain paging").await.unwrap();
        assert_eq!(outcome.delivery, Delivery::Played);
        assert_eq!(sink.played.lock().clone(), vec![b"ID3\x04".to_vec()]);
        // nothing went out over the voice channel
        assert!(server.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_playback_failure_falls_back_to_text() {
        let (voice, _server) = joined_voice().await;
        let ai = Arc::new(FakeAi {
            audio_base64: Some("SUQzBA==".into()),
            ..FakeAi::default()
        });
        let sink = Arc::new(FakeSink {
            broken: true,
            ..FakeSink::default()
        });
        let asker = ask(voice, ai, sink);

        let outcome = asker.ask_text("explain paging").await.unwrap();
        assert!(matches!(outcome.delivery, Delivery::PlaybackFailed(_)));
        assert_eq!(outcome.answer, "About explain paging");
    }

    #[tokio::test]
    async fn test_second_question_in_flight_is_rejected() {
        let (voice, _server) = joined_voice().await;
        let gate = Arc::new(Notify::new());
        let ai = Arc::new(FakeAi {
            gate: Some(gate.clone()),
            ..FakeAi::default()
        });
        let asker = Arc::new(ask(voice, ai.clone(), Arc::new(FakeSink::default())));

        let first = {
            let asker = asker.clone();
            tokio::spawn(async move { asker.ask_text("first").await })
        };
        let watched = ai.clone();
        wait_until(move || watched.calls.load(Ordering::SeqCst) == 1).await;
        assert!(asker.is_loading());

        assert!(matches!(asker.ask_text("second").await, Err(AskAiError::Busy)));
        assert_eq!(ai.calls.load(Ordering::SeqCst), 1);

        gate.notify_one();
        assert!(first.await.unwrap().is_ok());
        assert!(!asker.is_loading());
    }

    #[tokio::test]
    async fn test_one_question_per_voice_session() {
        let (voice, _server) = joined_voice().await;
        let gate = Arc::new(Notify::new());
        let ai = Arc::new(FakeAi {
            gate: Some(gate.clone()),
            ..FakeAi::default()
        });
        let first_helper = Arc::new(ask(voice.clone(), ai.clone(), Arc::new(FakeSink::default())));
        let second_helper = ask(voice, ai.clone(), Arc::new(FakeSink::default()));

        let first = {
            let asker = first_helper.clone();
            tokio::spawn(async move { asker.ask_text("first").await })
        };
        let watched = ai.clone();
        wait_until(move || watched.calls.load(Ordering::SeqCst) == 1).await;
        assert!(second_helper.is_loading());

        assert!(matches!(
            second_helper.ask_text("second").await,
            Err(AskAiError::Busy)
        ));
        assert_eq!(ai.calls.load(Ordering::SeqCst), 1);

        gate.notify_one();
        assert!(first.await.unwrap().is_ok());
        assert!(!second_helper.is_loading());

        gate.notify_one();
        assert!(second_helper.ask_text("second").await.is_ok());
        assert_eq!(ai.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_answer_after_leave_is_dropped() {
        let (voice, _server) = joined_voice().await;
        let gate = Arc::new(Notify::new());
        let ai = Arc::new(FakeAi {
            gate: Some(gate.clone()),
            audio_base64: Some("SUQzBA==".into()),
            ..FakeAi::default()
        });
        let sink = Arc::new(FakeSink::default());
        let asker = Arc::new(ask(voice.clone(), ai.clone(), sink.clone()));

        let pending = {
            let asker = asker.clone();
            tokio::spawn(async move { asker.ask_text("explain paging").await })
        };
        let watched = ai.clone();
        wait_until(move || watched.calls.load(Ordering::SeqCst) == 1).await;

        voice.leave();
        gate.notify_one();
        assert!(matches!(pending.await.unwrap(), Err(AskAiError::SessionEnded)));
        assert!(sink.played.lock().is_empty());
        assert!(!asker.is_loading());
    }

    #[tokio::test]
    async fn test_answer_after_rejoin_is_dropped() {
        let connector = Arc::new(MemoryConnector::new());
        let deps = VoiceDeps {
            connector: connector.clone(),
            capture: Arc::new(FakeCapture::new()),
            peers: Arc::new(FakePeerConnector::new()),
        };
        let settings = ChannelSettings::new(Url::parse("ws://localhost:8000").unwrap(), "t");
        let (voice, _events) = VoiceSession::new(deps, settings);
        voice.join("5").await.unwrap();
        let _first_server = connector.accept().await;

        let gate = Arc::new(Notify::new());
        let ai = Arc::new(FakeAi {
            gate: Some(gate.clone()),
            audio_base64: Some("SUQzBA==".into()),
            ..FakeAi::default()
        });
        let sink = Arc::new(FakeSink::default());
        let asker = Arc::new(ask(voice.clone(), ai.clone(), sink.clone()));

        let pending = {
            let asker = asker.clone();
            tokio::spawn(async move { asker.ask_text("explain paging").await })
        };
        let watched = ai.clone();
        wait_until(move || watched.calls.load(Ordering::SeqCst) == 1).await;

        voice.leave();
        voice.join("5").await.unwrap();
        let _second_server = connector.accept().await;
        assert_eq!(voice.state(), VoiceState::Joined);

        gate.notify_one();
        assert!(matches!(pending.await.unwrap(), Err(AskAiError::SessionEnded)));
        assert!(sink.played.lock().is_empty());
    }

    #[tokio::test]
    async fn test_errors_are_inline_and_voice_survives() {
        let (voice, _server) = joined_voice().await;
        let ai = Arc::new(FakeAi {
            fail: true,
            ..FakeAi::default()
        });
        let asker = ask(voice.clone(), ai, Arc::new(FakeSink::default()));

        let err = asker.ask_text("anything").await.unwrap_err();
        assert_eq!(err.to_string(), "Not enrolled in this course (HTTP 403)");
        assert!(matches!(asker.ask_text("   ").await, Err(AskAiError::EmptyQuestion)));
        assert_eq!(voice.state(), VoiceState::Joined);
        assert!(!asker.is_loading());
    }

    #[tokio::test]
    async fn test_spoken_question() {
        let (voice, _server) = joined_voice().await;
        let ai = Arc::new(FakeAi::default());
        let recognizer = Arc::new(FakeRecognizer(Mutex::new(Some(Ok("what is RAID".into())))));
        let asker = ask(voice.clone(), ai.clone(), Arc::new(FakeSink::default()))
            .with_recognizer(recognizer);

        let outcome = asker.ask_spoken().await.unwrap();
        assert_eq!(outcome.question, "what is RAID");

        // the recognizer is exhausted: no speech this time
        assert!(matches!(
            asker.ask_spoken().await,
            Err(AskAiError::Speech(SpeechError::NoSpeech))
        ));
        assert_eq!(ai.calls.load(Ordering::SeqCst), 1);
        assert_eq!(voice.state(), VoiceState::Joined);

        let plain = ask(voice, ai, Arc::new(FakeSink::default()));
        assert!(matches!(
            plain.ask_spoken().await,
            Err(AskAiError::SpeechUnavailable)
        ));
    }
}
