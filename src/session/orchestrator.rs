//! Per-session orchestration core.
//!
//! Each session runs as one spawned task consuming commands from a bounded
//! channel: transport events, marshalled transcriber events, timer expiries
//! and completion notices from reply/synthesis tasks. Everything that touches
//! session state happens inside that task, which is the serialization
//! discipline the voice activity counters and the turn buffer rely on.
//! Adapter tasks and timers only ever post commands back into the channel.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::audio::{AudioFrame, SAMPLE_RATE, analyze};
use crate::conversation::{ConversationStore, Role};
use crate::error::UpstreamError;
use crate::llm::Responder;
use crate::server::events::ServerEvent;
use crate::stt::{SttEvent, TranscribeRequest, Transcriber, TranscriberHandle};
use crate::tts::Synthesizer;
use crate::vad::{VadDecision, VoiceActivityTracker};

use super::registry::SessionInfo;
use super::turn::{BufferedTurn, INACTIVITY_TIMEOUT, TaskHandle, TurnBuffer};

/// Commands per session; frames dominate, at roughly 16 per second.
const COMMAND_QUEUE_CAPACITY: usize = 256;

/// Capacity of the per-transcriber event sink.
const STT_EVENT_CAPACITY: usize = 64;

const PROCESSING_STARTED: &str = "Processing started";
const PROCESSING_STOPPED: &str = "Processing stopped";
const REPLY_FALLBACK: &str = "Sorry, I had trouble generating a response. Please try again.";
const TTS_UNAVAILABLE: &str = "Text-to-speech is not configured.";

/// Everything a session task needs from the outside world.
#[derive(Clone)]
pub struct SessionDeps {
    pub transcriber: Arc<dyn Transcriber>,
    pub responder: Arc<dyn Responder>,
    pub synthesizer: Arc<dyn Synthesizer>,
    pub store: Arc<ConversationStore>,
    /// Turns included in the LLM prompt window
    pub max_history: usize,
    /// Final fragments below this confidence are dropped
    pub min_confidence: f32,
}

/// Commands accepted by a session task.
#[derive(Debug)]
pub enum SessionCommand {
    StartProcessing,
    StopProcessing,
    Frame(AudioFrame),
    /// Marshalled transcriber event. The generation ties it to one open
    /// channel; events from a replaced channel are dropped.
    Stt { generation: u64, event: SttEvent },
    SilenceTimeout { generation: u64 },
    InactivityTimeout { generation: u64 },
    ReplyFinished { id: u64, user_text: String, confidence: f32, result: Result<String, UpstreamError> },
    SynthFinished { id: u64, text: String, result: Result<Vec<u8>, UpstreamError> },
    Shutdown,
}

/// State owned by one session task.
pub struct SessionOrchestrator {
    id: String,
    user_id: String,
    language: String,
    info: Arc<SessionInfo>,
    deps: SessionDeps,
    outbound: mpsc::Sender<ServerEvent>,
    /// Self-sender handed to timers, adapters and pipeline tasks
    commands: mpsc::Sender<SessionCommand>,
    processing: bool,
    vat: VoiceActivityTracker,
    buffer: TurnBuffer,
    transcriber: Option<Box<dyn TranscriberHandle>>,
    stt_generation: u64,
    reply: Option<TaskHandle>,
    synth: Option<TaskHandle>,
    next_task_id: u64,
    inactivity_generation: u64,
}

impl SessionOrchestrator {
    /// Create a session and spawn its task. Returns the registry-facing info
    /// and the command channel.
    pub fn spawn(user_id: &str, language: &str, deps: SessionDeps, outbound: mpsc::Sender<ServerEvent>) -> (Arc<SessionInfo>, mpsc::Sender<SessionCommand>) {
        let id = format!("session_{}_{}", user_id, Utc::now().timestamp_millis());
        let info = Arc::new(SessionInfo::new(id.clone(), user_id.to_string(), language.to_string()));
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);

        let orchestrator = Self {
            id,
            user_id: user_id.to_string(),
            language: language.to_string(),
            info: info.clone(),
            deps,
            outbound,
            commands: commands_tx.clone(),
            processing: false,
            vat: VoiceActivityTracker::new(),
            buffer: TurnBuffer::new(),
            transcriber: None,
            stt_generation: 0,
            reply: None,
            synth: None,
            next_task_id: 0,
            inactivity_generation: 0,
        };

        info!("📞 Session {} created for user {}", info.id, user_id);
        tokio::spawn(orchestrator.run(commands_rx));
        (info, commands_tx)
    }

    async fn run(mut self, mut commands: mpsc::Receiver<SessionCommand>) {
        loop {
            let Some(command) = commands.recv().await else { break };
            if matches!(command, SessionCommand::Shutdown) {
                break;
            }
            self.handle(command).await;
        }
        self.teardown().await;
        debug!("Session {} task finished", self.id);
    }

    async fn handle(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::StartProcessing => self.start_processing().await,
            SessionCommand::StopProcessing => self.stop_processing().await,
            SessionCommand::Frame(frame) => self.on_frame(frame).await,
            SessionCommand::Stt { generation, event } => self.on_stt(generation, event).await,
            SessionCommand::SilenceTimeout { generation } => self.on_silence_timeout(generation).await,
            SessionCommand::InactivityTimeout { generation } => self.on_inactivity_timeout(generation).await,
            SessionCommand::ReplyFinished { id, user_text, confidence, result } => self.on_reply_finished(id, user_text, confidence, result).await,
            SessionCommand::SynthFinished { id, text, result } => self.on_synth_finished(id, text, result).await,
            SessionCommand::Shutdown => {}
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    async fn start_processing(&mut self) {
        self.cancel_tasks();
        self.close_transcriber();
        self.buffer.clear();
        self.vat.reset();
        self.inactivity_generation += 1;
        self.processing = true;
        self.info.set_processing(true);
        info!("🎙️ Session {} processing started", self.id);
        self.emit(ServerEvent::ProcessingStarted { message: PROCESSING_STARTED.to_string() }).await;
    }

    /// Idempotent: a second stop is a no-op with no events.
    async fn stop_processing(&mut self) {
        if !self.processing {
            debug!("Session {} already stopped", self.id);
            return;
        }

        self.cancel_tasks();
        self.flush_buffer(false).await;
        self.close_transcriber();
        self.vat.on_transcriber_gone();
        self.inactivity_generation += 1;
        self.processing = false;
        self.info.set_processing(false);
        info!("⏹️ Session {} processing stopped", self.id);
        self.emit(ServerEvent::ProcessingStopped { message: PROCESSING_STOPPED.to_string() }).await;
    }

    async fn teardown(&mut self) {
        self.cancel_tasks();
        self.flush_buffer(false).await;
        self.close_transcriber();
        self.vat.on_transcriber_gone();
        self.processing = false;
        self.info.set_processing(false);
        info!("🧹 Session {} torn down", self.id);
    }

    // ── Audio path ───────────────────────────────────────────────────────

    async fn on_frame(&mut self, frame: AudioFrame) {
        if !self.processing {
            return;
        }

        let analysis = analyze(&frame);
        trace!("Session {}: frame at {} -> volume {}, voice {}", self.id, frame.timestamp, analysis.volume, analysis.voice_active);

        let now = tokio::time::Instant::now().into_std();
        if let Some(decision) = self.vat.on_frame(now, analysis.voice_active) {
            match decision {
                VadDecision::StartTranscription => self.open_transcriber().await,
                VadDecision::ArmSilenceTimer { generation, delay } => {
                    let commands = self.commands.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = commands.send(SessionCommand::SilenceTimeout { generation }).await;
                    });
                }
                // The tracker invalidated the generation; the sleeping task
                // fires into the void.
                VadDecision::CancelSilenceTimer => {}
            }
        }

        if let Some(handle) = &self.transcriber {
            handle.push(&frame.samples);
        }
    }

    async fn open_transcriber(&mut self) {
        if self.transcriber.is_some() {
            return;
        }
        if !self.deps.transcriber.available() {
            debug!("Session {}: transcription disabled, running VAD only", self.id);
            self.vat.on_transcriber_gone();
            return;
        }

        self.stt_generation += 1;
        let generation = self.stt_generation;

        // Marshal adapter events into the command channel so they are
        // processed inside this task, never concurrently with frames.
        let (events_tx, mut events_rx) = mpsc::channel::<SttEvent>(STT_EVENT_CAPACITY);
        let commands = self.commands.clone();
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                if commands.send(SessionCommand::Stt { generation, event }).await.is_err() {
                    break;
                }
            }
        });

        let request = TranscribeRequest { language: self.language.clone(), sample_rate: SAMPLE_RATE };
        match self.deps.transcriber.open(request, events_tx).await {
            Ok(handle) => {
                self.transcriber = Some(handle);
                self.info.set_transcribing(true);
            }
            Err(UpstreamError::Unavailable(reason)) => {
                debug!("Session {}: transcription unavailable: {}", self.id, reason);
                self.vat.on_transcriber_gone();
            }
            Err(e) => {
                warn!("Session {}: failed to open transcriber: {}", self.id, e);
                self.vat.on_transcriber_gone();
            }
        }
    }

    fn close_transcriber(&mut self) {
        if let Some(mut handle) = self.transcriber.take() {
            handle.close();
            self.info.set_transcribing(false);
            debug!("Session {} transcriber closed", self.id);
        }
    }

    async fn on_silence_timeout(&mut self, generation: u64) {
        if !self.vat.on_silence_timeout(generation) {
            return;
        }
        // Flush before closing: buffered fragments become a turn now instead
        // of waiting out the inactivity timer.
        self.flush_buffer(true).await;
        self.close_transcriber();
    }

    // ── Transcripts ──────────────────────────────────────────────────────

    async fn on_stt(&mut self, generation: u64, event: SttEvent) {
        if generation != self.stt_generation {
            debug!("Session {}: dropping event from replaced transcriber", self.id);
            return;
        }

        match event {
            SttEvent::Fragment(fragment) => {
                self.emit(ServerEvent::TranscriptionResult {
                    transcript: fragment.text.clone(),
                    confidence: fragment.confidence,
                    is_partial: fragment.is_partial,
                    timestamp: fragment.timestamp,
                })
                .await;

                if fragment.is_partial {
                    return;
                }
                if fragment.text.trim().is_empty() {
                    return;
                }
                if fragment.confidence < self.deps.min_confidence {
                    debug!("Session {}: dropping low-confidence final ({:.2})", self.id, fragment.confidence);
                    return;
                }
                self.on_final_fragment(fragment).await;
            }
            SttEvent::Error(message) => {
                warn!("Session {}: transcription error: {}", self.id, message);
                self.emit(ServerEvent::TranscriptionError { message }).await;
            }
            SttEvent::Closed => {
                // Implicit stop: the next speech run opens a fresh channel.
                self.close_transcriber();
                self.vat.on_transcriber_gone();
            }
        }
    }

    /// Barge-in, then buffer, then timer reset — strictly in that order.
    async fn on_final_fragment(&mut self, fragment: crate::stt::TranscriptFragment) {
        info!("🗣️ [{}] {}", self.id, fragment.text);

        if self.reply.is_some() || self.synth.is_some() {
            let interrupted_at = self
                .reply
                .as_ref()
                .or(self.synth.as_ref())
                .map(|task| task.started_at)
                .unwrap_or_else(|| Utc::now().timestamp_millis());
            self.cancel_tasks();
            info!("⏸️ [{}] Reply interrupted by new speech", self.id);
            self.emit(ServerEvent::AiInterrupted { timestamp: Utc::now().timestamp_millis(), interrupted_at }).await;
        }

        self.buffer.push(fragment);

        self.inactivity_generation += 1;
        let generation = self.inactivity_generation;
        let commands = self.commands.clone();
        tokio::spawn(async move {
            tokio::time::sleep(INACTIVITY_TIMEOUT).await;
            let _ = commands.send(SessionCommand::InactivityTimeout { generation }).await;
        });
    }

    async fn on_inactivity_timeout(&mut self, generation: u64) {
        if generation != self.inactivity_generation {
            return;
        }
        let Some(turn) = self.buffer.drain() else { return };
        self.launch_reply(turn);
    }

    // ── Reply and synthesis ──────────────────────────────────────────────

    /// Drain-append-launch as one step: the prompt window is taken before the
    /// user turn is appended so the turn does not appear in it twice.
    fn launch_reply(&mut self, turn: BufferedTurn) {
        info!("🧠 [{}] Processing: \"{}\" ({} fragments, confidence {:.2})", self.id, turn.text, turn.fragments, turn.confidence);

        let history = self.deps.store.window(&self.user_id, self.deps.max_history);
        self.deps.store.append(&self.user_id, Role::User, &turn.text);

        self.next_task_id += 1;
        let handle = TaskHandle::new(self.next_task_id);
        let id = handle.id;
        let cancel = handle.cancel.clone();
        self.reply = Some(handle);

        let responder = self.deps.responder.clone();
        let commands = self.commands.clone();
        let user_text = turn.text;
        let confidence = turn.confidence;
        tokio::spawn(async move {
            let result = responder.respond(&user_text, &history, &cancel).await;
            let _ = commands.send(SessionCommand::ReplyFinished { id, user_text, confidence, result }).await;
        });
    }

    async fn on_reply_finished(&mut self, id: u64, user_text: String, confidence: f32, result: Result<String, UpstreamError>) {
        if self.reply.as_ref().map(|task| task.id) != Some(id) {
            debug!("Session {}: discarding completion of cancelled reply {}", self.id, id);
            return;
        }
        self.reply = None;

        match result {
            Ok(response) => {
                info!("🤖 [{}] {}", self.id, response);
                // Emit before appending: a history query served off the store
                // must never observe an assistant turn whose ai-response has
                // not reached the transport yet.
                self.emit(ServerEvent::AiResponse {
                    response: response.clone(),
                    transcript: user_text,
                    timestamp: Utc::now().timestamp_millis(),
                    confidence,
                    buffered_transcripts: true,
                })
                .await;
                self.deps.store.append(&self.user_id, Role::Assistant, &response);
                self.launch_synth(response).await;
            }
            Err(e) if e.is_cancelled() => {
                debug!("Session {}: reply cancelled", self.id);
            }
            Err(e) => {
                error!("❌ [{}] LLM error: {}", self.id, e);
                self.emit(ServerEvent::AiResponseError { message: REPLY_FALLBACK.to_string(), timestamp: Utc::now().timestamp_millis() }).await;
            }
        }
    }

    async fn launch_synth(&mut self, text: String) {
        if self.synth.is_some() {
            // Concurrent synthesis is forbidden; the live task wins.
            debug!("Session {}: synthesis already live, skipping", self.id);
            return;
        }
        if !self.deps.synthesizer.available() {
            self.emit(ServerEvent::TtsUnavailable { message: TTS_UNAVAILABLE.to_string(), timestamp: Utc::now().timestamp_millis() }).await;
            return;
        }

        self.next_task_id += 1;
        let handle = TaskHandle::new(self.next_task_id);
        let id = handle.id;
        let cancel = handle.cancel.clone();
        self.synth = Some(handle);

        let synthesizer = self.deps.synthesizer.clone();
        let commands = self.commands.clone();
        tokio::spawn(async move {
            let result = synthesizer.synthesize(&text, &cancel).await;
            let _ = commands.send(SessionCommand::SynthFinished { id, text, result }).await;
        });
    }

    async fn on_synth_finished(&mut self, id: u64, text: String, result: Result<Vec<u8>, UpstreamError>) {
        if self.synth.as_ref().map(|task| task.id) != Some(id) {
            debug!("Session {}: discarding audio of cancelled synthesis {}", self.id, id);
            return;
        }
        self.synth = None;

        match result {
            Ok(audio) if audio.is_empty() => {}
            Ok(audio) => {
                info!("🔊 [{}] Sending {} bytes of speech", self.id, audio.len());
                self.emit(ServerEvent::TtsAudio { audio_data: audio, text, timestamp: Utc::now().timestamp_millis() }).await;
            }
            Err(e) if e.is_cancelled() => {}
            Err(UpstreamError::Unavailable(_)) => {
                self.emit(ServerEvent::TtsUnavailable { message: TTS_UNAVAILABLE.to_string(), timestamp: Utc::now().timestamp_millis() }).await;
            }
            Err(e) => {
                error!("❌ [{}] TTS error: {}", self.id, e);
                self.emit(ServerEvent::TtsError { message: e.to_string(), timestamp: Utc::now().timestamp_millis() }).await;
            }
        }
    }

    /// Force the buffered fragments into a turn right now, replying inline
    /// instead of through a task. Used on silence stop, explicit stop and
    /// teardown; the stop paths skip synthesis because the stop sequence
    /// would cancel it immediately anyway.
    async fn flush_buffer(&mut self, synthesize: bool) {
        let Some(turn) = self.buffer.drain() else { return };
        info!("🧠 [{}] Flushing buffered turn: \"{}\"", self.id, turn.text);

        let history = self.deps.store.window(&self.user_id, self.deps.max_history);
        self.deps.store.append(&self.user_id, Role::User, &turn.text);

        let cancel = CancellationToken::new();
        match self.deps.responder.respond(&turn.text, &history, &cancel).await {
            Ok(response) => {
                info!("🤖 [{}] {}", self.id, response);
                // Same ordering as on_reply_finished: event first, then the
                // store append.
                self.emit(ServerEvent::AiResponse {
                    response: response.clone(),
                    transcript: turn.text,
                    timestamp: Utc::now().timestamp_millis(),
                    confidence: turn.confidence,
                    buffered_transcripts: true,
                })
                .await;
                self.deps.store.append(&self.user_id, Role::Assistant, &response);
                if synthesize {
                    self.launch_synth(response).await;
                }
            }
            Err(e) if e.is_cancelled() => {}
            Err(e) => {
                error!("❌ [{}] LLM error during flush: {}", self.id, e);
                self.emit(ServerEvent::AiResponseError { message: REPLY_FALLBACK.to_string(), timestamp: Utc::now().timestamp_millis() }).await;
            }
        }
    }

    fn cancel_tasks(&mut self) {
        if let Some(reply) = self.reply.take() {
            reply.cancel();
        }
        if let Some(synth) = self.synth.take() {
            synth.cancel();
        }
    }

    async fn emit(&self, event: ServerEvent) {
        if self.outbound.send(event).await.is_err() {
            debug!("Session {}: transport gone, dropping event", self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stt::{SttEventSink, TranscriptFragment};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::{advance, timeout};

    // ── Mock upstreams ───────────────────────────────────────────────────

    struct MockTranscriber {
        available: bool,
        sink: Mutex<Option<SttEventSink>>,
        opens: AtomicUsize,
        handle_closed: Arc<AtomicBool>,
    }

    impl MockTranscriber {
        fn new(available: bool) -> Arc<Self> {
            Arc::new(Self { available, sink: Mutex::new(None), opens: AtomicUsize::new(0), handle_closed: Arc::new(AtomicBool::new(false)) })
        }

        /// Wait until the orchestrator has opened a channel, then take the sink.
        async fn take_sink(&self) -> SttEventSink {
            for _ in 0..200 {
                if let Some(sink) = self.sink.lock().take() {
                    return sink;
                }
                tokio::task::yield_now().await;
            }
            panic!("transcriber was never opened");
        }
    }

    struct MockHandle {
        closed: Arc<AtomicBool>,
        pushed: Arc<AtomicUsize>,
    }

    impl TranscriberHandle for MockHandle {
        fn push(&self, samples: &[i16]) {
            self.pushed.fetch_add(samples.len(), Ordering::Relaxed);
        }

        fn close(&mut self) {
            self.closed.store(true, Ordering::Relaxed);
        }
    }

    #[async_trait]
    impl Transcriber for MockTranscriber {
        fn available(&self) -> bool {
            self.available
        }

        async fn open(&self, _request: TranscribeRequest, events: SttEventSink) -> Result<Box<dyn TranscriberHandle>, UpstreamError> {
            if !self.available {
                return Err(UpstreamError::Unavailable("no credentials".to_string()));
            }
            self.opens.fetch_add(1, Ordering::Relaxed);
            self.handle_closed.store(false, Ordering::Relaxed);
            *self.sink.lock() = Some(events);
            Ok(Box::new(MockHandle { closed: self.handle_closed.clone(), pushed: Arc::new(AtomicUsize::new(0)) }))
        }
    }

    struct MockResponder {
        delay: Duration,
        fail: bool,
        calls: Mutex<Vec<(String, Vec<crate::conversation::Turn>)>>,
    }

    impl MockResponder {
        fn new(delay_ms: u64) -> Arc<Self> {
            Arc::new(Self { delay: Duration::from_millis(delay_ms), fail: false, calls: Mutex::new(Vec::new()) })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self { delay: Duration::from_millis(10), fail: true, calls: Mutex::new(Vec::new()) })
        }
    }

    #[async_trait]
    impl Responder for MockResponder {
        async fn respond(&self, user_text: &str, history: &[crate::conversation::Turn], cancel: &CancellationToken) -> Result<String, UpstreamError> {
            self.calls.lock().push((user_text.to_string(), history.to_vec()));
            tokio::select! {
                _ = cancel.cancelled() => Err(UpstreamError::Cancelled),
                _ = tokio::time::sleep(self.delay) => {
                    if self.fail {
                        Err(UpstreamError::Request("llm 500".to_string()))
                    } else {
                        Ok(format!("reply to {}", user_text))
                    }
                }
            }
        }
    }

    struct MockSynthesizer {
        available: bool,
        delay: Duration,
    }

    impl MockSynthesizer {
        fn new(available: bool, delay_ms: u64) -> Arc<Self> {
            Arc::new(Self { available, delay: Duration::from_millis(delay_ms) })
        }
    }

    #[async_trait]
    impl Synthesizer for MockSynthesizer {
        fn available(&self) -> bool {
            self.available
        }

        async fn synthesize(&self, text: &str, cancel: &CancellationToken) -> Result<Vec<u8>, UpstreamError> {
            if !self.available {
                return Err(UpstreamError::Unavailable("no credentials".to_string()));
            }
            tokio::select! {
                _ = cancel.cancelled() => Err(UpstreamError::Cancelled),
                _ = tokio::time::sleep(self.delay) => Ok(text.as_bytes().to_vec()),
            }
        }
    }

    // ── Harness ──────────────────────────────────────────────────────────

    struct Harness {
        commands: mpsc::Sender<SessionCommand>,
        events: mpsc::Receiver<ServerEvent>,
        info: Arc<SessionInfo>,
        transcriber: Arc<MockTranscriber>,
        responder: Arc<MockResponder>,
        store: Arc<ConversationStore>,
    }

    struct HarnessConfig {
        user_id: &'static str,
        responder: Arc<MockResponder>,
        synthesizer: Arc<MockSynthesizer>,
        store: Arc<ConversationStore>,
        min_confidence: f32,
    }

    impl Default for HarnessConfig {
        fn default() -> Self {
            Self {
                user_id: "u1",
                responder: MockResponder::new(50),
                synthesizer: MockSynthesizer::new(true, 50),
                store: Arc::new(ConversationStore::new()),
                min_confidence: 0.0,
            }
        }
    }

    fn spawn_harness(config: HarnessConfig) -> Harness {
        let transcriber = MockTranscriber::new(true);
        let deps = SessionDeps {
            transcriber: transcriber.clone(),
            responder: config.responder.clone(),
            synthesizer: config.synthesizer,
            store: config.store.clone(),
            max_history: 10,
            min_confidence: config.min_confidence,
        };
        let (events_tx, events_rx) = mpsc::channel(256);
        let (info, commands) = SessionOrchestrator::spawn(config.user_id, "en-US", deps, events_tx);
        Harness { commands, events: events_rx, info, transcriber, responder: config.responder, store: config.store }
    }

    impl Harness {
        async fn send(&self, command: SessionCommand) {
            self.commands.send(command).await.unwrap();
        }

        async fn start(&mut self) {
            self.send(SessionCommand::StartProcessing).await;
            let event = self.recv().await;
            assert_eq!(event_name(&event), "processing-started");
        }

        /// Drive enough voice frames to open the transcriber and return its sink.
        async fn open_transcription(&mut self) -> SttEventSink {
            for _ in 0..3 {
                self.send(SessionCommand::Frame(voice_frame())).await;
            }
            self.transcriber.take_sink().await
        }

        async fn recv(&mut self) -> ServerEvent {
            timeout(Duration::from_secs(60), self.events.recv()).await.expect("timed out waiting for event").expect("event channel closed")
        }

        /// Receive events until one matches `name`, returning the skipped
        /// names alongside it.
        async fn recv_until(&mut self, name: &str) -> (ServerEvent, Vec<&'static str>) {
            let mut skipped = Vec::new();
            loop {
                let event = self.recv().await;
                if event_name(&event) == name {
                    return (event, skipped);
                }
                skipped.push(event_name(&event));
            }
        }

        /// Let queued commands and ready tasks settle without advancing far.
        async fn settle(&self) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    fn event_name(event: &ServerEvent) -> &'static str {
        match event {
            ServerEvent::Ready => "ready",
            ServerEvent::SessionCreated { .. } => "session-created",
            ServerEvent::ProcessingStarted { .. } => "processing-started",
            ServerEvent::ProcessingStopped { .. } => "processing-stopped",
            ServerEvent::TranscriptionResult { .. } => "transcription-result",
            ServerEvent::AiResponse { .. } => "ai-response",
            ServerEvent::AiResponseError { .. } => "ai-response-error",
            ServerEvent::AiInterrupted { .. } => "ai-interrupted",
            ServerEvent::TtsAudio { .. } => "tts-audio",
            ServerEvent::TtsError { .. } => "tts-error",
            ServerEvent::TtsUnavailable { .. } => "tts-unavailable",
            ServerEvent::TranscriptionError { .. } => "transcription-error",
            ServerEvent::ConversationHistory { .. } => "conversation-history",
            ServerEvent::ConversationCleared { .. } => "conversation-cleared",
            ServerEvent::ConversationStats { .. } => "conversation-stats",
            ServerEvent::ConversationError { .. } => "conversation-error",
            ServerEvent::Error { .. } => "error",
        }
    }

    fn voice_frame() -> AudioFrame {
        AudioFrame { timestamp: 0, samples: vec![3000; 1024], sample_rate: 16000, channels: 1 }
    }

    fn silence_frame() -> AudioFrame {
        AudioFrame { timestamp: 0, samples: vec![0; 1024], sample_rate: 16000, channels: 1 }
    }

    fn final_fragment(text: &str, confidence: f32) -> SttEvent {
        SttEvent::Fragment(TranscriptFragment { text: text.to_string(), confidence, is_partial: false, timestamp: 0 })
    }

    fn partial_fragment(text: &str) -> SttEvent {
        SttEvent::Fragment(TranscriptFragment { text: text.to_string(), confidence: 0.5, is_partial: true, timestamp: 0 })
    }

    // ── Scenarios ────────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn happy_path_buffers_finals_into_one_reply_and_audio() {
        let mut h = spawn_harness(HarnessConfig::default());
        h.start().await;

        // 10 voice frames: transcription starts on the third.
        for _ in 0..10 {
            h.send(SessionCommand::Frame(voice_frame())).await;
        }
        let sink = h.transcriber.take_sink().await;
        assert_eq!(h.transcriber.opens.load(Ordering::Relaxed), 1);

        // 10 silence frames arm the stop timer; one voice frame cancels it.
        for _ in 0..10 {
            h.send(SessionCommand::Frame(silence_frame())).await;
        }
        h.send(SessionCommand::Frame(voice_frame())).await;

        sink.send(final_fragment("hello", 0.9)).await.unwrap();
        sink.send(final_fragment("world", 0.7)).await.unwrap();
        h.settle().await;

        // The inactivity timer fires 2s after the last final.
        let (event, skipped) = h.recv_until("ai-response").await;
        assert!(skipped.iter().all(|name| *name == "transcription-result"), "unexpected events before reply: {:?}", skipped);
        match event {
            ServerEvent::AiResponse { response, transcript, buffered_transcripts, confidence, .. } => {
                assert_eq!(transcript, "hello world");
                assert_eq!(response, "reply to hello world");
                assert!(buffered_transcripts);
                assert!((confidence - 0.8).abs() < 1e-6);
            }
            other => panic!("unexpected event {:?}", other),
        }

        let (event, _) = h.recv_until("tts-audio").await;
        match event {
            ServerEvent::TtsAudio { text, audio_data, .. } => {
                assert_eq!(text, "reply to hello world");
                assert!(!audio_data.is_empty());
            }
            other => panic!("unexpected event {:?}", other),
        }

        // Exactly one transcriber was opened, and the conversation holds one
        // exchange.
        assert_eq!(h.transcriber.opens.load(Ordering::Relaxed), 1);
        let turns = h.store.window("u1", 10);
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].content, "hello world");
        assert_eq!(turns[1].content, "reply to hello world");
    }

    #[tokio::test(start_paused = true)]
    async fn barge_in_during_synthesis_cancels_audio() {
        let config = HarnessConfig { synthesizer: MockSynthesizer::new(true, 10_000), ..Default::default() };
        let mut h = spawn_harness(config);
        h.start().await;
        let sink = h.open_transcription().await;

        sink.send(final_fragment("first question", 0.9)).await.unwrap();
        let (_, _) = h.recv_until("ai-response").await;
        // Synthesis for the first reply is now live (10s long).

        sink.send(final_fragment("stop", 0.9)).await.unwrap();
        let (event, skipped) = h.recv_until("ai-interrupted").await;
        assert!(matches!(event, ServerEvent::AiInterrupted { .. }));
        assert!(skipped.iter().all(|name| *name == "transcription-result"));

        let (event, skipped) = h.recv_until("ai-response").await;
        match event {
            ServerEvent::AiResponse { transcript, .. } => assert_eq!(transcript, "stop"),
            other => panic!("unexpected event {:?}", other),
        }
        // No audio for the interrupted reply ever surfaced.
        assert!(!skipped.contains(&"tts-audio"));

        let (event, _) = h.recv_until("tts-audio").await;
        match event {
            ServerEvent::TtsAudio { text, .. } => assert_eq!(text, "reply to stop"),
            other => panic!("unexpected event {:?}", other),
        }

        let turns = h.store.window("u1", 10);
        let contents: Vec<&str> = turns.iter().map(|turn| turn.content.as_str()).collect();
        assert_eq!(contents, vec!["first question", "reply to first question", "stop", "reply to stop"]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_reply_is_never_stored_or_prompted() {
        let config = HarnessConfig { responder: MockResponder::new(5_000), ..Default::default() };
        let mut h = spawn_harness(config);
        h.start().await;
        let sink = h.open_transcription().await;

        sink.send(final_fragment("one", 0.9)).await.unwrap();
        h.settle().await;
        advance(INACTIVITY_TIMEOUT).await;
        h.settle().await;
        // Reply for "one" is now in flight (5s long). Barge in.
        sink.send(final_fragment("two", 0.9)).await.unwrap();
        let (_, _) = h.recv_until("ai-interrupted").await;

        let (event, _) = h.recv_until("ai-response").await;
        match event {
            ServerEvent::AiResponse { response, transcript, .. } => {
                assert_eq!(transcript, "two");
                assert_eq!(response, "reply to two");
            }
            other => panic!("unexpected event {:?}", other),
        }

        // The cancelled reply's text exists nowhere: not in the store, not in
        // the second prompt.
        let turns = h.store.window("u1", 10);
        let contents: Vec<&str> = turns.iter().map(|turn| turn.content.as_str()).collect();
        assert_eq!(contents, vec!["one", "two", "reply to two"]);

        let calls = h.responder.calls.lock();
        assert_eq!(calls.len(), 2);
        let (_, second_history) = &calls[1];
        assert!(second_history.iter().all(|turn| turn.content != "reply to one"));
    }

    #[tokio::test(start_paused = true)]
    async fn transcriber_failure_resets_and_reopens_after_debounce() {
        let mut h = spawn_harness(HarnessConfig::default());
        h.start().await;
        let sink = h.open_transcription().await;

        sink.send(partial_fragment("hel")).await.unwrap();
        sink.send(partial_fragment("hello")).await.unwrap();
        sink.send(SttEvent::Error("connection reset".to_string())).await.unwrap();
        sink.send(SttEvent::Closed).await.unwrap();

        let (_, skipped) = h.recv_until("transcription-error").await;
        assert_eq!(skipped, vec!["transcription-result", "transcription-result"]);
        h.settle().await;
        assert!(!h.info.is_transcribing());
        assert!(h.transcriber.handle_closed.load(Ordering::Relaxed));

        // A burst inside the 2s debounce window does not reopen.
        h.send(SessionCommand::Frame(silence_frame())).await;
        for _ in 0..5 {
            h.send(SessionCommand::Frame(voice_frame())).await;
        }
        h.settle().await;
        assert_eq!(h.transcriber.opens.load(Ordering::Relaxed), 1);

        // After the debounce window a fresh three-frame burst reopens.
        advance(Duration::from_millis(2100)).await;
        h.send(SessionCommand::Frame(silence_frame())).await;
        for _ in 0..3 {
            h.send(SessionCommand::Frame(voice_frame())).await;
        }
        h.transcriber.take_sink().await;
        assert_eq!(h.transcriber.opens.load(Ordering::Relaxed), 2);
        assert!(h.info.is_transcribing());
    }

    #[tokio::test(start_paused = true)]
    async fn reply_without_tts_credentials_reports_unavailable() {
        let config = HarnessConfig { synthesizer: MockSynthesizer::new(false, 0), ..Default::default() };
        let mut h = spawn_harness(config);
        h.start().await;
        let sink = h.open_transcription().await;

        sink.send(final_fragment("hi", 0.9)).await.unwrap();
        let (_, _) = h.recv_until("ai-response").await;
        let (event, skipped) = h.recv_until("tts-unavailable").await;
        assert!(matches!(event, ServerEvent::TtsUnavailable { .. }));
        assert!(!skipped.contains(&"tts-audio"));
    }

    #[tokio::test(start_paused = true)]
    async fn responder_failure_emits_error_and_stores_nothing() {
        let config = HarnessConfig { responder: MockResponder::failing(), ..Default::default() };
        let mut h = spawn_harness(config);
        h.start().await;
        let sink = h.open_transcription().await;

        sink.send(final_fragment("hi", 0.9)).await.unwrap();
        let (event, _) = h.recv_until("ai-response-error").await;
        assert!(matches!(event, ServerEvent::AiResponseError { .. }));

        // The user turn is stored; no assistant turn is.
        let turns = h.store.window("u1", 10);
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].role, Role::User);
    }

    #[tokio::test(start_paused = true)]
    async fn two_sessions_stay_isolated() {
        let store = Arc::new(ConversationStore::new());
        let mut a = spawn_harness(HarnessConfig { user_id: "alice", store: store.clone(), ..Default::default() });
        let mut b = spawn_harness(HarnessConfig { user_id: "bob", store: store.clone(), ..Default::default() });
        a.start().await;
        b.start().await;

        let sink_a = a.open_transcription().await;
        let sink_b = b.open_transcription().await;

        // Interleave fragments across the two sessions.
        sink_a.send(final_fragment("alice question", 0.9)).await.unwrap();
        sink_b.send(final_fragment("bob question", 0.9)).await.unwrap();

        let (event_a, _) = a.recv_until("ai-response").await;
        let (event_b, _) = b.recv_until("ai-response").await;
        match (event_a, event_b) {
            (ServerEvent::AiResponse { transcript: ta, .. }, ServerEvent::AiResponse { transcript: tb, .. }) => {
                assert_eq!(ta, "alice question");
                assert_eq!(tb, "bob question");
            }
            other => panic!("unexpected events {:?}", other),
        }

        let stats = store.stats();
        assert_eq!(stats.conversation_count, 2);
        assert_eq!(store.window("alice", 10).len(), 2);
        assert_eq!(store.window("bob", 10).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_processing_flushes_before_acknowledging() {
        let mut h = spawn_harness(HarnessConfig::default());
        h.start().await;
        let sink = h.open_transcription().await;

        sink.send(final_fragment("question", 0.9)).await.unwrap();
        h.settle().await;
        // Stop before the inactivity timer fires.
        h.send(SessionCommand::StopProcessing).await;

        let (event, skipped) = h.recv_until("processing-stopped").await;
        assert!(matches!(event, ServerEvent::ProcessingStopped { .. }));
        // The flushed reply surfaced before the acknowledgement.
        let reply_position = skipped.iter().position(|name| *name == "ai-response");
        assert!(reply_position.is_some(), "flush did not produce a reply: {:?}", skipped);

        let turns = h.store.window("u1", 10);
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].content, "question");

        h.settle().await;
        assert!(!h.info.is_processing());
        assert!(!h.info.is_transcribing());
        assert!(h.transcriber.handle_closed.load(Ordering::Relaxed));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_processing_is_idempotent() {
        let mut h = spawn_harness(HarnessConfig::default());
        h.start().await;

        h.send(SessionCommand::StopProcessing).await;
        h.send(SessionCommand::StopProcessing).await;
        h.settle().await;

        let mut stopped = 0;
        while let Ok(event) = h.events.try_recv() {
            match event {
                ServerEvent::ProcessingStopped { .. } => stopped += 1,
                ServerEvent::Error { .. } => panic!("stop produced an error event"),
                _ => {}
            }
        }
        assert_eq!(stopped, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn silence_timeout_flushes_then_closes_transcriber() {
        let mut h = spawn_harness(HarnessConfig::default());
        h.start().await;
        let sink = h.open_transcription().await;

        // Five silence frames arm the 4s stop timer.
        for _ in 0..5 {
            h.send(SessionCommand::Frame(silence_frame())).await;
        }
        h.settle().await;

        // A final lands 3s into the silence window; its 2s inactivity timer
        // would fire at 5s, but the stop timer fires at 4s and must flush the
        // buffer before the channel closes.
        advance(Duration::from_millis(3000)).await;
        sink.send(final_fragment("last words", 0.9)).await.unwrap();
        h.settle().await;
        advance(Duration::from_millis(1000)).await;

        let (event, _) = h.recv_until("ai-response").await;
        match event {
            ServerEvent::AiResponse { transcript, .. } => assert_eq!(transcript, "last words"),
            other => panic!("unexpected event {:?}", other),
        }
        // The silence flush still synthesizes: the session goes on.
        let (_, _) = h.recv_until("tts-audio").await;
        h.settle().await;
        assert!(h.transcriber.handle_closed.load(Ordering::Relaxed));
        assert!(!h.info.is_transcribing());
        // Session is still processing; only the transcriber closed.
        assert!(h.info.is_processing());
    }

    #[tokio::test(start_paused = true)]
    async fn start_processing_clears_buffered_fragments() {
        let mut h = spawn_harness(HarnessConfig::default());
        h.start().await;
        let sink = h.open_transcription().await;

        sink.send(final_fragment("stale", 0.9)).await.unwrap();
        h.settle().await;

        // Restarting clears the buffer; the old inactivity timer must not
        // produce a reply.
        h.send(SessionCommand::StartProcessing).await;
        advance(Duration::from_millis(2500)).await;
        h.settle().await;

        let mut names = Vec::new();
        while let Ok(event) = h.events.try_recv() {
            names.push(event_name(&event));
        }
        assert!(!names.contains(&"ai-response"), "stale buffer produced a reply: {:?}", names);
        assert_eq!(h.responder.calls.lock().len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn low_confidence_finals_are_dropped() {
        let config = HarnessConfig { min_confidence: 0.5, ..Default::default() };
        let mut h = spawn_harness(config);
        h.start().await;
        let sink = h.open_transcription().await;
        sink.send(final_fragment("noise", 0.2)).await.unwrap();
        advance(Duration::from_millis(2500)).await;
        h.settle().await;

        let mut names = Vec::new();
        while let Ok(event) = h.events.try_recv() {
            names.push(event_name(&event));
        }
        // The fragment still reaches the client as a transcription-result but
        // never becomes a turn.
        assert!(names.contains(&"transcription-result"));
        assert!(!names.contains(&"ai-response"));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_flushes_and_stops_the_task() {
        let mut h = spawn_harness(HarnessConfig::default());
        h.start().await;
        let sink = h.open_transcription().await;

        sink.send(final_fragment("goodbye", 0.9)).await.unwrap();
        h.settle().await;
        h.send(SessionCommand::Shutdown).await;
        // Teardown flushes through the responder; give its timer room to fire.
        tokio::time::sleep(Duration::from_millis(200)).await;

        // The buffered turn was flushed into the store during teardown.
        let turns = h.store.window("u1", 10);
        assert!(turns.iter().any(|turn| turn.content == "goodbye"));
        assert!(!h.info.is_processing());
        assert!(h.transcriber.handle_closed.load(Ordering::Relaxed));
    }
}
