//! Turn controller
//!
//! The controller owns the conversation and drives one turn at a time:
//!
//! ```text
//! Idle → Listening → Transcribing → Deciding ─┬→ Responding → Speaking → Idle
//!                                    ↑         │
//!                                    └ Executing ← Confirming
//! ```
//!
//! A PTT press during any stage after Listening cancels the turn's token.
//! Every stage selects on that token, so the turn unwinds promptly. Its
//! messages are discarded and the controller goes straight back to
//! Listening for the new utterance.

use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use hark_ai::Message;

use crate::audio::{AudioBuffer, AudioCoordinator, PlaybackEnd, PlaybackKind};
use crate::config::{AgentConfig, Phrases};
use crate::context::{CompactionOutcome, ContextWindow, Summarizer, sanitize_tool_history};
use crate::error::{Error, Result};
use crate::events::TurnEvent;
use crate::gate::{ConfirmationGate, Confirmer};
use crate::handle::TurnHandle;
use crate::mcp::BridgeError;
use crate::ptt::{PttEvents, PttHandle, PttState};
use crate::registry::{ResolvedCall, ToolRegistry};
use crate::speech::{Synthesizer, Transcriber, TranscriptionError, simplify_for_speech};
use crate::tool::{ToolCall, ToolOutcome};
use crate::transport::{RunConfig, Transport};
use crate::turn::{Stage, Turn, TurnFailure, TurnState, TurnStatus};

/// External services the controller drives
pub struct Collaborators {
    pub transport: Arc<dyn Transport>,
    pub transcriber: Arc<dyn Transcriber>,
    pub synthesizer: Arc<dyn Synthesizer>,
    pub audio: Arc<AudioCoordinator>,
    pub registry: Arc<ToolRegistry>,
    pub confirmer: Arc<dyn Confirmer>,
    pub summarizer: Arc<dyn Summarizer>,
}

/// Why a turn stopped early
enum Halt {
    Interrupted,
    Failed(TurnFailure),
}

impl From<TurnFailure> for Halt {
    fn from(failure: TurnFailure) -> Self {
        Halt::Failed(failure)
    }
}

/// A tool call settled and recorded in the context
struct Resolved {
    message_id: Uuid,
    /// Non-empty output of a skill that succeeded
    skill_output: Option<String>,
}

enum Listened {
    Audio(AudioBuffer),
    /// Too short, or the microphone failed
    Skipped,
    Shutdown,
}

/// Run `fut` unless the turn is cancelled or `limit` elapses first.
async fn bounded<T>(
    cancel: &CancellationToken,
    stage: Stage,
    limit: Duration,
    fut: impl Future<Output = T>,
) -> std::result::Result<T, Halt> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Halt::Interrupted),
        r = tokio::time::timeout(limit, fut) => {
            r.map_err(|_| Halt::Failed(TurnFailure::Timeout { stage, after: limit }))
        }
    }
}

/// The push-to-talk turn state machine
pub struct TurnController {
    config: AgentConfig,
    phrases: Arc<Phrases>,
    system_prompt: String,
    context: ContextWindow,
    transport: Arc<dyn Transport>,
    transcriber: Arc<dyn Transcriber>,
    synthesizer: Arc<dyn Synthesizer>,
    audio: Arc<AudioCoordinator>,
    summarizer: Arc<dyn Summarizer>,
    gate: ConfirmationGate,
    ptt: PttHandle,
    ptt_events: PttEvents,
    handle: TurnHandle,
    refreshing: Arc<AtomicBool>,
}

impl TurnController {
    pub fn new(config: AgentConfig, ptt: PttHandle, parts: Collaborators) -> Result<Self> {
        config.validate()?;
        let handle = TurnHandle::new();
        let phrases = Arc::new(config.phrases.clone());
        let gate = ConfirmationGate::new(
            parts.registry,
            parts.confirmer,
            config.confirmation_timeout,
            phrases.clone(),
        )
        .with_events(handle.events.clone());

        Ok(Self {
            system_prompt: config.full_system_prompt(),
            context: ContextWindow::new(config.context.clone()),
            phrases,
            transport: parts.transport,
            transcriber: parts.transcriber,
            synthesizer: parts.synthesizer,
            audio: parts.audio,
            summarizer: parts.summarizer,
            gate,
            ptt_events: ptt.subscribe(),
            ptt,
            handle,
            refreshing: Arc::new(AtomicBool::new(false)),
            config,
        })
    }

    pub fn handle(&self) -> TurnHandle {
        self.handle.clone()
    }

    pub fn context(&self) -> &ContextWindow {
        &self.context
    }

    pub fn gate(&self) -> &ConfirmationGate {
        &self.gate
    }

    pub fn state(&self) -> TurnState {
        self.handle.state()
    }

    fn emit(&self, event: TurnEvent) {
        let _ = self.handle.events.send(event);
    }

    fn set_state(&self, to: TurnState) {
        let from = self.handle.state.send_replace(to);
        if from != to {
            tracing::debug!(?from, ?to, "state");
            self.emit(TurnEvent::StateChanged { from, to });
        }
    }

    /// Serve turns until [`TurnHandle::shutdown`] is called or the PTT
    /// handle goes away.
    pub async fn run(&mut self) {
        tracing::info!(model = %self.config.model.id, "turn controller started");
        self.refresh_skills().await;

        let shutdown = self.handle.shutdown.clone();
        let mut carried = false;
        loop {
            if !carried {
                self.set_state(TurnState::Idle);
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    pressed = self.ptt_events.pressed() => {
                        if pressed.is_none() {
                            break;
                        }
                    }
                }
            }
            let audio = match self.listen().await {
                Listened::Audio(audio) => audio,
                Listened::Skipped => {
                    carried = false;
                    continue;
                }
                Listened::Shutdown => break,
            };
            carried = self.run_turn(audio).await;
        }

        self.audio.release();
        self.set_state(TurnState::Idle);
        tracing::info!("turn controller stopped");
    }

    /// Capture until the key is released.
    async fn listen(&mut self) -> Listened {
        self.set_state(TurnState::Listening);
        let session = match self.audio.start_capture() {
            Ok(session) => session,
            Err(e) => {
                tracing::error!(error = %e, "could not start capture");
                self.ptt_events.sync();
                self.audio.play_error_tone();
                return Listened::Skipped;
            }
        };

        // The press that got us here may already have been released.
        self.ptt_events.sync();
        if self.ptt_events.state() == PttState::Pressed {
            let shutdown = self.handle.shutdown.clone();
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Listened::Shutdown,
                _ = self.ptt_events.released() => {}
            }
        }

        let audio = match session.finish() {
            Ok(audio) => audio,
            Err(e) => {
                tracing::error!(error = %e, "capture failed");
                return Listened::Skipped;
            }
        };
        if audio.duration() < self.config.min_capture {
            tracing::debug!(
                duration_ms = audio.duration().as_millis() as u64,
                "capture shorter than minimum, ignored"
            );
            return Listened::Skipped;
        }
        Listened::Audio(audio)
    }

    /// Run one turn to a terminal status. Returns true when a PTT press
    /// ended it, so the caller goes straight back to Listening.
    async fn run_turn(&mut self, audio: AudioBuffer) -> bool {
        let mut turn = Turn::new();
        let cancel = self.handle.shutdown.child_token();
        *self.handle.turn_cancel.lock() = Some(cancel.clone());
        let watcher = self.watch_for_press(cancel.clone());

        tracing::info!(turn_id = %turn.id, "turn started");
        self.emit(TurnEvent::TurnStart { turn_id: turn.id });
        self.refresh_skills_in_background();

        let failure = match self.drive(&mut turn, audio, &cancel).await {
            Ok(()) => {
                self.context.commit_turn();
                turn.status = TurnStatus::Completed;
                None
            }
            Err(Halt::Interrupted) => {
                let dropped = self.context.discard_turn();
                self.audio.release();
                turn.status = TurnStatus::Interrupted;
                self.set_state(TurnState::Interrupted);
                tracing::info!(turn_id = %turn.id, dropped, "turn interrupted");
                None
            }
            Err(Halt::Failed(failure)) => {
                let dropped = self.context.discard_turn();
                self.audio.release();
                turn.status = TurnStatus::Failed;
                self.set_state(TurnState::Failed);
                tracing::warn!(turn_id = %turn.id, dropped, error = %failure, "turn failed");
                self.announce(&failure, &cancel).await;
                Some(failure.to_string())
            }
        };

        *self.handle.turn_cancel.lock() = None;
        cancel.cancel();
        let pressed = watcher.await.unwrap_or(false);

        tracing::info!(
            turn_id = %turn.id,
            status = ?turn.status,
            iterations = turn.iterations,
            messages = turn.message_ids.len(),
            elapsed_ms = turn.started_at.elapsed().as_millis() as u64,
            "turn ended"
        );
        self.emit(TurnEvent::TurnEnd {
            turn_id: turn.id,
            status: turn.status,
            failure,
        });
        pressed && !self.handle.is_shutdown()
    }

    /// Cancel `cancel` on the next PTT press. Resolves to whether a press
    /// did it.
    fn watch_for_press(&self, cancel: CancellationToken) -> JoinHandle<bool> {
        let mut events = self.ptt.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => false,
                pressed = events.pressed() => match pressed {
                    Some(_) => {
                        tracing::debug!("PTT pressed, interrupting turn");
                        cancel.cancel();
                        true
                    }
                    None => false,
                },
            }
        })
    }

    async fn drive(
        &mut self,
        turn: &mut Turn,
        audio: AudioBuffer,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), Halt> {
        self.set_state(TurnState::Transcribing);
        let transcribed = bounded(
            cancel,
            Stage::Transcription,
            self.config.asr_timeout,
            self.transcriber
                .transcribe(&audio, self.config.language.as_deref(), cancel.clone()),
        )
        .await?;
        let text = match transcribed {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) | Err(TranscriptionError::NoSpeech) => return Err(TurnFailure::NoSpeech.into()),
            Err(TranscriptionError::Provider(e)) => {
                return Err(TurnFailure::Transcription(e).into());
            }
        };
        tracing::info!(turn_id = %turn.id, transcript = %text, "user said");
        self.emit(TurnEvent::Transcript {
            turn_id: turn.id,
            text: text.clone(),
        });

        self.context.begin_turn();
        turn.message_ids.push(self.context.append(Message::user(text)));

        let response = loop {
            self.set_state(TurnState::Deciding);
            self.audio.start_thinking();
            let decision = self.decide(cancel).await?;

            let calls: Vec<(String, String, Value)> = decision
                .tool_calls()
                .into_iter()
                .map(|(id, name, args)| (id.to_string(), name.to_string(), args.clone()))
                .collect();
            if calls.is_empty() {
                if decision.text().trim().is_empty() {
                    return Err(TurnFailure::EmptyDecision.into());
                }
                break decision;
            }

            turn.iterations += 1;
            if turn.iterations > self.config.max_tool_iters {
                tracing::warn!(
                    turn_id = %turn.id,
                    limit = self.config.max_tool_iters,
                    "tool iteration limit reached"
                );
                break Message::assistant_text(self.phrases.saturation.clone());
            }

            let single = calls.len() == 1;
            let origin = self.context.append(decision);
            turn.message_ids.push(origin);
            let mut direct = None;
            for (id, name, arguments) in calls {
                let call = ToolCall::new(id, name, arguments, origin);
                let resolved = self.resolve_call(turn.id, call, cancel).await?;
                turn.message_ids.push(resolved.message_id);
                if single && self.config.skill_output_as_reply {
                    direct = resolved.skill_output;
                }
            }
            // A lone skill's output is already the answer; skip the model.
            if let Some(output) = direct {
                tracing::debug!(turn_id = %turn.id, "skill output used as the reply");
                break Message::assistant_text(output);
            }
        };

        self.audio.stop_thinking();
        self.set_state(TurnState::Responding);
        let text = response.text();
        turn.message_ids.push(self.context.append(response));
        self.emit(TurnEvent::Response {
            turn_id: turn.id,
            text: text.clone(),
        });

        self.speak(&text, cancel).await
    }

    /// Compact if needed, then ask the model for the next step.
    async fn decide(&mut self, cancel: &CancellationToken) -> std::result::Result<Message, Halt> {
        match self
            .context
            .compact_if_needed(self.summarizer.as_ref(), cancel)
            .await
        {
            Ok(CompactionOutcome::NotNeeded) => {}
            Ok(CompactionOutcome::Compacted {
                tokens_before,
                tokens_after,
                messages_summarized,
            }) => {
                tracing::info!(tokens_before, tokens_after, messages_summarized, "context compacted");
                self.emit(TurnEvent::CompactionEnd {
                    tokens_before,
                    tokens_after,
                    messages_summarized,
                });
            }
            Err(Error::Cancelled) => return Err(Halt::Interrupted),
            // The kept tail alone is over budget. It is never truncated, so
            // report it and decide on the window as it stands; the oversized
            // messages age out of the tail on later turns.
            Err(e @ Error::ContextBudget { .. }) => {
                let message = e.to_string();
                tracing::warn!(error = %message, "context over budget, continuing uncompacted");
                self.emit(TurnEvent::ConfigurationError { message });
            }
            Err(e) => {
                let message = e.to_string();
                tracing::error!(error = %message, "context compaction failed");
                return Err(TurnFailure::Context(message).into());
            }
        }

        let messages = sanitize_tool_history(self.context.snapshot());
        let run_config = RunConfig {
            system_prompt: Some(self.system_prompt.clone()),
            tools: self.gate.registry().api_tools(),
            model: self.config.model.clone(),
        };
        tracing::debug!(
            messages = messages.len(),
            tools = run_config.tools.len(),
            "requesting decision"
        );

        let decided = bounded(
            cancel,
            Stage::Decision,
            self.config.llm_timeout,
            self.transport.complete(messages, &run_config, cancel.clone()),
        )
        .await?;
        match decided {
            Ok(message) => Ok(message),
            Err(hark_ai::Error::Aborted) => Err(Halt::Interrupted),
            Err(e) => Err(TurnFailure::Decision(e.to_string()).into()),
        }
    }

    /// Confirm and execute one call, then record its outcome in the context.
    async fn resolve_call(
        &mut self,
        turn_id: Uuid,
        mut call: ToolCall,
        cancel: &CancellationToken,
    ) -> std::result::Result<Resolved, Halt> {
        tracing::info!(tool = %call.name, id = %call.id, "tool call proposed");
        let is_skill = matches!(
            self.gate.registry().resolve(&call.name),
            ResolvedCall::Mcp { .. }
        );
        self.emit(TurnEvent::ToolProposed {
            turn_id,
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            arguments: call.arguments.clone(),
        });

        self.audio.stop_thinking();
        self.set_state(TurnState::Confirming);
        let outcome = match self.gate.confirm(&mut call, cancel).await {
            Ok(confirmed) => {
                self.set_state(TurnState::Executing);
                self.audio.start_thinking();
                self.gate.execute(&mut call, confirmed, cancel).await
            }
            Err(outcome) => outcome,
        };

        let summary = self.gate.render(&outcome);
        tracing::info!(tool = %call.name, state = ?outcome.state(), "tool call resolved");
        self.emit(TurnEvent::ToolResolved {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            state: outcome.state(),
            summary: summary.clone(),
        });
        if outcome.is_interrupted() || cancel.is_cancelled() {
            return Err(Halt::Interrupted);
        }

        let skill_output = match outcome {
            ToolOutcome::Succeeded { ref output } if is_skill && !output.trim().is_empty() => {
                Some(output.clone())
            }
            _ => None,
        };
        let content = self.context.clip_tool_result(summary);
        let message = Message::tool_result(call.id, call.name, content, outcome.is_error());
        Ok(Resolved {
            message_id: self.context.append(message),
            skill_output,
        })
    }

    async fn speak(&self, text: &str, cancel: &CancellationToken) -> std::result::Result<(), Halt> {
        self.set_state(TurnState::Speaking);
        let spoken = if self.config.simplify_speech {
            simplify_for_speech(text)
        } else {
            text.trim().to_string()
        };
        if spoken.is_empty() {
            tracing::debug!("nothing speakable in the response");
            return Ok(());
        }

        let synthesized = bounded(
            cancel,
            Stage::Synthesis,
            self.config.tts_timeout,
            self.synthesizer
                .synthesize(&spoken, &self.config.voice, self.config.speed, cancel.clone()),
        )
        .await?;
        let audio = synthesized.map_err(|e| TurnFailure::Synthesis(e.0))?;

        let playback = self.audio.play(audio, PlaybackKind::Speech);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.audio.cancel_playback();
                Err(Halt::Interrupted)
            }
            end = playback.wait() => match end {
                PlaybackEnd::Completed => Ok(()),
                PlaybackEnd::Cancelled if cancel.is_cancelled() => Err(Halt::Interrupted),
                PlaybackEnd::Cancelled => Ok(()),
                PlaybackEnd::Failed(e) => Err(TurnFailure::Audio(e).into()),
            },
        }
    }

    /// Error tone, then the spoken notice for `failure`. A press cuts both.
    async fn announce(&self, failure: &TurnFailure, cancel: &CancellationToken) {
        let tone = self.audio.play_error_tone();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.audio.release();
                return;
            }
            _ = tone.wait() => {}
        }

        let Some(notice) = failure.notice(&self.phrases) else {
            return;
        };
        let synthesized = bounded(
            cancel,
            Stage::Synthesis,
            self.config.tts_timeout,
            self.synthesizer
                .synthesize(notice, &self.config.voice, self.config.speed, cancel.clone()),
        )
        .await;
        let audio = match synthesized {
            Ok(Ok(audio)) => audio,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "failure notice could not be synthesized");
                return;
            }
            Err(_) => return,
        };
        let playback = self.audio.play(audio, PlaybackKind::Notice);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => self.audio.release(),
            _ = playback.wait() => {}
        }
    }

    /// Refresh the skill bridge, if there is one. Runs once at startup.
    async fn refresh_skills(&self) {
        let Some(bridge) = self.gate.registry().bridge().cloned() else {
            return;
        };
        let shutdown = self.handle.shutdown.clone();
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {}
            result = bridge.refresh() => report_refresh(&self.handle.events, result),
        }
    }

    /// Retry an unavailable bridge without holding up the turn.
    fn refresh_skills_in_background(&self) {
        let Some(bridge) = self.gate.registry().bridge() else {
            return;
        };
        if bridge.is_available() || self.refreshing.swap(true, Ordering::AcqRel) {
            return;
        }
        let bridge = bridge.clone();
        let events = self.handle.events.clone();
        let refreshing = self.refreshing.clone();
        tokio::spawn(async move {
            report_refresh(&events, bridge.refresh().await);
            refreshing.store(false, Ordering::Release);
        });
    }
}

fn report_refresh(
    events: &broadcast::Sender<TurnEvent>,
    result: std::result::Result<usize, BridgeError>,
) {
    match result {
        Ok(count) => {
            tracing::info!(count, "skills refreshed");
            let _ = events.send(TurnEvent::SkillsRefreshed { count });
        }
        Err(e) => {
            tracing::warn!(error = %e, "skill bridge refresh failed");
            let _ = events.send(TurnEvent::BridgeUnavailable {
                reason: e.to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextConfig, estimate_total_tokens};
    use crate::mcp::SkillBridgeClient;
    use crate::test_support::{
        BridgeMode, CountingTool, FakeBridge, FakeInput, FakeOutput, FakeSynthesizer,
        FakeTranscriber, FixedSummarizer, ScriptedConfirmer, ScriptedTransport, Step,
    };
    use crate::tool::ToolCallState;
    use hark_ai::Role;
    use serde_json::json;

    struct Setup {
        config: AgentConfig,
        script: Vec<Step>,
        transcripts: Vec<std::result::Result<String, TranscriptionError>>,
        confirmer: Arc<ScriptedConfirmer>,
        registry: ToolRegistry,
        speech: Duration,
        hang_transcription: bool,
    }

    impl Default for Setup {
        fn default() -> Self {
            Self {
                config: AgentConfig {
                    confirmation_timeout: Duration::from_millis(200),
                    asr_timeout: Duration::from_secs(1),
                    llm_timeout: Duration::from_secs(1),
                    tts_timeout: Duration::from_secs(1),
                    ..AgentConfig::default()
                },
                script: vec![],
                transcripts: vec![],
                confirmer: ScriptedConfirmer::replies(vec![]),
                registry: ToolRegistry::new(),
                speech: Duration::from_millis(20),
                hang_transcription: false,
            }
        }
    }

    struct Harness {
        ptt: PttHandle,
        handle: TurnHandle,
        events: broadcast::Receiver<TurnEvent>,
        transport: Arc<ScriptedTransport>,
        synthesizer: Arc<FakeSynthesizer>,
        input: Arc<FakeInput>,
        output: Arc<FakeOutput>,
        task: JoinHandle<TurnController>,
    }

    fn start(setup: Setup) -> Harness {
        let input = FakeInput::new(Duration::from_millis(500));
        let output = FakeOutput::new();
        let audio = AudioCoordinator::with_tones(
            input.clone(),
            output.clone(),
            AudioBuffer::tone(440.0, Duration::from_millis(5), 0.1, 1000),
            AudioBuffer::tone(330.0, Duration::from_millis(10), 0.1, 1000),
        );
        let transport = ScriptedTransport::new(setup.script);
        let synthesizer = FakeSynthesizer::new(setup.speech);
        let ptt = PttHandle::new();
        let transcriber = if setup.hang_transcription {
            FakeTranscriber::hanging()
        } else {
            FakeTranscriber::new(setup.transcripts)
        };

        let controller = TurnController::new(
            setup.config,
            ptt.clone(),
            Collaborators {
                transport: transport.clone(),
                transcriber,
                synthesizer: synthesizer.clone(),
                audio,
                registry: Arc::new(setup.registry),
                confirmer: setup.confirmer,
                summarizer: Arc::new(FixedSummarizer("el usuario pidió la hora".into())),
            },
        )
        .unwrap();
        let handle = controller.handle();
        let events = handle.subscribe();
        let task = tokio::spawn(async move {
            let mut controller = controller;
            controller.run().await;
            controller
        });

        Harness {
            ptt,
            handle,
            events,
            transport,
            synthesizer,
            input,
            output,
            task,
        }
    }

    impl Harness {
        /// Press and release, then collect events through the turn's end.
        async fn utter(&mut self) -> Vec<TurnEvent> {
            self.ptt.press();
            self.ptt.release();
            self.until_turn_end().await
        }

        async fn until_turn_end(&mut self) -> Vec<TurnEvent> {
            self.until(|e| e.is_terminal()).await
        }

        async fn until(&mut self, pred: impl Fn(&TurnEvent) -> bool) -> Vec<TurnEvent> {
            let mut seen = Vec::new();
            loop {
                let event = tokio::time::timeout(Duration::from_secs(5), self.events.recv())
                    .await
                    .expect("timed out waiting for event")
                    .expect("event channel closed");
                let done = pred(&event);
                seen.push(event);
                if done {
                    return seen;
                }
            }
        }

        async fn stop(self) -> TurnController {
            self.handle.shutdown();
            tokio::time::timeout(Duration::from_secs(2), self.task)
                .await
                .expect("controller did not stop")
                .unwrap()
        }
    }

    fn states(events: &[TurnEvent]) -> Vec<TurnState> {
        events
            .iter()
            .filter_map(|e| match e {
                TurnEvent::StateChanged { to, .. } => Some(*to),
                _ => None,
            })
            .collect()
    }

    fn end_status(events: &[TurnEvent]) -> TurnStatus {
        match events.last() {
            Some(TurnEvent::TurnEnd { status, .. }) => *status,
            other => panic!("expected TurnEnd, got {:?}", other),
        }
    }

    fn failure(events: &[TurnEvent]) -> String {
        match events.last() {
            Some(TurnEvent::TurnEnd {
                status: TurnStatus::Failed,
                failure: Some(failure),
                ..
            }) => failure.clone(),
            other => panic!("expected a failed TurnEnd, got {:?}", other),
        }
    }

    fn roles(controller: &TurnController) -> Vec<Role> {
        controller.context().snapshot().iter().map(|m| m.role()).collect()
    }

    fn resolved(events: &[TurnEvent]) -> Vec<(String, ToolCallState, String)> {
        events
            .iter()
            .filter_map(|e| match e {
                TurnEvent::ToolResolved {
                    tool_name,
                    state,
                    summary,
                    ..
                } => Some((tool_name.clone(), *state, summary.clone())),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_question_without_tools() {
        let mut h = start(Setup {
            script: vec![Step::text("Son las tres.")],
            ..Setup::default()
        });

        let events = h.utter().await;
        assert_eq!(end_status(&events), TurnStatus::Completed);
        assert_eq!(
            states(&events),
            vec![
                TurnState::Listening,
                TurnState::Transcribing,
                TurnState::Deciding,
                TurnState::Responding,
                TurnState::Speaking,
            ]
        );
        assert_eq!(h.synthesizer.texts(), vec!["Son las tres."]);
        assert!(h.transport.requests()[0].tools.is_empty());

        let controller = h.stop().await;
        let history = controller.context().snapshot();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].text(), FakeTranscriber::DEFAULT_UTTERANCE);
        assert_eq!(history[1].text(), "Son las tres.");
    }

    #[tokio::test]
    async fn test_denied_tool_call_is_recorded_and_turn_continues() {
        let tool = CountingTool::new("run_shell");
        let mut h = start(Setup {
            script: vec![
                Step::tool("run_shell", json!({"text": "rm -rf /tmp/x"})),
                Step::text("De acuerdo, no hice nada."),
            ],
            confirmer: ScriptedConfirmer::replies(vec!["Cancelar"]),
            registry: ToolRegistry::new().with_tool(tool.clone()),
            ..Setup::default()
        });

        let events = h.utter().await;
        assert_eq!(end_status(&events), TurnStatus::Completed);
        assert_eq!(tool.executions(), 0);
        assert_eq!(
            resolved(&events),
            vec![(
                "run_shell".to_string(),
                ToolCallState::Cancelled,
                "Acción cancelada por el usuario.".to_string()
            )]
        );
        assert!(!states(&events).contains(&TurnState::Executing));

        let requests = h.transport.requests();
        assert_eq!(requests.len(), 2);
        let last = requests[1].messages.last().unwrap();
        assert_eq!(last.role(), Role::Tool);
        assert_eq!(last.text(), "Acción cancelada por el usuario.");
        h.stop().await;
    }

    #[tokio::test]
    async fn test_silent_confirmation_times_out() {
        let tool = CountingTool::new("run_shell");
        let mut h = start(Setup {
            script: vec![
                Step::tool("run_shell", json!({"text": "ls"})),
                Step::text("No hubo respuesta."),
            ],
            confirmer: ScriptedConfirmer::silent(),
            registry: ToolRegistry::new().with_tool(tool.clone()),
            ..Setup::default()
        });

        let events = h.utter().await;
        assert_eq!(end_status(&events), TurnStatus::Completed);
        assert_eq!(tool.executions(), 0);
        let resolved = resolved(&events);
        assert_eq!(resolved[0].1, ToolCallState::Cancelled);
        assert_eq!(resolved[0].2, Phrases::default().confirmation_timeout);
        h.stop().await;
    }

    #[tokio::test]
    async fn test_confirmed_call_executes_and_result_reaches_model() {
        let tool = CountingTool::new("echo");
        let mut h = start(Setup {
            script: vec![
                Step::tool("echo", json!({"text": "hola"})),
                Step::text("Hecho."),
            ],
            confirmer: ScriptedConfirmer::replies(vec!["confirmar"]),
            registry: ToolRegistry::new().with_tool(tool.clone()),
            ..Setup::default()
        });

        let events = h.utter().await;
        assert_eq!(end_status(&events), TurnStatus::Completed);
        assert_eq!(tool.executions(), 1);

        let states = states(&events);
        let confirming = states.iter().position(|s| *s == TurnState::Confirming).unwrap();
        let executing = states.iter().position(|s| *s == TurnState::Executing).unwrap();
        assert!(confirming < executing);

        let requests = h.transport.requests();
        assert_eq!(requests[0].tools, vec!["echo"]);
        assert_eq!(requests[1].messages.last().unwrap().text(), "hola");

        let controller = h.stop().await;
        let roles: Vec<Role> = controller.context().snapshot().iter().map(|m| m.role()).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]);
    }

    #[tokio::test]
    async fn test_hung_bridge_times_out_and_hides_skills() {
        let bridge = FakeBridge::with_skills(&["pdf"]);
        let client = Arc::new(SkillBridgeClient::new(bridge.clone(), Duration::from_millis(50)));
        let mut h = start(Setup {
            script: vec![
                Step::tool("skill_pdf", json!({"args": ["a.pdf"]})),
                Step::text("El servicio no responde."),
            ],
            confirmer: ScriptedConfirmer::replies(vec!["confirmar"]),
            registry: ToolRegistry::new()
                .with_tool(CountingTool::new("echo"))
                .with_bridge(client),
            ..Setup::default()
        });
        h.until(|e| matches!(e, TurnEvent::SkillsRefreshed { .. })).await;
        bridge.set_mode(BridgeMode::Hang);

        let events = h.utter().await;
        assert_eq!(end_status(&events), TurnStatus::Completed);
        assert_eq!(resolved(&events)[0].1, ToolCallState::TimedOut);
        assert!(events
            .iter()
            .any(|e| matches!(e, TurnEvent::BridgeUnavailable { .. })));

        let requests = h.transport.requests();
        assert!(requests[0].tools.contains(&"skill_pdf".to_string()));
        assert_eq!(requests[1].tools, vec!["echo"]);
        h.stop().await;
    }

    #[tokio::test]
    async fn test_tool_iteration_limit() {
        let tool = CountingTool::new("echo");
        let mut config = Setup::default().config;
        config.max_tool_iters = 5;
        let mut h = start(Setup {
            config,
            script: (0..6).map(|_| Step::tool("echo", json!({"text": "otra vez"}))).collect(),
            confirmer: ScriptedConfirmer::replies(vec!["confirmar"; 6]),
            registry: ToolRegistry::new().with_tool(tool.clone()),
            ..Setup::default()
        });

        let events = h.utter().await;
        assert_eq!(end_status(&events), TurnStatus::Completed);
        assert_eq!(tool.executions(), 5);
        assert_eq!(h.transport.calls(), 6);

        let saturation = Phrases::default().saturation;
        assert!(events.iter().any(
            |e| matches!(e, TurnEvent::Response { text, .. } if *text == saturation)
        ));

        let controller = h.stop().await;
        let history = controller.context().snapshot();
        assert_eq!(history.len(), 12);
        assert_eq!(history.last().unwrap().role(), Role::Assistant);
        assert_eq!(history.last().unwrap().text(), saturation);
    }

    #[tokio::test]
    async fn test_press_while_speaking_preempts_turn() {
        let mut h = start(Setup {
            script: vec![Step::text("Una respuesta muy larga."), Step::text("Segunda.")],
            speech: Duration::from_secs(30),
            ..Setup::default()
        });

        h.ptt.press();
        h.ptt.release();
        let speaking = h
            .handle
            .wait_for_state_timeout(|s| s == TurnState::Speaking, Duration::from_secs(2))
            .await;
        assert_eq!(speaking, Some(TurnState::Speaking));

        h.ptt.press();
        let listening = h
            .handle
            .wait_for_state_timeout(|s| s == TurnState::Listening, Duration::from_millis(100))
            .await;
        assert_eq!(listening, Some(TurnState::Listening));
        assert_eq!(end_status(&h.until_turn_end().await), TurnStatus::Interrupted);

        // Straight from Interrupted to Listening, without passing through Idle.
        let resumed = h
            .until(|e| matches!(e, TurnEvent::StateChanged { to: TurnState::Listening, .. }))
            .await;
        assert!(matches!(
            resumed.as_slice(),
            [TurnEvent::StateChanged {
                from: TurnState::Interrupted,
                to: TurnState::Listening
            }]
        ));

        h.ptt.release();
        h.until(|e| matches!(e, TurnEvent::StateChanged { to: TurnState::Speaking, .. }))
            .await;
        let requests = h.transport.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].messages.len(), 1);
        assert_eq!(h.input.starts(), 2);

        let controller = h.stop().await;
        assert!(controller.context().is_empty());
    }

    #[tokio::test]
    async fn test_interrupt_while_deciding_discards_turn() {
        let mut h = start(Setup {
            script: vec![Step::Hang],
            ..Setup::default()
        });

        h.ptt.press();
        h.ptt.release();
        h.handle
            .wait_for_state_timeout(|s| s == TurnState::Deciding, Duration::from_secs(2))
            .await
            .unwrap();
        assert!(h.handle.interrupt());

        let events = h.until_turn_end().await;
        assert_eq!(end_status(&events), TurnStatus::Interrupted);
        let idle = h
            .handle
            .wait_for_state_timeout(|s| s == TurnState::Idle, Duration::from_secs(1))
            .await;
        assert_eq!(idle, Some(TurnState::Idle));

        let controller = h.stop().await;
        assert!(controller.context().is_empty());
    }

    #[tokio::test]
    async fn test_short_capture_is_ignored() {
        let mut h = start(Setup::default());
        h.input.set_captured(Duration::from_millis(100));

        h.ptt.press();
        h.ptt.release();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut started = false;
        while let Ok(event) = h.events.try_recv() {
            started |= matches!(event, TurnEvent::TurnStart { .. });
        }
        assert!(!started);
        assert_eq!(h.transport.calls(), 0);
        assert_eq!(h.handle.state(), TurnState::Idle);
        h.stop().await;
    }

    #[tokio::test]
    async fn test_no_speech_fails_with_notice() {
        let mut h = start(Setup {
            transcripts: vec![Err(TranscriptionError::NoSpeech)],
            ..Setup::default()
        });

        let events = h.utter().await;
        assert_eq!(end_status(&events), TurnStatus::Failed);
        assert!(states(&events).contains(&TurnState::Failed));
        assert_eq!(h.synthesizer.texts(), vec![Phrases::default().no_speech]);
        assert!(h.output.started() >= 2);
        assert_eq!(h.transport.calls(), 0);

        let controller = h.stop().await;
        assert!(controller.context().is_empty());
    }

    #[tokio::test]
    async fn test_empty_decision_fails_and_discards() {
        let mut h = start(Setup {
            script: vec![Step::Empty],
            ..Setup::default()
        });

        let events = h.utter().await;
        match events.last() {
            Some(TurnEvent::TurnEnd {
                status: TurnStatus::Failed,
                failure: Some(failure),
                ..
            }) => assert_eq!(failure, &TurnFailure::EmptyDecision.to_string()),
            other => panic!("unexpected end: {:?}", other),
        }
        let controller = h.stop().await;
        assert!(controller.context().is_empty());
    }

    #[tokio::test]
    async fn test_context_stays_within_budget() {
        let mut config = Setup::default().config;
        config.context = ContextConfig {
            max_context_tokens: 200,
            summary_target_tokens: 20,
            preserve_tail: 2,
        };
        let long = "ab ".repeat(60);
        let mut h = start(Setup {
            config,
            script: (0..5).map(|_| Step::text(&long)).collect(),
            ..Setup::default()
        });

        let mut compacted = false;
        for _ in 0..5 {
            let events = h.utter().await;
            assert_eq!(end_status(&events), TurnStatus::Completed);
            for event in &events {
                if let TurnEvent::CompactionEnd { tokens_after, .. } = event {
                    assert!(*tokens_after <= 200);
                    compacted = true;
                }
            }
        }
        assert!(compacted);
        for request in h.transport.requests() {
            assert!(estimate_total_tokens(&request.messages) <= 200);
        }

        let controller = h.stop().await;
        assert!(controller.context().summary().is_some());
    }

    #[tokio::test]
    async fn test_misconfigured_budget_reports_configuration_error() {
        let mut config = Setup::default().config;
        config.context = ContextConfig {
            max_context_tokens: 30,
            summary_target_tokens: 10,
            preserve_tail: 2,
        };
        let mut h = start(Setup {
            config,
            script: vec![Step::text(&"ab ".repeat(60))],
            ..Setup::default()
        });

        assert_eq!(end_status(&h.utter().await), TurnStatus::Completed);
        let events = h.utter().await;
        assert_eq!(end_status(&events), TurnStatus::Completed);
        assert!(events
            .iter()
            .any(|e| matches!(e, TurnEvent::ConfigurationError { .. })));
        assert_eq!(h.transport.calls(), 2);
        h.stop().await;
    }

    #[tokio::test]
    async fn test_oversized_reply_does_not_wedge_later_turns() {
        let mut config = Setup::default().config;
        config.context = ContextConfig {
            max_context_tokens: 200,
            summary_target_tokens: 20,
            preserve_tail: 2,
        };
        let mut h = start(Setup {
            config,
            script: vec![Step::text(&"ab ".repeat(252))],
            ..Setup::default()
        });

        assert_eq!(end_status(&h.utter().await), TurnStatus::Completed);

        // The oversized reply sits in the kept tail: reported, not fatal.
        let events = h.utter().await;
        assert_eq!(end_status(&events), TurnStatus::Completed);
        assert!(events
            .iter()
            .any(|e| matches!(e, TurnEvent::ConfigurationError { .. })));

        h.transport.push(Step::text("Tercera."));
        let events = h.utter().await;
        assert_eq!(end_status(&events), TurnStatus::Completed);
        assert!(events
            .iter()
            .any(|e| matches!(e, TurnEvent::Response { text, .. } if text == "Tercera.")));

        assert_eq!(end_status(&h.utter().await), TurnStatus::Completed);
        assert_eq!(h.transport.calls(), 4);

        let controller = h.stop().await;
        assert!(controller.context().summary().is_some());
    }

    #[tokio::test]
    async fn test_two_calls_resolve_in_order_and_independently() {
        let a = CountingTool::new("a");
        let b = CountingTool::new("b");
        let mut h = start(Setup {
            script: vec![Step::Tools(vec![
                ("a".to_string(), json!({"text": "uno"})),
                ("b".to_string(), json!({"text": "dos"})),
            ])],
            confirmer: ScriptedConfirmer::replies(vec!["Cancelar", "confirmar"]),
            registry: ToolRegistry::new().with_tool(a.clone()).with_tool(b.clone()),
            ..Setup::default()
        });

        let events = h.utter().await;
        assert_eq!(end_status(&events), TurnStatus::Completed);
        assert_eq!(
            resolved(&events),
            vec![
                (
                    "a".to_string(),
                    ToolCallState::Cancelled,
                    "Acción cancelada por el usuario.".to_string()
                ),
                ("b".to_string(), ToolCallState::Succeeded, "dos".to_string()),
            ]
        );
        assert_eq!(a.executions(), 0);
        assert_eq!(b.executions(), 1);

        let requests = h.transport.requests();
        assert_eq!(requests.len(), 2);
        let results: Vec<String> = requests[1]
            .messages
            .iter()
            .filter(|m| m.role() == Role::Tool)
            .map(|m| m.text())
            .collect();
        assert_eq!(results, vec!["Acción cancelada por el usuario.", "dos"]);

        let controller = h.stop().await;
        assert_eq!(
            roles(&controller),
            vec![Role::User, Role::Assistant, Role::Tool, Role::Tool, Role::Assistant]
        );
    }

    #[tokio::test]
    async fn test_provider_error_fails_turn() {
        let mut h = start(Setup {
            script: vec![Step::Fail("modelo no disponible".into())],
            ..Setup::default()
        });

        let events = h.utter().await;
        let failure = failure(&events);
        assert!(failure.starts_with("decision failed"), "{}", failure);
        assert!(failure.contains("modelo no disponible"));
        assert_eq!(h.synthesizer.texts(), vec![Phrases::default().decision_failed]);

        // The next turn starts from a clean context.
        assert_eq!(end_status(&h.utter().await), TurnStatus::Completed);
        assert_eq!(h.transport.requests()[1].messages.len(), 1);
        h.stop().await;
    }

    #[tokio::test]
    async fn test_slow_model_times_out() {
        let mut config = Setup::default().config;
        config.llm_timeout = Duration::from_millis(100);
        let mut h = start(Setup {
            config,
            script: vec![Step::Hang],
            ..Setup::default()
        });

        let events = h.utter().await;
        assert_eq!(
            failure(&events),
            TurnFailure::Timeout {
                stage: Stage::Decision,
                after: Duration::from_millis(100),
            }
            .to_string()
        );
        assert!(states(&events).contains(&TurnState::Failed));
        assert_eq!(h.synthesizer.texts(), vec![Phrases::default().timeout]);

        let controller = h.stop().await;
        assert!(controller.context().is_empty());
    }

    #[tokio::test]
    async fn test_slow_transcription_times_out() {
        let mut config = Setup::default().config;
        config.asr_timeout = Duration::from_millis(100);
        let mut h = start(Setup {
            config,
            hang_transcription: true,
            ..Setup::default()
        });

        let events = h.utter().await;
        assert_eq!(
            failure(&events),
            TurnFailure::Timeout {
                stage: Stage::Transcription,
                after: Duration::from_millis(100),
            }
            .to_string()
        );
        assert_eq!(h.transport.calls(), 0);

        let controller = h.stop().await;
        assert!(controller.context().is_empty());
    }

    #[tokio::test]
    async fn test_press_while_confirming_discards_call() {
        let tool = CountingTool::new("run_shell");
        let mut h = start(Setup {
            script: vec![Step::tool("run_shell", json!({"text": "ls"}))],
            confirmer: ScriptedConfirmer::silent(),
            registry: ToolRegistry::new().with_tool(tool.clone()),
            ..Setup::default()
        });

        h.ptt.press();
        h.ptt.release();
        let confirming = h
            .handle
            .wait_for_state_timeout(|s| s == TurnState::Confirming, Duration::from_secs(2))
            .await;
        assert_eq!(confirming, Some(TurnState::Confirming));

        h.ptt.press();
        let events = h.until_turn_end().await;
        assert_eq!(end_status(&events), TurnStatus::Interrupted);
        assert_eq!(tool.executions(), 0);

        h.ptt.release();
        assert_eq!(end_status(&h.until_turn_end().await), TurnStatus::Completed);
        let requests = h.transport.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].messages.len(), 1);

        let controller = h.stop().await;
        assert_eq!(tool.executions(), 0);
        assert_eq!(roles(&controller), vec![Role::User, Role::Assistant]);
    }

    #[tokio::test]
    async fn test_press_while_executing_drops_result() {
        let tool = CountingTool::slow("echo", Duration::from_secs(30));
        let mut h = start(Setup {
            script: vec![Step::tool("echo", json!({"text": "tarde"}))],
            confirmer: ScriptedConfirmer::replies(vec!["confirmar"]),
            registry: ToolRegistry::new().with_tool(tool.clone()),
            ..Setup::default()
        });

        h.ptt.press();
        h.ptt.release();
        let executing = h
            .handle
            .wait_for_state_timeout(|s| s == TurnState::Executing, Duration::from_secs(2))
            .await;
        assert_eq!(executing, Some(TurnState::Executing));

        h.ptt.press();
        let events = h.until_turn_end().await;
        assert_eq!(end_status(&events), TurnStatus::Interrupted);

        h.ptt.release();
        assert_eq!(end_status(&h.until_turn_end().await), TurnStatus::Completed);
        let requests = h.transport.requests();
        assert!(requests[1].messages.iter().all(|m| m.role() != Role::Tool));

        let controller = h.stop().await;
        assert_eq!(roles(&controller), vec![Role::User, Role::Assistant]);
    }

    fn skill_setup(reply_directly: bool) -> (Setup, Arc<FakeBridge>) {
        let bridge = FakeBridge::with_skills(&["pdf"]);
        let client = Arc::new(SkillBridgeClient::new(bridge.clone(), Duration::from_secs(1)));
        let mut config = Setup::default().config;
        config.skill_output_as_reply = reply_directly;
        let setup = Setup {
            config,
            script: vec![Step::tool("skill_pdf", json!({"args": ["a.pdf"]}))],
            confirmer: ScriptedConfirmer::replies(vec!["confirmar"]),
            registry: ToolRegistry::new().with_bridge(client),
            ..Setup::default()
        };
        (setup, bridge)
    }

    #[tokio::test]
    async fn test_single_skill_output_is_the_reply() {
        let (setup, bridge) = skill_setup(true);
        let mut h = start(setup);
        h.until(|e| matches!(e, TurnEvent::SkillsRefreshed { .. })).await;

        let events = h.utter().await;
        assert_eq!(end_status(&events), TurnStatus::Completed);
        assert!(bridge.ran_skill());
        assert_eq!(h.transport.calls(), 1);
        assert!(events.iter().any(
            |e| matches!(e, TurnEvent::Response { text, .. } if text == r#"ran ["a.pdf"]"#)
        ));

        let controller = h.stop().await;
        assert_eq!(
            roles(&controller),
            vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]
        );
    }

    #[tokio::test]
    async fn test_skill_output_goes_back_to_model_when_disabled() {
        let (setup, bridge) = skill_setup(false);
        let mut h = start(setup);
        h.until(|e| matches!(e, TurnEvent::SkillsRefreshed { .. })).await;

        let events = h.utter().await;
        assert_eq!(end_status(&events), TurnStatus::Completed);
        assert!(bridge.ran_skill());
        assert_eq!(h.transport.calls(), 2);
        assert!(events.iter().any(|e| matches!(
            e,
            TurnEvent::Response { text, .. } if text == ScriptedTransport::FALLBACK
        )));
        h.stop().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_idle_controller() {
        let h = start(Setup::default());
        let controller = h.stop().await;
        assert_eq!(controller.state(), TurnState::Idle);
    }
}
