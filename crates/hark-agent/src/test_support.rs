//! In-memory doubles shared by the unit tests

use async_trait::async_trait;
use hark_ai::{AssistantMetadata, Content, Message};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::audio::{AudioBuffer, AudioInput, AudioOutput};
use crate::context::Summarizer;
use crate::error::Result;
use crate::gate::{ConfirmationReply, Confirmer};
use crate::mcp::BridgeTransport;
use crate::mcp::protocol::{BridgeMethod, BridgeRequest};
use crate::speech::{SynthesisError, Synthesizer, TranscriptionError, Transcriber};
use crate::tool::{DEFAULT_TOOL_TIMEOUT, Tool, ToolResult};
use crate::transport::{RunConfig, Transport};

type Hook = Box<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

// ---------------------------------------------------------------------------
// Tools

/// Echoes its `text` argument and counts executions
pub struct CountingTool {
    name: String,
    delay: Duration,
    timeout: Duration,
    executions: AtomicU32,
}

impl CountingTool {
    pub fn new(name: &str) -> Arc<Self> {
        Self::with_limits(name, Duration::ZERO, DEFAULT_TOOL_TIMEOUT)
    }

    pub fn slow(name: &str, delay: Duration) -> Arc<Self> {
        Self::with_limits(name, delay, DEFAULT_TOOL_TIMEOUT)
    }

    pub fn with_limits(name: &str, delay: Duration, timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            delay,
            timeout,
            executions: AtomicU32::new(0),
        })
    }

    pub fn executions(&self) -> u32 {
        self.executions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Tool for CountingTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Counts its executions"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "text": { "type": "string" }
            }
        })
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn execute(&self, _id: &str, arguments: Value, _cancel: CancellationToken) -> ToolResult {
        self.executions.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        ToolResult::text(arguments["text"].as_str().unwrap_or("ok"))
    }
}

// ---------------------------------------------------------------------------
// Confirmation

/// Answers confirmation prompts from a script
pub struct ScriptedConfirmer {
    replies: Mutex<VecDeque<ConfirmationReply>>,
    silent: bool,
    prompts: Mutex<Vec<String>>,
    hook: Mutex<Option<Arc<Hook>>>,
}

impl ScriptedConfirmer {
    pub fn new(replies: Vec<ConfirmationReply>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            silent: false,
            prompts: Mutex::new(Vec::new()),
            hook: Mutex::new(None),
        })
    }

    pub fn replies(texts: Vec<&str>) -> Arc<Self> {
        Self::new(
            texts
                .into_iter()
                .map(|t| ConfirmationReply::Transcript(t.to_string()))
                .collect(),
        )
    }

    /// Never answers.
    pub fn silent() -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(VecDeque::new()),
            silent: true,
            prompts: Mutex::new(Vec::new()),
            hook: Mutex::new(None),
        })
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }

    /// Run `hook` inside every `ask`, before the reply is returned.
    pub fn on_ask<F>(&self, hook: F)
    where
        F: Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync + 'static,
    {
        *self.hook.lock() = Some(Arc::new(Box::new(hook)));
    }
}

#[async_trait]
impl Confirmer for ScriptedConfirmer {
    async fn ask(&self, prompt: &str, cancel: CancellationToken) -> ConfirmationReply {
        self.prompts.lock().push(prompt.to_string());
        let hook = self.hook.lock().clone();
        if let Some(hook) = hook {
            hook().await;
        }
        if self.silent {
            cancel.cancelled().await;
            return ConfirmationReply::Interrupted;
        }
        let next = self.replies.lock().pop_front();
        next.unwrap_or(ConfirmationReply::NoResponse)
    }
}

// ---------------------------------------------------------------------------
// Skill bridge

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeMode {
    Normal,
    /// Never answers
    Hang,
    /// The pipe is gone
    Broken,
    /// Answers with something that is not JSON
    Garbage,
}

/// In-memory bridge answering from a skill table
pub struct FakeBridge {
    skills: Mutex<Vec<Value>>,
    mode: Mutex<BridgeMode>,
    requests: Mutex<Vec<BridgeMethod>>,
}

impl FakeBridge {
    pub fn new(skills: Vec<Value>) -> Arc<Self> {
        Arc::new(Self {
            skills: Mutex::new(skills),
            mode: Mutex::new(BridgeMode::Normal),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn with_skills(names: &[&str]) -> Arc<Self> {
        Self::new(Self::table(names))
    }

    fn table(names: &[&str]) -> Vec<Value> {
        names
            .iter()
            .map(|n| json!({"name": n, "description": format!("Skill {n}")}))
            .collect()
    }

    pub fn set_skills(&self, names: &[&str]) {
        *self.skills.lock() = Self::table(names);
    }

    pub fn set_mode(&self, mode: BridgeMode) {
        *self.mode.lock() = mode;
    }

    pub fn requests(&self) -> Vec<BridgeMethod> {
        self.requests.lock().clone()
    }

    pub fn ran_skill(&self) -> bool {
        self.requests.lock().contains(&BridgeMethod::RunSkill)
    }
}

#[async_trait]
impl BridgeTransport for FakeBridge {
    async fn exchange(&self, request: &BridgeRequest) -> io::Result<String> {
        self.requests.lock().push(request.method);
        let mode = *self.mode.lock();
        match mode {
            BridgeMode::Hang => std::future::pending::<()>().await,
            BridgeMode::Broken => return Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone")),
            BridgeMode::Garbage => return Ok("not json".into()),
            BridgeMode::Normal => {}
        }
        let result = match request.method {
            BridgeMethod::ListSkills => Value::Array(self.skills.lock().clone()),
            BridgeMethod::RefreshSkills => json!({"ok": true}),
            BridgeMethod::GetSkillHelp => json!(format!("help for {}", request.args["name"])),
            BridgeMethod::RunSkill => {
                if request.args["name"] == "broken" {
                    json!({"success": false, "output": "", "error": "exit 2"})
                } else {
                    json!({"success": true, "output": format!("ran {}", request.args["args"])})
                }
            }
        };
        Ok(json!({"id": request.id, "result": result}).to_string())
    }
}

// ---------------------------------------------------------------------------
// Audio

const FAKE_INPUT_RATE: u32 = 16_000;

/// Microphone that always captures a fixed length of silence
pub struct FakeInput {
    captured: Mutex<Duration>,
    starts: AtomicU32,
}

impl FakeInput {
    pub fn new(captured: Duration) -> Arc<Self> {
        Arc::new(Self {
            captured: Mutex::new(captured),
            starts: AtomicU32::new(0),
        })
    }

    pub fn set_captured(&self, captured: Duration) {
        *self.captured.lock() = captured;
    }

    pub fn starts(&self) -> u32 {
        self.starts.load(Ordering::SeqCst)
    }
}

impl AudioInput for FakeInput {
    fn start(&self) -> Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) -> Result<AudioBuffer> {
        let n = (self.captured.lock().as_secs_f64() * FAKE_INPUT_RATE as f64) as usize;
        Ok(AudioBuffer::new(vec![0.0; n], FAKE_INPUT_RATE))
    }
}

/// Speaker that takes as long as the audio lasts
pub struct FakeOutput {
    started: AtomicU32,
    completed: AtomicU32,
}

impl FakeOutput {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            started: AtomicU32::new(0),
            completed: AtomicU32::new(0),
        })
    }

    pub fn started(&self) -> u32 {
        self.started.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> u32 {
        self.completed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AudioOutput for FakeOutput {
    async fn play(&self, audio: AudioBuffer, cancel: CancellationToken) -> Result<()> {
        self.started.fetch_add(1, Ordering::SeqCst);
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(audio.duration()) => {
                self.completed.fetch_add(1, Ordering::SeqCst);
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Speech

/// Returns scripted transcripts, then a default utterance
pub struct FakeTranscriber {
    script: Mutex<VecDeque<std::result::Result<String, TranscriptionError>>>,
    hang: bool,
    calls: AtomicU32,
}

impl FakeTranscriber {
    pub const DEFAULT_UTTERANCE: &'static str = "qué hora es";

    pub fn new(script: Vec<std::result::Result<String, TranscriptionError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            hang: false,
            calls: AtomicU32::new(0),
        })
    }

    /// Never answers until cancelled
    pub fn hanging() -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            hang: true,
            calls: AtomicU32::new(0),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transcriber for FakeTranscriber {
    async fn transcribe(
        &self,
        _audio: &AudioBuffer,
        _language: Option<&str>,
        cancel: CancellationToken,
    ) -> std::result::Result<String, TranscriptionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.hang {
            cancel.cancelled().await;
            return Err(TranscriptionError::NoSpeech);
        }
        let next = self.script.lock().pop_front();
        next.unwrap_or_else(|| Ok(Self::DEFAULT_UTTERANCE.to_string()))
    }
}

/// Produces silence whose length is fixed per instance
pub struct FakeSynthesizer {
    length: Duration,
    fail: bool,
    texts: Mutex<Vec<String>>,
}

impl FakeSynthesizer {
    pub fn new(length: Duration) -> Arc<Self> {
        Arc::new(Self {
            length,
            fail: false,
            texts: Mutex::new(Vec::new()),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            length: Duration::ZERO,
            fail: true,
            texts: Mutex::new(Vec::new()),
        })
    }

    pub fn texts(&self) -> Vec<String> {
        self.texts.lock().clone()
    }
}

#[async_trait]
impl Synthesizer for FakeSynthesizer {
    async fn synthesize(
        &self,
        text: &str,
        _voice: &str,
        _speed: f32,
        _cancel: CancellationToken,
    ) -> std::result::Result<AudioBuffer, SynthesisError> {
        self.texts.lock().push(text.to_string());
        if self.fail {
            return Err(SynthesisError("voice unavailable".into()));
        }
        let n = (self.length.as_secs_f64() * 1000.0) as usize;
        Ok(AudioBuffer::new(vec![0.0; n], 1000))
    }
}

// ---------------------------------------------------------------------------
// Model

/// One scripted model decision
#[derive(Debug, Clone)]
pub enum Step {
    Text(String),
    /// Tool calls as `(name, arguments)`
    Tools(Vec<(String, Value)>),
    /// Neither text nor tool calls
    Empty,
    Fail(String),
    /// Wait until cancelled
    Hang,
}

impl Step {
    pub fn text(text: &str) -> Self {
        Step::Text(text.to_string())
    }

    pub fn tool(name: &str, arguments: Value) -> Self {
        Step::Tools(vec![(name.to_string(), arguments)])
    }
}

/// What one `complete` call was given
#[derive(Debug, Clone)]
pub struct Request {
    pub messages: Vec<Message>,
    pub tools: Vec<String>,
}

/// Replays scripted decisions and records every request
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Step>>,
    requests: Mutex<Vec<Request>>,
    next_call: AtomicU32,
}

impl ScriptedTransport {
    /// Reply used once the script runs out
    pub const FALLBACK: &'static str = "Listo.";

    pub fn new(script: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
            next_call: AtomicU32::new(1),
        })
    }

    pub fn push(&self, step: Step) {
        self.script.lock().push_back(step);
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().clone()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn complete(
        &self,
        messages: Vec<Message>,
        config: &RunConfig,
        cancel: CancellationToken,
    ) -> hark_ai::Result<Message> {
        self.requests.lock().push(Request {
            messages,
            tools: config.tools.iter().map(|t| t.name.clone()).collect(),
        });
        let step = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| Step::text(Self::FALLBACK));

        let content = match step {
            Step::Text(text) => vec![Content::text(text)],
            Step::Tools(calls) => calls
                .into_iter()
                .map(|(name, args)| {
                    let n = self.next_call.fetch_add(1, Ordering::SeqCst);
                    Content::tool_call(format!("call_{n}"), name, args)
                })
                .collect(),
            Step::Empty => vec![],
            Step::Fail(message) => return Err(hark_ai::Error::api("http_400", message)),
            Step::Hang => {
                cancel.cancelled().await;
                return Err(hark_ai::Error::Aborted);
            }
        };
        Ok(Message::Assistant {
            content,
            metadata: AssistantMetadata::default(),
        })
    }
}

/// Summarizer that returns a fixed line
pub struct FixedSummarizer(pub String);

#[async_trait]
impl Summarizer for FixedSummarizer {
    async fn summarize(
        &self,
        _previous: Option<&str>,
        _transcript: &str,
        _target_tokens: usize,
        _cancel: CancellationToken,
    ) -> Result<String> {
        Ok(self.0.clone())
    }
}
