//! Configuration file support

use anyhow::{Context, Result, bail};
use hark_agent::{AgentConfig, ContextConfig, Phrases};
use hark_ai::{Model, Provider};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for hark
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Chat model identifier
    pub model: String,
    /// openrouter, openai or custom
    pub provider: String,
    /// Overrides the provider's base URL
    pub base_url: Option<String>,
    /// Directory the local tools are confined to
    pub project_root: Option<PathBuf>,
    /// Replaces the built-in system prompt
    pub system_prompt_file: Option<PathBuf>,
    /// Appended to the system prompt as project context
    pub project_context_file: Option<PathBuf>,
    pub allow_shell: bool,
    pub ptt_key: String,

    pub max_context_tokens: usize,
    pub summary_target_tokens: usize,
    pub preserve_tail: usize,
    pub max_tool_iters: u32,
    /// Speak a lone skill's output directly instead of asking the model again
    pub skill_output_as_reply: bool,

    pub mcp_timeout_s: u64,
    pub confirmation_timeout_s: u64,
    pub confirmation_listen_s: u64,
    pub min_capture_ms: u64,
    pub asr_timeout_s: u64,
    pub llm_timeout_s: u64,
    pub tts_timeout_s: u64,

    pub speech: SpeechConfig,
    pub audio: AudioDevices,
    pub bridge: BridgeConfig,
    pub api_keys: ApiKeys,
    pub phrases: Phrases,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model: "openai/gpt-4o-mini".to_string(),
            provider: "openrouter".to_string(),
            base_url: None,
            project_root: None,
            system_prompt_file: None,
            project_context_file: None,
            allow_shell: true,
            ptt_key: "space".to_string(),
            max_context_tokens: 90_000,
            summary_target_tokens: 6_000,
            preserve_tail: 6,
            max_tool_iters: 8,
            skill_output_as_reply: true,
            mcp_timeout_s: 30,
            confirmation_timeout_s: 15,
            confirmation_listen_s: 4,
            min_capture_ms: 300,
            asr_timeout_s: 60,
            llm_timeout_s: 120,
            tts_timeout_s: 60,
            speech: SpeechConfig::default(),
            audio: AudioDevices::default(),
            bridge: BridgeConfig::default(),
            api_keys: ApiKeys::default(),
            phrases: Phrases::default(),
        }
    }
}

/// Speech recognition and synthesis
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeechConfig {
    /// ISO-639-1 language hint for transcription
    pub language: Option<String>,
    pub voice: String,
    pub speed: f32,
    /// Strip markdown, code and URLs before synthesis
    pub simplify: bool,
    pub base_url: String,
    pub transcription_model: String,
    pub synthesis_model: String,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            language: Some("es".to_string()),
            voice: "alloy".to_string(),
            speed: 1.0,
            simplify: true,
            base_url: "https://api.openai.com/v1".to_string(),
            transcription_model: "whisper-1".to_string(),
            synthesis_model: "tts-1".to_string(),
        }
    }
}

/// Device names as cpal reports them. Unset means the system default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioDevices {
    pub input_device: Option<String>,
    pub output_device: Option<String>,
}

/// Skill bridge process. Disabled while `command` is unset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub command: Option<String>,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

/// API key configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiKeys {
    pub openrouter: Option<String>,
    pub openai: Option<String>,
}

impl Config {
    /// Get the config directory
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("hark")
    }

    /// Config file path: `explicit`, then `HARK_CONFIG_PATH`, then the default.
    pub fn config_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(path) = explicit {
            return path.to_path_buf();
        }
        if let Ok(path) = std::env::var("HARK_CONFIG_PATH") {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }

    /// Load the file at `path`, or defaults if it does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
    }

    /// Write the example config to `path` unless a file is already there.
    pub fn init(path: &Path) -> std::io::Result<bool> {
        if path.exists() {
            return Ok(false);
        }
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(path, example_config())?;
        Ok(true)
    }

    /// Apply environment overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides looked up through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        fn parsed<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
        where
            T::Err: std::error::Error + Send + Sync + 'static,
        {
            value
                .trim()
                .parse()
                .with_context(|| format!("invalid value for {}: {:?}", key, value))
        }

        if let Some(v) = lookup("MAX_CONTEXT_TOKENS") {
            self.max_context_tokens = parsed("MAX_CONTEXT_TOKENS", &v)?;
        }
        if let Some(v) = lookup("SUMMARY_TARGET_TOKENS") {
            self.summary_target_tokens = parsed("SUMMARY_TARGET_TOKENS", &v)?;
        }
        if let Some(v) = lookup("MAX_TOOL_ITERS") {
            self.max_tool_iters = parsed("MAX_TOOL_ITERS", &v)?;
        }
        if let Some(v) = lookup("MCP_TIMEOUT_S") {
            self.mcp_timeout_s = parsed("MCP_TIMEOUT_S", &v)?;
        }
        if let Some(v) = lookup("OPENROUTER_MODEL").filter(|v| !v.trim().is_empty()) {
            self.model = v.trim().to_string();
        }
        if let Some(v) = lookup("PTT_KEY").filter(|v| !v.trim().is_empty()) {
            self.ptt_key = v.trim().to_string();
        }
        if let Some(v) = lookup("ALLOW_SHELL") {
            self.allow_shell = match v.trim().to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" | "" => false,
                other => bail!("invalid value for ALLOW_SHELL: {:?}", other),
            };
        }
        if let Some(v) = lookup("OPENROUTER_API_KEY").filter(|v| !v.is_empty()) {
            self.api_keys.openrouter = Some(v);
        }
        if let Some(v) = lookup("OPENAI_API_KEY").filter(|v| !v.is_empty()) {
            self.api_keys.openai = Some(v);
        }
        Ok(())
    }

    pub fn provider(&self) -> Result<Provider> {
        match self.provider.to_lowercase().as_str() {
            "openrouter" => Ok(Provider::OpenRouter),
            "openai" => Ok(Provider::OpenAI),
            "custom" => Ok(Provider::Custom),
            other => bail!("unknown provider {:?} (expected openrouter, openai or custom)", other),
        }
    }

    pub fn chat_model(&self) -> Result<Model> {
        let provider = self.provider()?;
        let mut model = Model::new(provider, self.model.clone());
        if let Some(ref url) = self.base_url {
            model.base_url = url.trim_end_matches('/').to_string();
        } else if provider == Provider::Custom {
            bail!("provider \"custom\" requires base_url");
        }
        if provider == Provider::OpenRouter {
            model
                .headers
                .insert("X-Title".to_string(), "hark".to_string());
        }
        Ok(model)
    }

    /// Key for the chat provider. Custom endpoints fall back to the OpenAI key.
    pub fn chat_api_key(&self) -> Option<String> {
        match self.provider().ok()? {
            Provider::OpenRouter => self.api_keys.openrouter.clone(),
            Provider::OpenAI | Provider::Custom => self.api_keys.openai.clone(),
        }
    }

    pub fn speech_api_key(&self) -> Option<String> {
        self.api_keys.openai.clone()
    }

    pub fn context_config(&self) -> ContextConfig {
        ContextConfig {
            max_context_tokens: self.max_context_tokens,
            summary_target_tokens: self.summary_target_tokens,
            preserve_tail: self.preserve_tail,
        }
    }

    pub fn mcp_timeout(&self) -> Duration {
        Duration::from_secs(self.mcp_timeout_s)
    }

    pub fn confirmation_listen(&self) -> Duration {
        Duration::from_secs(self.confirmation_listen_s)
    }

    /// Runtime configuration for the turn controller.
    pub fn agent_config(&self) -> Result<AgentConfig> {
        let mut agent = AgentConfig {
            model: self.chat_model()?,
            context: self.context_config(),
            max_tool_iters: self.max_tool_iters,
            skill_output_as_reply: self.skill_output_as_reply,
            confirmation_timeout: Duration::from_secs(self.confirmation_timeout_s),
            min_capture: Duration::from_millis(self.min_capture_ms),
            asr_timeout: Duration::from_secs(self.asr_timeout_s),
            llm_timeout: Duration::from_secs(self.llm_timeout_s),
            tts_timeout: Duration::from_secs(self.tts_timeout_s),
            language: self.speech.language.clone(),
            voice: self.speech.voice.clone(),
            speed: self.speech.speed,
            simplify_speech: self.speech.simplify,
            phrases: self.phrases.clone(),
            ..AgentConfig::default()
        };
        if let Some(ref path) = self.system_prompt_file {
            agent.system_prompt = fs::read_to_string(path)
                .with_context(|| format!("failed to read system prompt {}", path.display()))?;
        }
        if let Some(ref path) = self.project_context_file {
            agent.project_context = Some(
                fs::read_to_string(path)
                    .with_context(|| format!("failed to read project context {}", path.display()))?,
            );
        }
        agent.validate()?;
        Ok(agent)
    }
}

/// Generate example config content
pub fn example_config() -> &'static str {
    r#"# hark configuration file
# Place at ~/.config/hark/config.toml (Linux) or point HARK_CONFIG_PATH at it.
# Environment variables override the values below: MAX_CONTEXT_TOKENS,
# SUMMARY_TARGET_TOKENS, MAX_TOOL_ITERS, MCP_TIMEOUT_S, OPENROUTER_MODEL,
# PTT_KEY, ALLOW_SHELL, OPENROUTER_API_KEY, OPENAI_API_KEY.

# Chat model and provider (openrouter, openai, custom)
model = "openai/gpt-4o-mini"
provider = "openrouter"
# base_url = "http://localhost:8080/v1"

# Local tools only touch files under this directory (default: current directory)
# project_root = "/home/me/project"
# project_context_file = "CONTEXT.md"
# system_prompt_file = "~/.config/hark/system_prompt.txt"
allow_shell = true

# Push-to-talk key: space, enter, tab, f1..f12 or a single character
ptt_key = "space"

# Context budget (estimated tokens)
max_context_tokens = 90000
summary_target_tokens = 6000
preserve_tail = 6

# Decide/execute iterations per turn
max_tool_iters = 8
# A turn whose only call is a successful skill speaks the skill's output
skill_output_as_reply = true

# Timeouts
mcp_timeout_s = 30
confirmation_timeout_s = 15
confirmation_listen_s = 4
min_capture_ms = 300
asr_timeout_s = 60
llm_timeout_s = 120
tts_timeout_s = 60

[speech]
language = "es"
voice = "alloy"
speed = 1.0
simplify = true
transcription_model = "whisper-1"
synthesis_model = "tts-1"

[audio]
# input_device = "USB Microphone"
# output_device = "Built-in Audio"

# Skill bridge launched over stdio. Leave command unset to run without skills.
[bridge]
# command = "python3"
# args = ["mcp/skill-bridge/skill_bridge.py"]

# API keys (optional - environment variables are preferred)
[api_keys]
# openrouter = "sk-or-..."
# openai = "sk-..."

# Spoken phrases can be overridden individually
[phrases]
# cancelled = "Acción cancelada por el usuario."
"#
}
