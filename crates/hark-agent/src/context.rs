//! Context window management
//!
//! Keeps the conversation inside a token budget. When the running total
//! exceeds the budget, the oldest messages are folded into a single summary
//! message while the most recent messages and the active turn stay verbatim.
//!
//! Messages of the turn in progress live in a pending segment at the end of
//! the window. They count toward the budget and are never summarized; the
//! controller either commits them when the turn completes or discards them
//! when the turn is interrupted.

use std::sync::Arc;

use async_trait::async_trait;
use hark_ai::{Content, Message, Model};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::transport::{RunConfig, Transport};

/// Fixed per-message cost added to the character estimate
pub const MESSAGE_OVERHEAD_TOKENS: usize = 8;

const SUMMARY_HEADER: &str = "Resumen de contexto:";
const MAX_TOOL_RESULT_CHARS: usize = 2000;
const MAX_ARG_CHARS: usize = 100;
/// A single tool result may take at most 1/N of the budget
const TOOL_RESULT_BUDGET_SHARE: usize = 4;
const CLIPPED_MARKER: &str = "\n[resultado recortado]";

/// Budget configuration for the context window
#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Upper bound on the running token estimate after compaction
    pub max_context_tokens: usize,
    /// Size the synthesized summary aims for
    pub summary_target_tokens: usize,
    /// Number of most recent messages that are never summarized
    pub preserve_tail: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_context_tokens: 90_000,
            summary_target_tokens: 6_000,
            preserve_tail: 6,
        }
    }
}

impl ContextConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_context_tokens <= MESSAGE_OVERHEAD_TOKENS {
            return Err(Error::Config(format!(
                "max_context_tokens must be greater than {}",
                MESSAGE_OVERHEAD_TOKENS
            )));
        }
        if self.summary_target_tokens == 0
            || self.summary_target_tokens >= self.max_context_tokens
        {
            return Err(Error::Config(format!(
                "summary_target_tokens ({}) must be between 1 and max_context_tokens ({})",
                self.summary_target_tokens, self.max_context_tokens
            )));
        }
        Ok(())
    }
}

// --- Token Estimation ---

/// Estimate token count for a single message (chars/4 plus a fixed overhead)
pub fn estimate_tokens(message: &Message) -> usize {
    let char_count = match message {
        Message::System { content, .. } => content.chars().count(),
        other => content_char_count(other.content()),
    };
    char_count.div_ceil(4) + MESSAGE_OVERHEAD_TOKENS
}

/// Estimate total tokens for a slice of messages
pub fn estimate_total_tokens(messages: &[Message]) -> usize {
    messages.iter().map(estimate_tokens).sum()
}

fn content_char_count(content: &[Content]) -> usize {
    content
        .iter()
        .map(|c| match c {
            Content::Text { text } => text.chars().count(),
            Content::ToolCall {
                name, arguments, ..
            } => name.chars().count() + arguments.to_string().chars().count(),
        })
        .sum()
}

/// One message held by the window
#[derive(Debug, Clone)]
pub struct ContextEntry {
    pub id: Uuid,
    pub message: Message,
    pub tokens: usize,
    pub is_summary: bool,
}

/// Result of a compaction pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompactionOutcome {
    /// The window already fit the budget
    NotNeeded,
    Compacted {
        tokens_before: usize,
        tokens_after: usize,
        messages_summarized: usize,
    },
}

/// Produces the text of a summary message
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Summarize `transcript`, folding in the `previous` summary when present.
    /// The result should stay near `target_tokens`; the window truncates
    /// anything longer.
    async fn summarize(
        &self,
        previous: Option<&str>,
        transcript: &str,
        target_tokens: usize,
        cancel: CancellationToken,
    ) -> Result<String>;
}

/// Bounded, append-only conversation history
#[derive(Debug)]
pub struct ContextWindow {
    config: ContextConfig,
    entries: Vec<ContextEntry>,
    total_tokens: usize,
    turn_start: Option<usize>,
}

impl ContextWindow {
    pub fn new(config: ContextConfig) -> Self {
        Self {
            config,
            entries: Vec::new(),
            total_tokens: 0,
            turn_start: None,
        }
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Append a message and return its id.
    pub fn append(&mut self, message: Message) -> Uuid {
        let tokens = estimate_tokens(&message);
        let id = Uuid::new_v4();
        self.total_tokens += tokens;
        self.entries.push(ContextEntry {
            id,
            message,
            tokens,
            is_summary: false,
        });
        id
    }

    /// All messages in order, including the active turn.
    pub fn snapshot(&self) -> Vec<Message> {
        self.entries.iter().map(|e| e.message.clone()).collect()
    }

    pub fn entries(&self) -> &[ContextEntry] {
        &self.entries
    }

    pub fn total_tokens(&self) -> usize {
        self.total_tokens
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The current summary entry, if older history was compacted.
    pub fn summary(&self) -> Option<&ContextEntry> {
        self.entries.iter().find(|e| e.is_summary)
    }

    /// Clip a tool result to its share of the budget, keeping the head.
    pub fn clip_tool_result(&self, text: String) -> String {
        let max_chars = self.config.max_context_tokens / TOOL_RESULT_BUDGET_SHARE * 4;
        let count = text.chars().count();
        if count <= max_chars {
            return text;
        }
        tracing::debug!(chars = count, max_chars, "tool result clipped");
        let keep = max_chars.saturating_sub(CLIPPED_MARKER.chars().count());
        let mut clipped = truncate_chars(&text, keep);
        clipped.push_str(CLIPPED_MARKER);
        clipped
    }

    /// Mark the start of a turn; messages appended from here on are pending.
    pub fn begin_turn(&mut self) {
        if self.turn_start.is_some() {
            tracing::warn!("begin_turn called with a turn still pending; keeping earlier start");
            return;
        }
        self.turn_start = Some(self.entries.len());
    }

    /// Messages appended since `begin_turn`.
    pub fn turn_messages(&self) -> Vec<Message> {
        match self.turn_start {
            Some(start) => self.entries[start..]
                .iter()
                .map(|e| e.message.clone())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Keep the pending turn as regular history.
    pub fn commit_turn(&mut self) {
        self.turn_start = None;
    }

    /// Drop every message of the pending turn. Returns how many were removed.
    pub fn discard_turn(&mut self) -> usize {
        let Some(start) = self.turn_start.take() else {
            return 0;
        };
        let removed: Vec<ContextEntry> = self.entries.drain(start..).collect();
        self.total_tokens -= removed.iter().map(|e| e.tokens).sum::<usize>();
        removed.len()
    }

    /// Index of the first message that must be kept verbatim.
    ///
    /// Covers the last `preserve_tail` messages and the pending turn, and
    /// never starts on a tool result so results stay with their call.
    fn tail_start(&self) -> usize {
        let len = self.entries.len();
        let mut start = len.saturating_sub(self.config.preserve_tail);
        if let Some(turn) = self.turn_start {
            start = start.min(turn);
        }
        while start > 0
            && start < len
            && matches!(self.entries[start].message, Message::ToolResult { .. })
        {
            start -= 1;
        }
        start
    }

    /// Compact older history when the running total exceeds the budget.
    ///
    /// Afterwards `total_tokens() <= max_context_tokens`. When the preserved
    /// tail alone exceeds the budget nothing is changed and
    /// [`Error::ContextBudget`] is returned.
    pub async fn compact_if_needed(
        &mut self,
        summarizer: &dyn Summarizer,
        cancel: &CancellationToken,
    ) -> Result<CompactionOutcome> {
        let budget = self.config.max_context_tokens;
        if self.total_tokens <= budget {
            return Ok(CompactionOutcome::NotNeeded);
        }

        let tail_start = self.tail_start();
        let tail_tokens: usize = self.entries[tail_start..].iter().map(|e| e.tokens).sum();
        if tail_tokens > budget {
            return Err(Error::ContextBudget {
                tail_messages: self.entries.len() - tail_start,
                tail_tokens,
                budget,
            });
        }

        let head = &self.entries[..tail_start];
        let previous = head
            .iter()
            .rev()
            .find(|e| e.is_summary)
            .map(|e| summary_body(&e.message));
        let block: Vec<Message> = head
            .iter()
            .filter(|e| !e.is_summary)
            .map(|e| e.message.clone())
            .collect();

        let room = budget - tail_tokens;
        let target = self
            .config
            .summary_target_tokens
            .min(room.saturating_sub(MESSAGE_OVERHEAD_TOKENS));

        let summary_entry = if target == 0 {
            tracing::warn!(room, "no room left for a summary; older history dropped");
            None
        } else {
            let transcript = serialize_messages_for_summary(&block);
            let text = match summarizer
                .summarize(previous.as_deref(), &transcript, target, cancel.clone())
                .await
            {
                Ok(s) if !s.trim().is_empty() => s,
                Ok(_) => fallback_summary(previous.as_deref(), &transcript, target),
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    tracing::warn!(error = %e, "summarization failed, keeping an excerpt instead");
                    fallback_summary(previous.as_deref(), &transcript, target)
                }
            };
            let content = truncate_chars(
                &format!("{}\n{}", SUMMARY_HEADER, text.trim()),
                target * 4,
            );
            let message = Message::system(content);
            Some(ContextEntry {
                id: Uuid::new_v4(),
                tokens: estimate_tokens(&message),
                message,
                is_summary: true,
            })
        };

        let tokens_before = self.total_tokens;
        let tail: Vec<ContextEntry> = self.entries.drain(tail_start..).collect();
        let mut entries: Vec<ContextEntry> = summary_entry.into_iter().collect();
        let offset = entries.len();
        entries.extend(tail);

        self.turn_start = self.turn_start.map(|t| t - tail_start + offset);
        self.total_tokens = entries.iter().map(|e| e.tokens).sum();
        self.entries = entries;

        tracing::info!(
            tokens_before,
            tokens_after = self.total_tokens,
            messages_summarized = block.len(),
            "context compacted"
        );

        Ok(CompactionOutcome::Compacted {
            tokens_before,
            tokens_after: self.total_tokens,
            messages_summarized: block.len(),
        })
    }
}

fn summary_body(message: &Message) -> String {
    let text = message.text();
    text.strip_prefix(SUMMARY_HEADER)
        .map(|s| s.trim_start().to_string())
        .unwrap_or(text)
}

fn fallback_summary(previous: Option<&str>, transcript: &str, target_tokens: usize) -> String {
    let excerpt = tail_chars(transcript, target_tokens * 4);
    match previous {
        Some(prev) => format!("{}\n{}", prev, excerpt),
        None => excerpt,
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

fn tail_chars(s: &str, max: usize) -> String {
    let count = s.chars().count();
    s.chars().skip(count.saturating_sub(max)).collect()
}

// --- Message Serialization ---

/// Serialize messages to plain text for the summarization prompt.
fn serialize_messages_for_summary(messages: &[Message]) -> String {
    let mut out = String::new();

    for msg in messages {
        match msg {
            Message::System { content, .. } => {
                out.push_str("[Sistema]: ");
                out.push_str(content);
                out.push('\n');
            }
            Message::User { .. } => {
                let text = msg.text();
                if !text.is_empty() {
                    out.push_str("[Usuario]: ");
                    out.push_str(&text);
                    out.push('\n');
                }
            }
            Message::Assistant { content, .. } => {
                let text = msg.text();
                if !text.is_empty() {
                    out.push_str("[Asistente]: ");
                    out.push_str(&text);
                    out.push('\n');
                }
                let calls: Vec<String> = content
                    .iter()
                    .filter_map(|c| match c {
                        Content::ToolCall {
                            name, arguments, ..
                        } => Some(format!("{}({})", name, format_tool_args(arguments))),
                        _ => None,
                    })
                    .collect();
                if !calls.is_empty() {
                    out.push_str("[Asistente, herramientas]: ");
                    out.push_str(&calls.join("; "));
                    out.push('\n');
                }
            }
            Message::ToolResult {
                tool_name,
                is_error,
                ..
            } => {
                let label = if *is_error {
                    format!("[Error de herramienta ({})]: ", tool_name)
                } else {
                    format!("[Resultado de herramienta ({})]: ", tool_name)
                };
                out.push_str(&label);
                let text = msg.text();
                if text.chars().count() > MAX_TOOL_RESULT_CHARS {
                    out.push_str(&truncate_chars(&text, MAX_TOOL_RESULT_CHARS));
                    out.push_str("...(truncado)");
                } else {
                    out.push_str(&text);
                }
                out.push('\n');
            }
        }
    }

    out
}

fn format_tool_args(args: &serde_json::Value) -> String {
    let clip = |s: String| {
        if s.chars().count() > MAX_ARG_CHARS {
            format!("{}...", truncate_chars(&s, MAX_ARG_CHARS))
        } else {
            s
        }
    };
    match args {
        serde_json::Value::Object(map) => map
            .iter()
            .map(|(k, v)| match v {
                serde_json::Value::String(s) => format!("{}=\"{}\"", k, clip(s.clone())),
                other => format!("{}={}", k, clip(other.to_string())),
            })
            .collect::<Vec<_>>()
            .join(", "),
        _ => clip(args.to_string()),
    }
}

/// Remove tool calls without a matching result and results without a call.
///
/// Providers reject histories where an assistant tool call is not answered,
/// so the request is cleaned before every model call.
pub fn sanitize_tool_history(messages: Vec<Message>) -> Vec<Message> {
    use std::collections::HashSet;

    let answered: HashSet<String> = messages
        .iter()
        .filter_map(|m| match m {
            Message::ToolResult { tool_call_id, .. } => Some(tool_call_id.clone()),
            _ => None,
        })
        .collect();

    let mut called: HashSet<String> = HashSet::new();
    let mut out = Vec::with_capacity(messages.len());

    for msg in messages {
        match msg {
            Message::Assistant {
                content,
                metadata,
            } => {
                let content: Vec<Content> = content
                    .into_iter()
                    .filter(|c| match c {
                        Content::ToolCall { id, .. } => answered.contains(id),
                        Content::Text { .. } => true,
                    })
                    .collect();
                for c in &content {
                    if let Content::ToolCall { id, .. } = c {
                        called.insert(id.clone());
                    }
                }
                if !content.is_empty() {
                    out.push(Message::Assistant { content, metadata });
                }
            }
            Message::ToolResult {
                ref tool_call_id, ..
            } => {
                if called.contains(tool_call_id) {
                    out.push(msg);
                }
            }
            other => out.push(other),
        }
    }

    out
}

// --- Summarization via the model ---

const SUMMARIZATION_SYSTEM_PROMPT: &str = "\
Eres un modelo especializado en resumir conversaciones. El resumen reemplazará a los \
mensajes originales en el contexto de un asistente de voz, así que debe conservar todo \
lo necesario para continuar el trabajo.";

const SUMMARIZATION_PROMPT: &str = "\
Resume la conversación de forma completa y útil para continuar el trabajo. \
Incluye decisiones clave, configuraciones, errores encontrados y soluciones. \
Sé conciso pero no omitas detalles importantes. Usa como máximo {target_words} palabras.

<conversacion>
{conversation}
</conversacion>";

const UPDATE_SUMMARIZATION_PROMPT: &str = "\
Este es un resumen existente de una parte anterior de la conversación, seguido de \
mensajes nuevos. Escribe un resumen actualizado que integre ambos, con decisiones \
clave, configuraciones, errores encontrados y soluciones. Usa como máximo \
{target_words} palabras.

<resumen-anterior>
{previous_summary}
</resumen-anterior>

<mensajes-nuevos>
{conversation}
</mensajes-nuevos>";

/// Summarizer backed by the model transport
pub struct TransportSummarizer {
    transport: Arc<dyn Transport>,
    model: Model,
}

impl TransportSummarizer {
    pub fn new(transport: Arc<dyn Transport>, model: Model) -> Self {
        Self { transport, model }
    }
}

#[async_trait]
impl Summarizer for TransportSummarizer {
    async fn summarize(
        &self,
        previous: Option<&str>,
        transcript: &str,
        target_tokens: usize,
        cancel: CancellationToken,
    ) -> Result<String> {
        let target_words = (target_tokens * 3 / 4).max(1).to_string();
        let prompt = match previous {
            Some(prev) => UPDATE_SUMMARIZATION_PROMPT
                .replace("{previous_summary}", prev)
                .replace("{conversation}", transcript)
                .replace("{target_words}", &target_words),
            None => SUMMARIZATION_PROMPT
                .replace("{conversation}", transcript)
                .replace("{target_words}", &target_words),
        };

        let mut model = self.model.clone();
        model.max_tokens = u32::try_from(target_tokens).unwrap_or(u32::MAX);
        let config = RunConfig {
            system_prompt: Some(SUMMARIZATION_SYSTEM_PROMPT.to_string()),
            tools: vec![],
            model,
        };

        match self
            .transport
            .complete(vec![Message::user(prompt)], &config, cancel)
            .await
        {
            Ok(message) => Ok(message.text()),
            Err(hark_ai::Error::Aborted) => Err(Error::Cancelled),
            Err(e) => Err(e.into()),
        }
    }
}
