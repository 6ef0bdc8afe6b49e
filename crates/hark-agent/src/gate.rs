//! Confirmation gate
//!
//! Every tool call passes through [`ConfirmationGate`]. A call is resolved
//! and validated, the user is asked to confirm it by voice, and only an
//! explicit affirmative reply captured after the prompt lets it run.
//! Silence, ambiguity, a timeout or an interrupt all cancel the call.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::config::Phrases;
use crate::events::TurnEvent;
use crate::mcp::{BridgeError, McpTarget};
use crate::registry::{ResolvedCall, ToolRegistry};
use crate::tool::{CancelReason, FailureReason, ToolCall, ToolCallState, ToolOutcome, ToolResult};

/// What the confirmer heard after the prompt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmationReply {
    Transcript(String),
    /// Nothing was said
    NoResponse,
    /// A PTT press preempted the confirmation
    Interrupted,
}

/// Presents a confirmation prompt and captures the reply
#[async_trait]
pub trait Confirmer: Send + Sync {
    async fn ask(&self, prompt: &str, cancel: CancellationToken) -> ConfirmationReply;
}

/// Classification of a confirmation transcript
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationDecision {
    Affirm,
    Deny,
    Unrecognized,
}

/// Classify a reply by looking for the affirmative and negative stems.
/// A reply containing both is treated as a denial.
pub fn parse_reply(text: &str, affirmative: &str, negative: &str) -> ConfirmationDecision {
    let text = normalize(text);
    let yes = text.contains(&normalize(affirmative));
    let no = text.contains(&normalize(negative));
    match (yes, no) {
        (true, false) => ConfirmationDecision::Affirm,
        (_, true) => ConfirmationDecision::Deny,
        (false, false) => ConfirmationDecision::Unrecognized,
    }
}

fn normalize(text: &str) -> String {
    text.chars()
        .flat_map(char::to_lowercase)
        .map(|c| match c {
            'á' | 'à' | 'ä' | 'â' => 'a',
            'é' | 'è' | 'ë' | 'ê' => 'e',
            'í' | 'ì' | 'ï' | 'î' => 'i',
            'ó' | 'ò' | 'ö' | 'ô' => 'o',
            'ú' | 'ù' | 'ü' | 'û' => 'u',
            other => other,
        })
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect()
}

/// A call that was affirmed, resolved against the descriptor set known at
/// confirmation time. Only [`ConfirmationGate::confirm`] creates one.
#[derive(Debug)]
pub struct ConfirmedCall {
    resolved: ResolvedCall,
    arguments: Value,
}

/// The single path from a proposed tool call to its execution
pub struct ConfirmationGate {
    registry: Arc<ToolRegistry>,
    confirmer: Arc<dyn Confirmer>,
    confirmation_timeout: Duration,
    phrases: Arc<Phrases>,
    events: Option<broadcast::Sender<TurnEvent>>,
}

impl ConfirmationGate {
    pub fn new(
        registry: Arc<ToolRegistry>,
        confirmer: Arc<dyn Confirmer>,
        confirmation_timeout: Duration,
        phrases: Arc<Phrases>,
    ) -> Self {
        Self {
            registry,
            confirmer,
            confirmation_timeout,
            phrases,
            events: None,
        }
    }

    pub fn with_events(mut self, tx: broadcast::Sender<TurnEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn list_descriptors(&self) -> Vec<crate::tool::ToolDescriptor> {
        self.registry.list_descriptors()
    }

    fn emit(&self, event: TurnEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    /// Confirm and, if affirmed, execute `call`.
    pub async fn propose(&self, call: &mut ToolCall, cancel: &CancellationToken) -> ToolOutcome {
        match self.confirm(call, cancel).await {
            Ok(confirmed) => self.execute(call, confirmed, cancel).await,
            Err(outcome) => outcome,
        }
    }

    /// Resolve, validate and ask for confirmation.
    ///
    /// Returns the terminal outcome when the call must not run.
    pub async fn confirm(
        &self,
        call: &mut ToolCall,
        cancel: &CancellationToken,
    ) -> Result<ConfirmedCall, ToolOutcome> {
        let proposed = self.registry.resolve(&call.name);
        let Some(descriptor) = proposed.descriptor() else {
            let outcome = self.unknown_tool(&call.name);
            return Err(self.finish(call, outcome));
        };
        if let Err(e) = self.registry.validate_arguments(descriptor, &call.arguments) {
            let outcome = ToolOutcome::failed(
                FailureReason::InvalidArguments,
                self.phrases.invalid_arguments(&call.name, &e),
            );
            return Err(self.finish(call, outcome));
        }

        self.advance(call, ToolCallState::AwaitingConfirmation);
        let action = describe_action(&proposed, &call.arguments);
        let prompt = self.phrases.confirm_prompt(&action);
        tracing::info!(tool = %call.name, %action, "requesting confirmation");
        self.emit(TurnEvent::ConfirmationRequested {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            prompt: prompt.clone(),
        });

        let reply = tokio::select! {
            biased;
            _ = cancel.cancelled() => ConfirmationReply::Interrupted,
            r = tokio::time::timeout(
                self.confirmation_timeout,
                self.confirmer.ask(&prompt, cancel.child_token()),
            ) => match r {
                Ok(reply) => reply,
                Err(_) => ConfirmationReply::NoResponse,
            },
        };

        let cancel_reason = match reply {
            ConfirmationReply::Interrupted => Some(CancelReason::Interrupted),
            ConfirmationReply::NoResponse => Some(CancelReason::ConfirmationTimeout),
            ConfirmationReply::Transcript(ref text) => {
                tracing::info!(tool = %call.name, reply = %text, "confirmation reply");
                match parse_reply(text, &self.phrases.affirmative, &self.phrases.negative) {
                    ConfirmationDecision::Affirm => None,
                    ConfirmationDecision::Deny => Some(CancelReason::Denied),
                    ConfirmationDecision::Unrecognized => Some(CancelReason::Unrecognized),
                }
            }
        };
        if let Some(reason) = cancel_reason {
            return Err(self.finish(call, ToolOutcome::Cancelled { reason }));
        }

        // The descriptor set may have changed while the user was answering;
        // the call runs against what exists now.
        let resolved = self.registry.resolve(&call.name);
        if resolved.descriptor().is_none() {
            let outcome = self.unknown_tool(&call.name);
            return Err(self.finish(call, outcome));
        }

        self.advance(call, ToolCallState::Confirmed);
        Ok(ConfirmedCall {
            resolved,
            arguments: call.arguments.clone(),
        })
    }

    /// Run a confirmed call under its descriptor's timeout.
    ///
    /// If `cancel` fires while the tool runs, the call is reported as
    /// interrupted and its eventual result is dropped.
    pub async fn execute(
        &self,
        call: &mut ToolCall,
        confirmed: ConfirmedCall,
        cancel: &CancellationToken,
    ) -> ToolOutcome {
        if cancel.is_cancelled() {
            return self.finish(
                call,
                ToolOutcome::Cancelled {
                    reason: CancelReason::Interrupted,
                },
            );
        }

        self.advance(call, ToolCallState::Executing);
        self.emit(TurnEvent::ToolExecutionStart {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
        });
        let started = std::time::Instant::now();

        let outcome = match confirmed.resolved {
            ResolvedCall::Local { descriptor, tool } => {
                let child = cancel.child_token();
                let task_cancel = child.clone();
                let id = call.id.clone();
                let timeout = descriptor.timeout;
                let mut handle = tokio::spawn(async move {
                    tokio::time::timeout(timeout, tool.execute(&id, confirmed.arguments, task_cancel))
                        .await
                });

                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        child.cancel();
                        detach(call.name.clone(), handle);
                        ToolOutcome::Cancelled { reason: CancelReason::Interrupted }
                    }
                    joined = &mut handle => match joined {
                        Ok(Ok(ToolResult { timed_out: Some(after), .. })) => {
                            ToolOutcome::TimedOut { after }
                        }
                        Ok(Ok(result)) if result.is_error => ToolOutcome::failed(
                            FailureReason::ExecutionError,
                            self.phrases.tool_error(&call.name, &result.text_content()),
                        ),
                        Ok(Ok(result)) => ToolOutcome::Succeeded { output: result.text_content() },
                        Ok(Err(_)) => {
                            child.cancel();
                            ToolOutcome::TimedOut { after: timeout }
                        }
                        Err(e) => ToolOutcome::failed(
                            FailureReason::ExecutionError,
                            self.phrases.tool_error(&call.name, &e.to_string()),
                        ),
                    },
                }
            }
            ResolvedCall::Mcp {
                descriptor,
                target,
                bridge,
            } => {
                let timeout = descriptor.timeout;
                let task_bridge = bridge.clone();
                let args = confirmed.arguments;
                let mut handle = tokio::spawn(async move {
                    tokio::time::timeout(timeout, task_bridge.invoke(&target, &args)).await
                });

                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        detach(call.name.clone(), handle);
                        ToolOutcome::Cancelled { reason: CancelReason::Interrupted }
                    }
                    joined = &mut handle => {
                        let result = match joined {
                            Ok(Ok(r)) => r,
                            Ok(Err(_)) => {
                                bridge.mark_unavailable("tool call exceeded its timeout");
                                Err(BridgeError::Timeout(timeout))
                            }
                            Err(e) => Err(BridgeError::Skill(e.to_string())),
                        };
                        self.bridge_outcome(&call.name, result)
                    }
                }
            }
            ResolvedCall::Unknown { name } => self.unknown_tool(&name),
        };

        tracing::info!(
            tool = %call.name,
            state = ?outcome.state(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "tool call finished"
        );
        self.finish(call, outcome)
    }

    fn bridge_outcome(&self, name: &str, result: Result<String, BridgeError>) -> ToolOutcome {
        match result {
            Ok(output) => ToolOutcome::Succeeded { output },
            Err(BridgeError::Timeout(after)) => {
                self.emit(TurnEvent::BridgeUnavailable {
                    reason: format!("timed out after {:?}", after),
                });
                ToolOutcome::TimedOut { after }
            }
            Err(BridgeError::Unavailable(reason)) => {
                self.emit(TurnEvent::BridgeUnavailable {
                    reason: reason.clone(),
                });
                ToolOutcome::failed(
                    FailureReason::BridgeUnavailable,
                    self.phrases.bridge_unavailable(&reason),
                )
            }
            Err(BridgeError::Skill(message)) => ToolOutcome::failed(
                FailureReason::SkillError,
                self.phrases.skill_error(name, &message),
            ),
        }
    }

    fn unknown_tool(&self, name: &str) -> ToolOutcome {
        ToolOutcome::failed(FailureReason::UnknownTool, self.phrases.unknown_tool(name))
    }

    fn advance(&self, call: &mut ToolCall, next: ToolCallState) {
        if let Err(e) = call.transition(next) {
            tracing::error!(tool = %call.name, error = %e, "tool call state out of sync");
        }
    }

    fn finish(&self, call: &mut ToolCall, outcome: ToolOutcome) -> ToolOutcome {
        self.advance(call, outcome.state());
        outcome
    }

    /// Text of the `tool` message recording `outcome`.
    pub fn render(&self, outcome: &ToolOutcome) -> String {
        match outcome {
            ToolOutcome::Succeeded { output } if output.trim().is_empty() => "OK".to_string(),
            ToolOutcome::Succeeded { output } => output.clone(),
            ToolOutcome::Failed { message, .. } => message.clone(),
            ToolOutcome::Cancelled { reason } => match reason {
                CancelReason::Denied | CancelReason::Interrupted => self.phrases.cancelled.clone(),
                CancelReason::Unrecognized => self.phrases.unrecognized.clone(),
                CancelReason::ConfirmationTimeout => self.phrases.confirmation_timeout.clone(),
            },
            ToolOutcome::TimedOut { after } => self.phrases.tool_timeout(after.as_secs()),
        }
    }
}

/// Spoken description of what a resolved call would do.
fn describe_action(resolved: &ResolvedCall, arguments: &Value) -> String {
    match resolved {
        ResolvedCall::Local { tool, .. } => tool.describe_action(arguments),
        ResolvedCall::Mcp { target, .. } => match target {
            McpTarget::Run(skill) => {
                let args: Vec<String> = arguments
                    .get("args")
                    .and_then(|a| a.as_array())
                    .map(|a| {
                        a.iter()
                            .map(|v| v.as_str().map(String::from).unwrap_or_else(|| v.to_string()))
                            .collect()
                    })
                    .unwrap_or_default();
                if args.is_empty() {
                    format!("ejecutar la skill {}", skill)
                } else {
                    format!("ejecutar la skill {} con {}", skill, args.join(" "))
                }
            }
            McpTarget::Help => format!(
                "consultar la ayuda de la skill {}",
                arguments
                    .get("skill_name")
                    .and_then(|n| n.as_str())
                    .unwrap_or("indicada")
            ),
            McpTarget::Refresh => "recargar la lista de skills".to_string(),
        },
        ResolvedCall::Unknown { name } => name.clone(),
    }
}

/// Let an interrupted call finish in the background and drop its result.
fn detach<T: Send + 'static>(name: String, handle: tokio::task::JoinHandle<T>) {
    tokio::spawn(async move {
        let _ = handle.await;
        tracing::info!(tool = %name, "result of interrupted tool call discarded");
    });
}
