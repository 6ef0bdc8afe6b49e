//! Tool registry: one view over local tools and MCP skills

use std::collections::HashMap;
use std::sync::Arc;

use crate::mcp::{McpTarget, SkillBridgeClient};
use crate::tool::{BoxedTool, ToolDescriptor};

/// A tool name resolved against a descriptor snapshot
#[derive(Clone)]
pub enum ResolvedCall {
    Local {
        descriptor: ToolDescriptor,
        tool: BoxedTool,
    },
    Mcp {
        descriptor: ToolDescriptor,
        target: McpTarget,
        bridge: Arc<SkillBridgeClient>,
    },
    Unknown {
        name: String,
    },
}

impl ResolvedCall {
    pub fn descriptor(&self) -> Option<&ToolDescriptor> {
        match self {
            ResolvedCall::Local { descriptor, .. } | ResolvedCall::Mcp { descriptor, .. } => {
                Some(descriptor)
            }
            ResolvedCall::Unknown { .. } => None,
        }
    }
}

impl std::fmt::Debug for ResolvedCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolvedCall::Local { descriptor, .. } => {
                f.debug_tuple("Local").field(&descriptor.name).finish()
            }
            ResolvedCall::Mcp { descriptor, target, .. } => f
                .debug_tuple("Mcp")
                .field(&descriptor.name)
                .field(target)
                .finish(),
            ResolvedCall::Unknown { name } => f.debug_tuple("Unknown").field(name).finish(),
        }
    }
}

/// Registered local tools plus the optional skill bridge
///
/// Local tools are fixed at construction. MCP descriptors come from the
/// bridge client and change only when it refreshes.
#[derive(Default)]
pub struct ToolRegistry {
    locals: Vec<(ToolDescriptor, BoxedTool)>,
    validators: HashMap<String, Arc<jsonschema::Validator>>,
    bridge: Option<Arc<SkillBridgeClient>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a local tool, replacing any tool with the same name.
    pub fn register(&mut self, tool: BoxedTool) {
        let descriptor = ToolDescriptor::for_local(tool.as_ref());
        match jsonschema::validator_for(&descriptor.schema) {
            Ok(validator) => {
                self.validators
                    .insert(descriptor.name.clone(), Arc::new(validator));
            }
            Err(e) => {
                tracing::warn!(
                    "Invalid tool parameter schema for '{}', skipping validation: {}",
                    descriptor.name,
                    e
                );
                self.validators.remove(&descriptor.name);
            }
        }
        if let Some(slot) = self
            .locals
            .iter_mut()
            .find(|(d, _)| d.name == descriptor.name)
        {
            tracing::warn!(tool = %descriptor.name, "local tool registered twice; keeping the last");
            *slot = (descriptor, tool);
        } else {
            self.locals.push((descriptor, tool));
        }
    }

    pub fn with_tool(mut self, tool: BoxedTool) -> Self {
        self.register(tool);
        self
    }

    pub fn with_bridge(mut self, bridge: Arc<SkillBridgeClient>) -> Self {
        self.bridge = Some(bridge);
        self
    }

    pub fn bridge(&self) -> Option<&Arc<SkillBridgeClient>> {
        self.bridge.as_ref()
    }

    fn is_local(&self, name: &str) -> bool {
        self.locals.iter().any(|(d, _)| d.name == name)
    }

    /// Local tools in registration order, then MCP tools sorted by name.
    /// MCP tools are absent while the bridge is unavailable.
    pub fn list_descriptors(&self) -> Vec<ToolDescriptor> {
        let mut out: Vec<ToolDescriptor> = self.locals.iter().map(|(d, _)| d.clone()).collect();
        if let Some(bridge) = &self.bridge {
            out.extend(
                bridge
                    .descriptors()
                    .into_iter()
                    .filter(|d| !self.is_local(&d.name)),
            );
        }
        out
    }

    /// Descriptors serialized for the model.
    pub fn api_tools(&self) -> Vec<hark_ai::Tool> {
        self.list_descriptors()
            .iter()
            .map(ToolDescriptor::to_api_tool)
            .collect()
    }

    /// Resolve `name` against the current descriptor set.
    pub fn resolve(&self, name: &str) -> ResolvedCall {
        if let Some((descriptor, tool)) = self.locals.iter().find(|(d, _)| d.name == name) {
            return ResolvedCall::Local {
                descriptor: descriptor.clone(),
                tool: tool.clone(),
            };
        }
        if let Some(bridge) = &self.bridge {
            if let Some(mcp) = bridge.tools().iter().find(|t| t.descriptor.name == name) {
                return ResolvedCall::Mcp {
                    descriptor: mcp.descriptor.clone(),
                    target: mcp.target.clone(),
                    bridge: bridge.clone(),
                };
            }
        }
        ResolvedCall::Unknown {
            name: name.to_string(),
        }
    }

    /// Check `arguments` against the descriptor's schema.
    pub fn validate_arguments(
        &self,
        descriptor: &ToolDescriptor,
        arguments: &serde_json::Value,
    ) -> Result<(), String> {
        if !arguments.is_object() {
            return Err("arguments must be a JSON object".to_string());
        }
        let compiled;
        let validator = match self.validators.get(&descriptor.name) {
            Some(v) => v.as_ref(),
            None => match jsonschema::validator_for(&descriptor.schema) {
                Ok(v) => {
                    compiled = v;
                    &compiled
                }
                Err(_) => return Ok(()),
            },
        };

        let errors: Vec<String> = validator
            .iter_errors(arguments)
            .map(|e| {
                let path = e.instance_path.to_string();
                if path.is_empty() {
                    e.to_string()
                } else {
                    format!("{}: {}", path, e)
                }
            })
            .collect();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(format!(
                "Tool argument validation failed:\n{}",
                errors.join("\n")
            ))
        }
    }
}
