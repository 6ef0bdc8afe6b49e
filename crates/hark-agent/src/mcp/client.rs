//! Skill bridge client

use parking_lot::RwLock;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use super::protocol::{
    BridgeMethod, BridgeRequest, BridgeResponse, RunOutput, SkillSummary, decode_result,
    error_text,
};
use super::{BridgeError, BridgeTransport};
use crate::tool::{ToolDescriptor, ToolKind};

/// Tool that reads a skill's help text
pub const HELP_TOOL_NAME: &str = "mcp_skill_help";
/// Tool that asks the bridge to rescan its skills
pub const REFRESH_TOOL_NAME: &str = "mcp_refresh_skills";

const SKILL_PREFIX: &str = "skill_";
const MAX_TOOL_NAME_LEN: usize = 64;

/// What an MCP descriptor dispatches to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum McpTarget {
    /// `run_skill` with the skill's bridge name
    Run(String),
    Help,
    Refresh,
}

/// A descriptor paired with its bridge target
#[derive(Debug, Clone, PartialEq)]
pub struct McpTool {
    pub descriptor: ToolDescriptor,
    pub target: McpTarget,
}

/// Client for the skill bridge
///
/// The descriptor set is replaced wholesale by `refresh()`; readers take an
/// `Arc` snapshot and are never affected by a later swap.
pub struct SkillBridgeClient {
    transport: Arc<dyn BridgeTransport>,
    timeout: Duration,
    next_id: AtomicU64,
    tools: RwLock<Arc<Vec<McpTool>>>,
    available: AtomicBool,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl SkillBridgeClient {
    pub fn new(transport: Arc<dyn BridgeTransport>, timeout: Duration) -> Self {
        Self {
            transport,
            timeout,
            next_id: AtomicU64::new(1),
            tools: RwLock::new(Arc::new(Vec::new())),
            available: AtomicBool::new(false),
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether the last refresh succeeded and no call has failed since.
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    /// Current MCP tools. Empty while the bridge is unavailable.
    pub fn tools(&self) -> Arc<Vec<McpTool>> {
        if self.is_available() {
            self.tools.read().clone()
        } else {
            Arc::new(Vec::new())
        }
    }

    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.tools().iter().map(|t| t.descriptor.clone()).collect()
    }

    pub async fn list_skills(&self) -> Result<Vec<SkillSummary>, BridgeError> {
        let result = self.call(BridgeMethod::ListSkills, json!({})).await?;
        decode_result(result)
            .map_err(|e| BridgeError::Skill(format!("malformed skill list: {}", e)))
    }

    pub async fn get_help(&self, name: &str) -> Result<String, BridgeError> {
        let result = self
            .call(BridgeMethod::GetSkillHelp, json!({ "name": name }))
            .await?;
        match result {
            Value::String(s) => Ok(s),
            Value::Object(ref map) => Ok(map
                .get("help")
                .and_then(|h| h.as_str())
                .map(String::from)
                .unwrap_or_else(|| result.to_string())),
            other => Ok(other.to_string()),
        }
    }

    pub async fn run_skill(&self, name: &str, args: &[String]) -> Result<RunOutput, BridgeError> {
        let result = self
            .call(BridgeMethod::RunSkill, json!({ "name": name, "args": args }))
            .await?;
        decode_result(result)
            .map_err(|e| BridgeError::Skill(format!("malformed run result: {}", e)))
    }

    /// Ask the bridge to rescan and swap in the new descriptor set.
    /// Returns the number of skills exposed.
    pub async fn refresh(&self) -> Result<usize, BridgeError> {
        let _guard = self.refresh_lock.lock().await;

        self.call(BridgeMethod::RefreshSkills, json!({})).await?;
        let skills = self.list_skills().await?;
        let tools = build_tools(&skills, self.timeout);
        let count = tools
            .iter()
            .filter(|t| matches!(t.target, McpTarget::Run(_)))
            .count();

        *self.tools.write() = Arc::new(tools);
        self.available.store(true, Ordering::Release);
        tracing::info!(skills = count, "skill bridge refreshed");
        Ok(count)
    }

    /// Dispatch a call for one of this client's descriptors.
    pub async fn invoke(&self, target: &McpTarget, arguments: &Value) -> Result<String, BridgeError> {
        match target {
            McpTarget::Run(skill) => {
                let args = skill_args(arguments);
                let output = self.run_skill(skill, &args).await?;
                if output.success {
                    Ok(output.output)
                } else {
                    Err(BridgeError::Skill(
                        output
                            .error
                            .filter(|e| !e.is_empty())
                            .unwrap_or(output.output),
                    ))
                }
            }
            McpTarget::Help => {
                let name = arguments
                    .get("skill_name")
                    .and_then(|n| n.as_str())
                    .ok_or_else(|| BridgeError::Skill("skill_name is required".into()))?;
                self.get_help(name).await
            }
            McpTarget::Refresh => {
                let count = self.refresh().await?;
                Ok(format!("{} skills disponibles", count))
            }
        }
    }

    /// Hide MCP tools until the next successful refresh.
    pub fn mark_unavailable(&self, reason: &str) {
        if self.available.swap(false, Ordering::AcqRel) {
            tracing::warn!(reason, "skill bridge marked unavailable");
        }
    }

    async fn call(&self, method: BridgeMethod, args: Value) -> Result<Value, BridgeError> {
        let request = BridgeRequest {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            args,
        };
        tracing::debug!(id = request.id, ?method, "bridge request");

        let line = match tokio::time::timeout(self.timeout, self.transport.exchange(&request)).await
        {
            Ok(Ok(line)) => line,
            Ok(Err(e)) => {
                let err = BridgeError::Unavailable(e.to_string());
                self.mark_unavailable(&err.to_string());
                self.transport.reset().await;
                return Err(err);
            }
            Err(_) => {
                let err = BridgeError::Timeout(self.timeout);
                self.mark_unavailable(&err.to_string());
                self.transport.reset().await;
                return Err(err);
            }
        };

        let response: BridgeResponse = serde_json::from_str(&line)
            .map_err(|e| BridgeError::Skill(format!("malformed bridge response: {}", e)))?;
        if let Some(error) = response.error {
            return Err(BridgeError::Skill(error_text(&error)));
        }
        response
            .result
            .ok_or_else(|| BridgeError::Skill("bridge response without result".into()))
    }
}

fn skill_args(arguments: &Value) -> Vec<String> {
    match arguments.get("args") {
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect(),
        Some(Value::String(s)) => vec![s.clone()],
        _ => Vec::new(),
    }
}

/// Model-safe tool name for a skill.
fn tool_name_for(skill: &str) -> String {
    let sanitized: String = skill
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    let mut name = format!("{}{}", SKILL_PREFIX, sanitized);
    name.truncate(MAX_TOOL_NAME_LEN);
    name
}

fn build_tools(skills: &[SkillSummary], timeout: Duration) -> Vec<McpTool> {
    let mut tools: Vec<McpTool> = Vec::new();

    for skill in skills {
        if skill.name.trim().is_empty() {
            continue;
        }
        let name = tool_name_for(&skill.name);
        if tools.iter().any(|t| t.descriptor.name == name) {
            tracing::debug!(skill = %skill.name, "duplicate skill name ignored");
            continue;
        }
        let help = if skill.summary.trim().is_empty() {
            format!("Skill: {}", skill.name)
        } else {
            skill.summary.trim().to_string()
        };
        tools.push(McpTool {
            descriptor: ToolDescriptor {
                name,
                kind: ToolKind::McpSkill,
                schema: json!({
                    "type": "object",
                    "properties": {
                        "args": {
                            "type": "array",
                            "items": { "type": "string" },
                            "description": "Command-line arguments for the skill"
                        }
                    }
                }),
                help,
                timeout,
            },
            target: McpTarget::Run(skill.name.clone()),
        });
    }

    tools.push(McpTool {
        descriptor: ToolDescriptor {
            name: HELP_TOOL_NAME.to_string(),
            kind: ToolKind::McpSkill,
            schema: json!({
                "type": "object",
                "properties": {
                    "skill_name": { "type": "string", "description": "Skill to describe" }
                },
                "required": ["skill_name"]
            }),
            help: "Show the usage help of an MCP skill".to_string(),
            timeout,
        },
        target: McpTarget::Help,
    });
    tools.push(McpTool {
        descriptor: ToolDescriptor {
            name: REFRESH_TOOL_NAME.to_string(),
            kind: ToolKind::McpSkill,
            schema: json!({ "type": "object", "properties": {} }),
            help: "Reload the list of MCP skills".to_string(),
            timeout,
        },
        target: McpTarget::Refresh,
    });

    tools.sort_by(|a, b| a.descriptor.name.cmp(&b.descriptor.name));
    tools
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{BridgeMode, FakeBridge};

    fn skills() -> Vec<Value> {
        vec![
            json!({"name": "pdf-merge", "description": "Merge PDFs"}),
            json!({"name": "Region Capture", "summary": "Capture a region"}),
            json!({"name": "pdf-merge", "description": "duplicate"}),
        ]
    }

    fn client(bridge: Arc<FakeBridge>, timeout: Duration) -> SkillBridgeClient {
        SkillBridgeClient::new(bridge, timeout)
    }

    #[tokio::test]
    async fn test_refresh_builds_sorted_unique_descriptors() {
        let client = client(FakeBridge::new(skills()), Duration::from_secs(1));
        assert!(client.descriptors().is_empty());

        let count = client.refresh().await.unwrap();
        assert_eq!(count, 2);

        let names: Vec<String> = client.descriptors().into_iter().map(|d| d.name).collect();
        assert_eq!(
            names,
            vec![
                "mcp_refresh_skills",
                "mcp_skill_help",
                "skill_pdf-merge",
                "skill_region_capture"
            ]
        );
        assert!(client.is_available());
    }

    #[tokio::test]
    async fn test_refresh_is_idempotent() {
        let client = client(FakeBridge::new(skills()), Duration::from_secs(1));
        client.refresh().await.unwrap();
        let first = client.descriptors();
        client.refresh().await.unwrap();
        assert_eq!(client.descriptors(), first);
    }

    #[tokio::test]
    async fn test_snapshot_survives_refresh() {
        let bridge = FakeBridge::new(skills());
        let client = client(bridge.clone(), Duration::from_secs(1));
        client.refresh().await.unwrap();
        let snapshot = client.tools();

        bridge.set_skills(&[]);
        client.refresh().await.unwrap();

        assert_eq!(snapshot.len(), 4);
        assert_eq!(client.tools().len(), 2);
    }

    #[tokio::test]
    async fn test_timeout_marks_unavailable() {
        let bridge = FakeBridge::new(skills());
        let client = client(bridge.clone(), Duration::from_millis(20));
        client.refresh().await.unwrap();

        bridge.set_mode(BridgeMode::Hang);
        let err = client
            .invoke(&McpTarget::Run("pdf-merge".into()), &json!({}))
            .await
            .unwrap_err();
        assert_eq!(err, BridgeError::Timeout(Duration::from_millis(20)));
        assert!(err.is_unavailable());
        assert!(client.descriptors().is_empty());

        bridge.set_mode(BridgeMode::Normal);
        client.refresh().await.unwrap();
        assert_eq!(client.descriptors().len(), 4);
    }

    #[tokio::test]
    async fn test_transport_failure_is_unavailable() {
        let bridge = FakeBridge::new(skills());
        bridge.set_mode(BridgeMode::Broken);
        let client = client(bridge, Duration::from_secs(1));
        let err = client.list_skills().await.unwrap_err();
        assert!(matches!(err, BridgeError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_malformed_response_is_skill_error() {
        let bridge = FakeBridge::new(skills());
        let client = client(bridge.clone(), Duration::from_secs(1));
        client.refresh().await.unwrap();

        bridge.set_mode(BridgeMode::Garbage);
        let err = client.get_help("pdf-merge").await.unwrap_err();
        assert!(matches!(err, BridgeError::Skill(_)));
        assert!(client.is_available());
    }

    #[tokio::test]
    async fn test_run_skill_reports_failure() {
        let client = client(FakeBridge::new(skills()), Duration::from_secs(1));
        let out = client
            .invoke(&McpTarget::Run("pdf-merge".into()), &json!({"args": ["a.pdf", "b.pdf"]}))
            .await
            .unwrap();
        assert!(out.contains("a.pdf"));

        let err = client
            .invoke(&McpTarget::Run("broken".into()), &json!({}))
            .await
            .unwrap_err();
        assert_eq!(err, BridgeError::Skill("exit 2".into()));
    }

    #[tokio::test]
    async fn test_help_requires_skill_name() {
        let bridge = FakeBridge::new(skills());
        let client = client(bridge.clone(), Duration::from_secs(1));
        assert!(client.invoke(&McpTarget::Help, &json!({})).await.is_err());
        assert!(bridge.requests().is_empty());
    }

    #[test]
    fn test_tool_name_sanitized() {
        assert_eq!(tool_name_for("Region Capture"), "skill_region_capture");
        assert!(tool_name_for(&"x".repeat(100)).len() <= MAX_TOOL_NAME_LEN);
    }
}
