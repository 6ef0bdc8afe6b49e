//! Skill bridge wire format
//!
//! One JSON object per line in each direction:
//! `{"id": 7, "method": "run_skill", "args": {...}}` answered by
//! `{"id": 7, "result": ...}` or `{"id": 7, "error": ...}`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeMethod {
    ListSkills,
    GetSkillHelp,
    RunSkill,
    RefreshSkills,
}

#[derive(Debug, Clone, Serialize)]
pub struct BridgeRequest {
    pub id: u64,
    pub method: BridgeMethod,
    pub args: Value,
}

impl BridgeRequest {
    /// Serialize as a newline-terminated line.
    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BridgeResponse {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
}

/// Entry of a `list_skills` result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkillSummary {
    pub name: String,
    #[serde(default, alias = "description")]
    pub summary: String,
}

/// Result of `run_skill`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOutput {
    pub success: bool,
    #[serde(default)]
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Decode a result payload. Bridges may send structured results as a JSON
/// encoded string, so a string is first tried as JSON and then as itself.
pub fn decode_result<T: DeserializeOwned>(value: Value) -> Result<T, serde_json::Error> {
    match value {
        Value::String(s) => match serde_json::from_str::<T>(&s) {
            Ok(v) => Ok(v),
            Err(_) => serde_json::from_value(Value::String(s)),
        },
        other => serde_json::from_value(other),
    }
}

/// Render an `error` payload as text.
pub fn error_text(error: &Value) -> String {
    match error {
        Value::String(s) => s.clone(),
        Value::Object(map) => map
            .get("message")
            .and_then(|m| m.as_str())
            .map(String::from)
            .unwrap_or_else(|| error.to_string()),
        other => other.to_string(),
    }
}
