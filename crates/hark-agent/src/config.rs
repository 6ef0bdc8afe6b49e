//! Runtime configuration for the turn controller

use std::time::Duration;

use hark_ai::{Model, Provider};
use serde::{Deserialize, Serialize};

use crate::context::ContextConfig;
use crate::error::{Error, Result};

pub const DEFAULT_SYSTEM_PROMPT: &str = "\
Eres un agente de voz que puede usar herramientas para realizar acciones reales. \
Responde en español. Usa herramientas cuando haga falta. \
Si usas herramientas, espera sus resultados antes de continuar. \
Tus respuestas se leen en voz alta: sé breve y no uses formato markdown.";

/// Everything the controller needs besides its collaborators
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub model: Model,
    pub system_prompt: String,
    /// Appended to the system prompt as a second section
    pub project_context: Option<String>,
    pub context: ContextConfig,
    /// Decide→execute iterations allowed per turn
    pub max_tool_iters: u32,
    pub confirmation_timeout: Duration,
    /// Captures shorter than this are ignored
    pub min_capture: Duration,
    pub asr_timeout: Duration,
    pub llm_timeout: Duration,
    pub tts_timeout: Duration,
    pub language: Option<String>,
    pub voice: String,
    pub speed: f32,
    /// Strip markdown, code and URLs before synthesis
    pub simplify_speech: bool,
    /// When a decision is a single skill call that succeeds with output,
    /// speak that output instead of asking the model again
    pub skill_output_as_reply: bool,
    pub phrases: Phrases,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: Model::new(Provider::OpenRouter, "openai/gpt-4o-mini"),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            project_context: None,
            context: ContextConfig::default(),
            max_tool_iters: 8,
            confirmation_timeout: Duration::from_secs(15),
            min_capture: Duration::from_millis(300),
            asr_timeout: Duration::from_secs(60),
            llm_timeout: Duration::from_secs(120),
            tts_timeout: Duration::from_secs(60),
            language: Some("es".to_string()),
            voice: "alloy".to_string(),
            speed: 1.0,
            simplify_speech: true,
            skill_output_as_reply: true,
            phrases: Phrases::default(),
        }
    }
}

impl AgentConfig {
    pub fn validate(&self) -> Result<()> {
        self.context.validate()?;
        if self.max_tool_iters == 0 {
            return Err(Error::Config("max_tool_iters must be at least 1".into()));
        }
        for (name, value) in [
            ("confirmation_timeout", self.confirmation_timeout),
            ("asr_timeout", self.asr_timeout),
            ("llm_timeout", self.llm_timeout),
            ("tts_timeout", self.tts_timeout),
        ] {
            if value.is_zero() {
                return Err(Error::Config(format!("{} must be greater than zero", name)));
            }
        }
        if !(0.25..=4.0).contains(&self.speed) {
            return Err(Error::Config(format!(
                "speech speed {} is outside 0.25..=4.0",
                self.speed
            )));
        }
        Ok(())
    }

    /// System prompt with the project context appended.
    pub fn full_system_prompt(&self) -> String {
        match self.project_context.as_deref().map(str::trim) {
            Some(ctx) if !ctx.is_empty() => {
                format!("{}\n\nContexto del proyecto:\n{}", self.system_prompt, ctx)
            }
            _ => self.system_prompt.clone(),
        }
    }
}

/// User-facing text, spoken or recorded as tool messages
///
/// Templates use `{name}`-style placeholders.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Phrases {
    /// Stem that affirms a confirmation ("confirmar", "confirmo", ...)
    pub affirmative: String,
    /// Stem that denies a confirmation
    pub negative: String,
    pub confirm_prompt: String,
    pub cancelled: String,
    pub unrecognized: String,
    pub confirmation_timeout: String,
    pub unknown_tool: String,
    pub invalid_arguments: String,
    pub tool_error: String,
    pub tool_timeout: String,
    pub bridge_unavailable: String,
    pub skill_error: String,
    pub no_speech: String,
    pub transcription_failed: String,
    pub decision_failed: String,
    pub timeout: String,
    pub saturation: String,
}

impl Default for Phrases {
    fn default() -> Self {
        Self {
            affirmative: "confirm".into(),
            negative: "cancel".into(),
            confirm_prompt: "Voy a realizar la siguiente acción: {action}. \
                Di 'Confirmar' para continuar o 'Cancelar' para abortar."
                .into(),
            cancelled: "Acción cancelada por el usuario.".into(),
            unrecognized: "Acción cancelada: no se reconoció la respuesta.".into(),
            confirmation_timeout: "Acción cancelada: no se recibió confirmación a tiempo.".into(),
            unknown_tool: "Herramienta desconocida: {name}".into(),
            invalid_arguments: "Argumentos inválidos para {name}: {error}".into(),
            tool_error: "Error al ejecutar {name}: {error}".into(),
            tool_timeout: "La herramienta no respondió en {secs} segundos y se abandonó.".into(),
            bridge_unavailable: "El puente de skills no está disponible: {error}".into(),
            skill_error: "La skill {name} falló: {error}".into(),
            no_speech: "No escuché nada. Inténtalo de nuevo.".into(),
            transcription_failed: "No pude transcribir el audio.".into(),
            decision_failed: "No pude obtener una respuesta del modelo.".into(),
            timeout: "La operación tardó demasiado.".into(),
            saturation: "He alcanzado el límite de acciones para esta petición. \
                Dime si quieres que continúe."
                .into(),
        }
    }
}

fn fill(template: &str, vars: &[(&str, &str)]) -> String {
    vars.iter().fold(template.to_string(), |acc, (key, value)| {
        acc.replace(&format!("{{{}}}", key), value)
    })
}

impl Phrases {
    pub fn confirm_prompt(&self, action: &str) -> String {
        fill(&self.confirm_prompt, &[("action", action)])
    }

    pub fn unknown_tool(&self, name: &str) -> String {
        fill(&self.unknown_tool, &[("name", name)])
    }

    pub fn invalid_arguments(&self, name: &str, error: &str) -> String {
        fill(&self.invalid_arguments, &[("name", name), ("error", error)])
    }

    pub fn tool_error(&self, name: &str, error: &str) -> String {
        fill(&self.tool_error, &[("name", name), ("error", error)])
    }

    pub fn tool_timeout(&self, secs: u64) -> String {
        fill(&self.tool_timeout, &[("secs", &secs.max(1).to_string())])
    }

    pub fn bridge_unavailable(&self, error: &str) -> String {
        fill(&self.bridge_unavailable, &[("error", error)])
    }

    pub fn skill_error(&self, name: &str, error: &str) -> String {
        fill(&self.skill_error, &[("name", name), ("error", error)])
    }
}
