//! hark - push-to-talk voice agent

mod audio;
mod config;
mod ptt;
mod speech;
mod tools;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use hark_agent::events::TurnEvent;
use hark_agent::tool::ToolCallState;
use hark_agent::{
    AudioCoordinator, Collaborators, PttHandle, SkillBridgeClient, StdioTransport,
    ToolRegistry, Transport, TransportSummarizer, TurnController, TurnState, TurnStatus,
    VoiceConfirmer,
};
use hark_ai::providers::openai::ChatCompletionsProvider;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

use crate::audio::{CpalInput, CpalOutput};
use crate::config::Config;
use crate::ptt::TerminalPtt;
use crate::speech::OpenAiSpeech;
use crate::tools::Sandbox;

/// hark - talk to an agent that asks before it acts
#[derive(Parser, Debug)]
#[command(name = "hark")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file (default: ~/.config/hark/config.toml or $HARK_CONFIG_PATH)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Chat model, overriding the config file and OPENROUTER_MODEL
    #[arg(short, long)]
    model: Option<String>,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Write an example config file and exit
    #[arg(long)]
    init_config: bool,

    /// Run without the skill bridge
    #[arg(long)]
    no_mcp: bool,

    /// Directory the local tools may touch (default: current directory)
    #[arg(long)]
    project_root: Option<PathBuf>,
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "hark=debug,hark_agent=debug,hark_ai=debug"
    } else {
        "hark=info,hark_agent=info,hark_ai=warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let config_path = Config::config_path(args.config.as_deref());
    if args.init_config {
        if Config::init(&config_path).context("failed to write config file")? {
            println!("Config file created at: {}", config_path.display());
        } else {
            println!("Config file already exists at: {}", config_path.display());
        }
        return Ok(());
    }

    let mut cfg = Config::load(&config_path)?;
    cfg.apply_env()?;
    if let Some(model) = args.model {
        cfg.model = model;
    }
    if let Some(root) = args.project_root {
        cfg.project_root = Some(root);
    }
    if args.no_mcp {
        cfg.bridge.command = None;
    }

    run(cfg).await
}

async fn run(cfg: Config) -> Result<()> {
    let agent_config = cfg.agent_config()?;
    let provider = cfg.provider()?;
    let chat_key = cfg.chat_api_key().ok_or_else(|| {
        anyhow!(
            "no API key for {}; set {} or [api_keys] in the config file",
            provider.name(),
            provider.api_key_env_var().unwrap_or("OPENAI_API_KEY")
        )
    })?;
    let speech_key = cfg
        .speech_api_key()
        .ok_or_else(|| anyhow!("speech needs an OpenAI key; set OPENAI_API_KEY"))?;

    let transport: Arc<dyn Transport> = Arc::new(hark_agent::ProviderTransport::new(Arc::new(
        ChatCompletionsProvider::new(chat_key),
    )));
    let speech = Arc::new(
        OpenAiSpeech::new(speech_key, cfg.speech.base_url.clone()).with_models(
            cfg.speech.transcription_model.clone(),
            cfg.speech.synthesis_model.clone(),
        ),
    );

    let registry = Arc::new(build_registry(&cfg)?);

    let input = CpalInput::new(cfg.audio.input_device.clone());
    let output = CpalOutput::new(cfg.audio.output_device.clone());
    let input_name = input.probe().context("microphone unavailable")?;
    let output_name = output.probe().context("speaker unavailable")?;
    tracing::info!(input = %input_name, output = %output_name, "audio devices ready");
    let audio = AudioCoordinator::new(Arc::new(input), Arc::new(output));

    let confirmer = VoiceConfirmer::new(audio.clone(), speech.clone(), speech.clone())
        .with_listen_window(cfg.confirmation_listen())
        .with_language(agent_config.language.clone())
        .with_voice(agent_config.voice.clone(), agent_config.speed);
    let summarizer = TransportSummarizer::new(transport.clone(), agent_config.model.clone());

    let key = ptt::parse_key(&cfg.ptt_key)?;
    let ptt = PttHandle::new();
    let mut controller = TurnController::new(
        agent_config,
        ptt.clone(),
        Collaborators {
            transport,
            transcriber: speech.clone(),
            synthesizer: speech,
            audio,
            registry,
            confirmer: Arc::new(confirmer),
            summarizer: Arc::new(summarizer),
        },
    )?;
    let handle = controller.handle();

    let printer = tokio::spawn(print_events(handle.subscribe()));
    let listener = TerminalPtt::start(key, ptt, handle.clone())?;
    let hint = if listener.is_hold_to_talk() {
        format!("Mantén '{}' pulsada para hablar", cfg.ptt_key)
    } else {
        format!("Pulsa '{}' para empezar y otra vez para terminar", cfg.ptt_key)
    };
    say(&format!("hark listo ({}). {}. Esc para salir.", cfg.model, hint));

    let signal_handle = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_handle.shutdown();
        }
    });

    controller.run().await;
    listener.stop();
    printer.abort();
    tracing::info!("bye");
    Ok(())
}

fn build_registry(cfg: &Config) -> Result<ToolRegistry> {
    let root = match cfg.project_root {
        Some(ref root) => root.clone(),
        None => std::env::current_dir().context("cannot read the current directory")?,
    };
    let sandbox = Arc::new(
        Sandbox::new(&root)
            .with_context(|| format!("invalid project root {}", root.display()))?,
    );
    tracing::info!(root = %sandbox.root().display(), allow_shell = cfg.allow_shell, "local tools confined");

    let mut registry = ToolRegistry::new();
    for tool in tools::local_tools(sandbox, cfg.allow_shell) {
        registry.register(tool);
    }

    if let Some(ref command) = cfg.bridge.command {
        let mut bridge = StdioTransport::new(command.clone(), cfg.bridge.args.clone());
        for (key, value) in &cfg.bridge.env {
            bridge = bridge.with_env(key.clone(), value.clone());
        }
        let client = SkillBridgeClient::new(Arc::new(bridge), cfg.mcp_timeout());
        registry = registry.with_bridge(Arc::new(client));
    } else {
        tracing::info!("no skill bridge configured");
    }
    Ok(registry)
}

/// Print a line in raw mode.
fn say(line: &str) {
    let mut out = std::io::stdout().lock();
    let _ = write!(out, "{}\r\n", line.replace('\n', "\r\n"));
    let _ = out.flush();
}

async fn print_events(mut events: broadcast::Receiver<TurnEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => {
                if let Some(line) = render_event(&event) {
                    say(&line);
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!(skipped = n, "event printer lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn state_label(state: TurnState) -> &'static str {
    match state {
        TurnState::Idle => "en espera",
        TurnState::Listening => "escuchando",
        TurnState::Transcribing => "transcribiendo",
        TurnState::Deciding => "pensando",
        TurnState::Confirming => "confirmando",
        TurnState::Executing => "ejecutando",
        TurnState::Responding => "respondiendo",
        TurnState::Speaking => "hablando",
        TurnState::Interrupted => "interrumpido",
        TurnState::Failed => "fallo",
    }
}

/// One terminal line per user-relevant event.
fn render_event(event: &TurnEvent) -> Option<String> {
    match event {
        TurnEvent::StateChanged { to, .. } => match to {
            TurnState::Listening | TurnState::Deciding | TurnState::Speaking => {
                Some(format!("· {}", state_label(*to)))
            }
            _ => None,
        },
        TurnEvent::Transcript { text, .. } => Some(format!("tú: {}", text)),
        TurnEvent::ToolProposed {
            tool_name,
            arguments,
            ..
        } => Some(format!("→ {} {}", tool_name, arguments)),
        TurnEvent::ConfirmationRequested { prompt, .. } => Some(format!("? {}", prompt)),
        TurnEvent::ToolResolved {
            tool_name,
            state,
            summary,
            ..
        } => {
            let mark = match state {
                ToolCallState::Succeeded => "✓",
                ToolCallState::Cancelled => "✗",
                _ => "!",
            };
            Some(format!("{} {}: {}", mark, tool_name, summary))
        }
        TurnEvent::Response { text, .. } => Some(format!("hark: {}", text)),
        TurnEvent::ConfigurationError { message } => Some(format!("error de configuración: {}", message)),
        TurnEvent::BridgeUnavailable { reason } => Some(format!("skills no disponibles: {}", reason)),
        TurnEvent::SkillsRefreshed { count } => Some(format!("{} skills disponibles", count)),
        TurnEvent::TurnEnd {
            status: TurnStatus::Failed,
            failure,
            ..
        } => Some(format!(
            "turno fallido: {}",
            failure.as_deref().unwrap_or("desconocido")
        )),
        TurnEvent::TurnEnd {
            status: TurnStatus::Interrupted,
            ..
        } => Some("· interrumpido".to_string()),
        TurnEvent::TurnStart { .. }
        | TurnEvent::ToolExecutionStart { .. }
        | TurnEvent::CompactionEnd { .. }
        | TurnEvent::TurnEnd { .. } => None,
    }
}
