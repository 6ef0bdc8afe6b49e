//! Terminal push-to-talk source
//!
//! With the kitty keyboard protocol the terminal reports key releases, so
//! the configured key works as hold-to-talk. Terminals without it only
//! report presses; there each press toggles between talking and idle.

use anyhow::{Result, bail};
use crossterm::event::{
    self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers, KeyboardEnhancementFlags,
    PopKeyboardEnhancementFlags, PushKeyboardEnhancementFlags,
};
use crossterm::{execute, terminal};
use hark_agent::{PttHandle, TurnHandle};
use std::io::stdout;
use std::thread::JoinHandle;
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Parse a key name such as `space`, `enter`, `f9` or `k`.
pub fn parse_key(name: &str) -> Result<KeyCode> {
    let lower = name.trim().to_lowercase();
    let code = match lower.as_str() {
        "space" => KeyCode::Char(' '),
        "enter" | "return" => KeyCode::Enter,
        "tab" => KeyCode::Tab,
        "backspace" => KeyCode::Backspace,
        "insert" => KeyCode::Insert,
        "home" => KeyCode::Home,
        "end" => KeyCode::End,
        "pageup" => KeyCode::PageUp,
        "pagedown" => KeyCode::PageDown,
        s if s.len() > 1 && s.starts_with('f') => match s[1..].parse::<u8>() {
            Ok(n) if (1..=12).contains(&n) => KeyCode::F(n),
            _ => bail!("unknown PTT key {:?}", name),
        },
        s => {
            let mut chars = s.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => KeyCode::Char(c),
                _ => bail!("unknown PTT key {:?}", name),
            }
        }
    };
    Ok(code)
}

/// What a key event means to the PTT source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAction {
    Press,
    Release,
    Quit,
    Ignore,
}

/// Maps key events onto PTT transitions
#[derive(Debug, Clone)]
pub struct KeyMapper {
    key: KeyCode,
    hold: bool,
    toggled_on: bool,
}

impl KeyMapper {
    /// `hold` is true when the terminal reports releases.
    pub fn new(key: KeyCode, hold: bool) -> Self {
        Self {
            key,
            hold,
            toggled_on: false,
        }
    }

    pub fn is_hold(&self) -> bool {
        self.hold
    }

    pub fn map(&mut self, event: &KeyEvent) -> KeyAction {
        let quit = event.code == KeyCode::Esc
            || (event.modifiers.contains(KeyModifiers::CONTROL)
                && matches!(event.code, KeyCode::Char('c') | KeyCode::Char('d')));
        if quit && event.kind == KeyEventKind::Press {
            return KeyAction::Quit;
        }
        if !key_matches(self.key, event.code) {
            return KeyAction::Ignore;
        }

        match (self.hold, event.kind) {
            (true, KeyEventKind::Press) => KeyAction::Press,
            (true, KeyEventKind::Release) => KeyAction::Release,
            (true, KeyEventKind::Repeat) => KeyAction::Ignore,
            (false, KeyEventKind::Press) => {
                self.toggled_on = !self.toggled_on;
                if self.toggled_on {
                    KeyAction::Press
                } else {
                    KeyAction::Release
                }
            }
            (false, _) => KeyAction::Ignore,
        }
    }
}

fn key_matches(expected: KeyCode, actual: KeyCode) -> bool {
    match (expected, actual) {
        (KeyCode::Char(a), KeyCode::Char(b)) => a.eq_ignore_ascii_case(&b),
        (a, b) => a == b,
    }
}

/// Raw-mode keyboard listener feeding a [`PttHandle`]
pub struct TerminalPtt {
    thread: Option<JoinHandle<()>>,
    enhanced: bool,
}

impl TerminalPtt {
    /// Enter raw mode and start listening on a dedicated thread.
    ///
    /// Esc and Ctrl-C shut the controller down through `turn`.
    pub fn start(key: KeyCode, ptt: PttHandle, turn: TurnHandle) -> Result<Self> {
        terminal::enable_raw_mode()?;
        let enhanced = matches!(terminal::supports_keyboard_enhancement(), Ok(true));
        if enhanced {
            execute!(
                stdout(),
                PushKeyboardEnhancementFlags(KeyboardEnhancementFlags::REPORT_EVENT_TYPES)
            )?;
        }
        let mut mapper = KeyMapper::new(key, enhanced);
        tracing::info!(hold = mapper.is_hold(), "push-to-talk listener started");

        let thread = std::thread::Builder::new()
            .name("hark-ptt".into())
            .spawn(move || {
                while !turn.is_shutdown() {
                    match event::poll(POLL_INTERVAL) {
                        Ok(true) => {}
                        Ok(false) => continue,
                        Err(e) => {
                            tracing::error!(error = %e, "terminal poll failed");
                            break;
                        }
                    }
                    let key = match event::read() {
                        Ok(Event::Key(key)) => key,
                        Ok(_) => continue,
                        Err(e) => {
                            tracing::error!(error = %e, "terminal read failed");
                            break;
                        }
                    };
                    match mapper.map(&key) {
                        KeyAction::Press => {
                            ptt.press();
                        }
                        KeyAction::Release => {
                            ptt.release();
                        }
                        KeyAction::Quit => {
                            turn.shutdown();
                            break;
                        }
                        KeyAction::Ignore => {}
                    }
                }
            })?;

        Ok(Self {
            thread: Some(thread),
            enhanced,
        })
    }

    pub fn is_hold_to_talk(&self) -> bool {
        self.enhanced
    }

    /// Wait for the listener to exit and restore the terminal.
    pub fn stop(mut self) {
        self.restore();
    }

    fn restore(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        if self.enhanced {
            let _ = execute!(stdout(), PopKeyboardEnhancementFlags);
        }
        let _ = terminal::disable_raw_mode();
    }
}

impl Drop for TerminalPtt {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.restore();
        }
    }
}
