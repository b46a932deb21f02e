//! Keyboard surface.
//!
//! Single-key shortcuts map onto the same `Command`s the HTTP API sends.  The
//! import prompt is a text input: while it is open, keys edit the prompt and
//! no shortcut fires.

use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use std::io::IsTerminal;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use wall_proto::layout::LayoutMode;
use wall_proto::protocol::{ChannelDescriptor, Command, ProtocolMode};
use wall_proto::registry;

use crate::core::GridEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputMode {
    #[default]
    Normal,
    /// Typing a file path or URL to import from.
    Import,
}

#[derive(Debug, Clone, PartialEq)]
pub enum KeyAction {
    Command(Command),
    OpenImport,
    /// Import from the typed path or URL.
    Import(String),
    CancelImport,
    Quit,
}

/// Key → action mapping plus the import prompt buffer.
#[derive(Debug)]
pub struct KeyInput {
    mode: InputMode,
    buffer: String,
    export_path: PathBuf,
}

impl KeyInput {
    pub fn new(export_path: PathBuf) -> Self {
        Self {
            mode: InputMode::Normal,
            buffer: String::new(),
            export_path,
        }
    }

    pub fn mode(&self) -> InputMode {
        self.mode
    }

    pub fn handle_key(&mut self, key: KeyEvent) -> Vec<KeyAction> {
        if key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL) {
            return vec![KeyAction::Quit];
        }

        if self.mode == InputMode::Import {
            return match key.code {
                KeyCode::Enter => {
                    self.mode = InputMode::Normal;
                    let source = std::mem::take(&mut self.buffer).trim().to_string();
                    if source.is_empty() {
                        vec![KeyAction::CancelImport]
                    } else {
                        vec![KeyAction::Import(source)]
                    }
                }
                KeyCode::Esc => {
                    self.mode = InputMode::Normal;
                    self.buffer.clear();
                    vec![KeyAction::CancelImport]
                }
                KeyCode::Backspace => {
                    self.buffer.pop();
                    vec![]
                }
                KeyCode::Char(c) => {
                    self.buffer.push(c);
                    vec![]
                }
                _ => vec![],
            };
        }

        if !key.modifiers.difference(KeyModifiers::SHIFT).is_empty() {
            return vec![];
        }
        let KeyCode::Char(c) = key.code else {
            return vec![];
        };
        let cmd = match c.to_ascii_lowercase() {
            'm' => Command::ToggleMute,
            's' => Command::TogglePlay,
            'r' => Command::ReloadAll,
            'c' => Command::ToggleConfigPanel,
            'h' => Command::SwitchProtocol {
                protocol: ProtocolMode::Hls,
            },
            'd' => Command::SwitchProtocol {
                protocol: ProtocolMode::Dash,
            },
            'e' => Command::Export {
                path: self.export_path.clone(),
            },
            '1' => Command::SetLayout {
                layout: LayoutMode::Single,
            },
            '2' => Command::SetLayout {
                layout: LayoutMode::Grid2x2,
            },
            '3' => Command::SetLayout {
                layout: LayoutMode::Grid3x3,
            },
            '4' => Command::SetLayout {
                layout: LayoutMode::Grid4x4,
            },
            'i' => {
                self.mode = InputMode::Import;
                return vec![KeyAction::OpenImport];
            }
            'q' => return vec![KeyAction::Quit],
            _ => return vec![],
        };
        vec![KeyAction::Command(cmd)]
    }
}

/// Read an import source: an http(s) URL or a file path.
pub async fn read_import_source(source: &str) -> anyhow::Result<String> {
    if source.starts_with("http://") || source.starts_with("https://") {
        let response = reqwest::get(source).await?;
        if !response.status().is_success() {
            anyhow::bail!("HTTP {}", response.status());
        }
        Ok(response.text().await?)
    } else {
        Ok(tokio::fs::read_to_string(source).await?)
    }
}

/// Fetch and validate a registry.  Nothing is applied on failure.
pub async fn load_import(source: &str) -> anyhow::Result<Vec<ChannelDescriptor>> {
    let text = read_import_source(source).await?;
    Ok(registry::parse_import(&text)?)
}

/// Leaves raw mode when dropped.
pub struct RawModeGuard;

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
    }
}

/// Start reading keys from the terminal.  Returns `None` (and reads nothing)
/// when stdin is not a terminal.
pub fn spawn(event_tx: mpsc::Sender<GridEvent>, export_path: PathBuf) -> Option<RawModeGuard> {
    if !std::io::stdin().is_terminal() {
        info!("stdin is not a terminal, keyboard shortcuts disabled");
        return None;
    }
    if let Err(e) = enable_raw_mode() {
        warn!("Failed to enable raw mode, keyboard shortcuts disabled: {}", e);
        return None;
    }

    let (key_tx, mut key_rx) = mpsc::channel::<KeyEvent>(64);
    // Plain thread: a blocking read must not hold up runtime shutdown.
    std::thread::spawn(move || loop {
        match event::read() {
            Ok(Event::Key(key)) if key.kind != KeyEventKind::Release => {
                if key_tx.blocking_send(key).is_err() {
                    break;
                }
            }
            Ok(_) => {}
            Err(_) => break,
        }
    });

    tokio::spawn(async move {
        let mut input = KeyInput::new(export_path);
        while let Some(key) = key_rx.recv().await {
            let typing = input.mode() == InputMode::Import;
            let actions = input.handle_key(key);
            if typing && input.mode() == InputMode::Import {
                echo(key.code);
            }
            for action in actions {
                if !dispatch(action, &event_tx).await {
                    return;
                }
            }
        }
    });

    Some(RawModeGuard)
}

/// Raw mode has no line discipline; mirror the prompt edits ourselves.
fn echo(code: KeyCode) {
    match code {
        KeyCode::Char(c) => eprint!("{}", c),
        KeyCode::Backspace => eprint!("\x08 \x08"),
        _ => {}
    }
}

async fn dispatch(action: KeyAction, event_tx: &mpsc::Sender<GridEvent>) -> bool {
    let evt = match action {
        KeyAction::Command(cmd) => GridEvent::ClientCommand(cmd),
        KeyAction::OpenImport => {
            eprint!("\r\nimport (path or URL)> ");
            return true;
        }
        KeyAction::CancelImport => {
            eprint!("\r\n");
            debug!("Import cancelled");
            return true;
        }
        KeyAction::Import(source) => {
            eprint!("\r\n");
            match load_import(&source).await {
                Ok(channels) => {
                    info!("Imported {} channels from {}", channels.len(), source);
                    GridEvent::ClientCommand(Command::ReplaceChannels { channels })
                }
                Err(e) => {
                    error!("Import failed: {}", e);
                    return true;
                }
            }
        }
        KeyAction::Quit => GridEvent::Shutdown,
    };
    event_tx.send(evt).await.is_ok()
}
