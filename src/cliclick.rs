//! Input driver backed by the macOS `cliclick` tool.
//!
//! Each primitive batch becomes one `cliclick` invocation, so a key combo
//! or a triple click reaches the window server without interleaving.
//! Requires `brew install cliclick` and accessibility permission.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tracing::debug;

use crate::display::Resolution;
use crate::error::CommandError;
use crate::hands::{InputDriver, Primitive};
use crate::keys::{Key, NamedKey};
use crate::types::{MouseButton, PhysicalPoint, ScrollDirection};

const DESKTOP_BOUNDS_SCRIPT: &str =
    r#"tell application "Finder" to get bounds of window of desktop"#;

pub struct Cliclick {
    program: String,
    /// Moves while the left button is down must be drag moves.
    dragging: AtomicBool,
}

impl Cliclick {
    pub fn new() -> Self {
        Self::with_program("cliclick")
    }

    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            dragging: AtomicBool::new(false),
        }
    }

    /// Renders a batch into cliclick command arguments. Drag state only
    /// advances once the batch has actually run.
    pub fn render(&self, batch: &[Primitive]) -> Result<Rendered, CommandError> {
        let mut dragging = self.dragging.load(Ordering::SeqCst);
        let mut args = Vec::with_capacity(batch.len());
        let mut i = 0;
        while i < batch.len() {
            match &batch[i] {
                Primitive::MoveTo(p) => {
                    let verb = if dragging { "dm" } else { "m" };
                    args.push(format!("{verb}:{}", point(p)));
                }
                Primitive::Click { button, at } => {
                    let verb = match button {
                        MouseButton::Left => "c",
                        MouseButton::Right => "rc",
                        MouseButton::Middle => {
                            return Err(CommandError::Unsupported(
                                "cliclick has no middle-button click".into(),
                            ));
                        }
                    };
                    args.push(format!("{verb}:{}", position(at)));
                }
                Primitive::ButtonDown(at) => {
                    args.push(format!("dd:{}", position(at)));
                    dragging = true;
                }
                Primitive::ButtonUp(at) => {
                    args.push(format!("du:{}", position(at)));
                    dragging = false;
                }
                Primitive::KeyDown(Key::Modifier(m)) => args.push(format!("kd:{}", m.as_str())),
                Primitive::KeyUp(Key::Modifier(m)) => args.push(format!("ku:{}", m.as_str())),
                Primitive::KeyDown(key) => {
                    // Non-modifier keys can only be tapped: a down must be
                    // followed directly by its own up.
                    match batch.get(i + 1) {
                        Some(Primitive::KeyUp(up)) if up == key => {
                            tap(key, &mut args)?;
                            i += 1;
                        }
                        _ => {
                            return Err(CommandError::Unsupported(format!(
                                "cliclick can only hold modifier keys, not '{key}'"
                            )));
                        }
                    }
                }
                // Never pressed, see above.
                Primitive::KeyUp(_) => {}
                Primitive::TypeText(text) => args.push(format!("t:{text}")),
                Primitive::ScrollStep(direction) => {
                    let arrow = match direction {
                        ScrollDirection::Up => "arrow-up",
                        ScrollDirection::Down => "arrow-down",
                        ScrollDirection::Left => "arrow-left",
                        ScrollDirection::Right => "arrow-right",
                    };
                    args.push(format!("kp:{arrow}"));
                }
            }
            i += 1;
        }
        Ok(Rendered { args, dragging })
    }

    async fn run(&self, program: &str, args: &[String]) -> Result<String, CommandError> {
        debug!("[cliclick] {} {}", program, args.join(" "));
        let output = tokio::process::Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| CommandError::Spawn {
                program: program.to_string(),
                source,
            })?;
        if !output.status.success() {
            return Err(CommandError::Exit {
                program: program.to_string(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// A rendered batch and the drag state it leaves behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub args: Vec<String>,
    pub dragging: bool,
}

impl Default for Cliclick {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InputDriver for Cliclick {
    async fn display_size(&self) -> Result<Resolution, CommandError> {
        let output = self
            .run(
                "osascript",
                &["-e".to_string(), DESKTOP_BOUNDS_SCRIPT.to_string()],
            )
            .await?;
        parse_bounds(&output).ok_or(CommandError::Parse {
            what: "desktop bounds",
            output,
        })
    }

    async fn issue(&self, batch: &[Primitive]) -> Result<String, CommandError> {
        let rendered = self.render(batch)?;
        if rendered.args.is_empty() {
            return Ok(String::new());
        }
        let output = self.run(&self.program, &rendered.args).await?;
        self.dragging.store(rendered.dragging, Ordering::SeqCst);
        Ok(output)
    }

    async fn cursor_position(&self) -> Result<PhysicalPoint, CommandError> {
        let output = self.run(&self.program, &["p:.".to_string()]).await?;
        parse_position(&output).ok_or(CommandError::Parse {
            what: "cursor position",
            output,
        })
    }
}

fn point(p: &PhysicalPoint) -> String {
    format!("{},{}", p.x, p.y)
}

fn position(at: &Option<PhysicalPoint>) -> String {
    at.as_ref().map(point).unwrap_or_else(|| ".".to_string())
}

fn tap(key: &Key, args: &mut Vec<String>) -> Result<(), CommandError> {
    let code = match key {
        Key::Char(c) => {
            args.push(format!("t:{c}"));
            return Ok(());
        }
        Key::Modifier(m) => {
            args.push(format!("kd:{}", m.as_str()));
            args.push(format!("ku:{}", m.as_str()));
            return Ok(());
        }
        Key::Named(named) => match named {
            NamedKey::Return => "return".to_string(),
            NamedKey::Tab => "tab".to_string(),
            NamedKey::Space => "space".to_string(),
            NamedKey::Escape => "esc".to_string(),
            NamedKey::Backspace => "delete".to_string(),
            NamedKey::ForwardDelete => "fwd-delete".to_string(),
            NamedKey::Home => "home".to_string(),
            NamedKey::End => "end".to_string(),
            NamedKey::PageUp => "page-up".to_string(),
            NamedKey::PageDown => "page-down".to_string(),
            NamedKey::ArrowUp => "arrow-up".to_string(),
            NamedKey::ArrowDown => "arrow-down".to_string(),
            NamedKey::ArrowLeft => "arrow-left".to_string(),
            NamedKey::ArrowRight => "arrow-right".to_string(),
            NamedKey::F(n) if *n <= 16 => format!("f{n}"),
            NamedKey::F(n) => {
                return Err(CommandError::Unsupported(format!(
                    "cliclick only knows f1-f16, not f{n}"
                )));
            }
        },
    };
    args.push(format!("kp:{code}"));
    Ok(())
}

/// Parses Finder's `"0, 0, 1440, 900"`.
fn parse_bounds(output: &str) -> Option<Resolution> {
    let parts: Vec<u32> = output
        .split(',')
        .map(|p| p.trim().parse().ok())
        .collect::<Option<_>>()?;
    match parts.as_slice() {
        [left, top, right, bottom] if right > left && bottom > top => {
            Some(Resolution::new(right - left, bottom - top))
        }
        _ => None,
    }
}

/// Parses cliclick's `"812,443"`, tolerating a leading label.
fn parse_position(output: &str) -> Option<PhysicalPoint> {
    let last = output.split_whitespace().last()?;
    let (x, y) = last.split_once(',')?;
    Some(PhysicalPoint {
        x: x.trim().parse::<f64>().ok()?.round().max(0.0) as u32,
        y: y.trim().parse::<f64>().ok()?.round().max(0.0) as u32,
    })
}
