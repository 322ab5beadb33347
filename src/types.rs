use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::coords::parse_coordinate;
use crate::display::Resolution;
use crate::error::ActionError;
use crate::keys::{Key, KeyChord};

/// A point in the model's (scaled-down) coordinate space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalPoint {
    pub x: u32,
    pub y: u32,
}

/// A point on the real display, in the input driver's units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalPoint {
    pub x: u32,
    pub y: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MouseButton {
    Left,
    Right,
    Middle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClickKind {
    Left,
    Right,
    Middle,
    Double,
    Triple,
}

impl ClickKind {
    pub fn button(&self) -> MouseButton {
        match self {
            ClickKind::Right => MouseButton::Right,
            ClickKind::Middle => MouseButton::Middle,
            ClickKind::Left | ClickKind::Double | ClickKind::Triple => MouseButton::Left,
        }
    }

    /// Number of discrete clicks issued. The injection layer has no native
    /// multi-click.
    pub fn repeat(&self) -> usize {
        match self {
            ClickKind::Double => 2,
            ClickKind::Triple => 3,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrollDirection {
    Up,
    Down,
    Left,
    Right,
}

impl ScrollDirection {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "up" => Some(ScrollDirection::Up),
            "down" => Some(ScrollDirection::Down),
            "left" => Some(ScrollDirection::Left),
            "right" => Some(ScrollDirection::Right),
            _ => None,
        }
    }
}

pub const DEFAULT_SCROLL_AMOUNT: u32 = 5;
pub const DEFAULT_WAIT: Duration = Duration::from_secs(1);
pub const DEFAULT_HOLD: Duration = Duration::from_secs(1);

/// One thing the model asked the computer to do.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    MouseMove {
        to: LogicalPoint,
    },
    Click {
        kind: ClickKind,
        at: Option<LogicalPoint>,
    },
    Drag {
        from: Option<LogicalPoint>,
        to: LogicalPoint,
    },
    MouseDown,
    MouseUp,
    KeyPress {
        key: Key,
    },
    KeyCombo {
        chord: KeyChord,
    },
    HoldKey {
        key: Key,
        duration: Duration,
    },
    TypeText {
        text: String,
    },
    Scroll {
        at: LogicalPoint,
        direction: ScrollDirection,
        amount: u32,
    },
    Wait {
        duration: Duration,
    },
    Screenshot,
    CursorPosition,
}

/// When the dispatcher takes a screenshot after an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapturePolicy {
    Never,
    Immediately,
    AfterSettle,
}

/// Action names the model may use, in catalog order.
pub const ACTION_NAMES: [&str; 16] = [
    "key",
    "type",
    "mouse_move",
    "left_click",
    "left_click_drag",
    "right_click",
    "middle_click",
    "double_click",
    "triple_click",
    "left_mouse_down",
    "left_mouse_up",
    "scroll",
    "hold_key",
    "wait",
    "screenshot",
    "cursor_position",
];

#[derive(Debug, Default, Deserialize)]
struct RawInput {
    action: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    coordinate: Option<Value>,
    #[serde(default)]
    start_coordinate: Option<Value>,
    #[serde(default)]
    scroll_direction: Option<String>,
    #[serde(default)]
    scroll_amount: Option<Value>,
    #[serde(default)]
    duration: Option<Value>,
}

impl Action {
    /// Validates a computer-tool input object and builds the matching action.
    pub fn from_input(input: &Value) -> Result<Action, ActionError> {
        if !input.is_object() {
            return Err(ActionError::NotAnObject);
        }
        let raw: RawInput =
            serde_json::from_value(input.clone()).map_err(|_| ActionError::NotAnObject)?;
        let name = ACTION_NAMES
            .iter()
            .copied()
            .find(|n| *n == raw.action)
            .ok_or_else(|| ActionError::UnknownKind(raw.action.clone()))?;

        let action = match name {
            "mouse_move" => {
                reject_text(name, &raw)?;
                Action::MouseMove {
                    to: required_coordinate(name, &raw)?,
                }
            }
            "left_click_drag" => {
                reject_text(name, &raw)?;
                Action::Drag {
                    from: optional_point("start_coordinate", raw.start_coordinate.as_ref())?,
                    to: required_coordinate(name, &raw)?,
                }
            }
            "left_click" | "right_click" | "middle_click" | "double_click" | "triple_click" => {
                reject_text(name, &raw)?;
                let kind = match name {
                    "left_click" => ClickKind::Left,
                    "right_click" => ClickKind::Right,
                    "middle_click" => ClickKind::Middle,
                    "double_click" => ClickKind::Double,
                    _ => ClickKind::Triple,
                };
                Action::Click {
                    kind,
                    at: optional_point("coordinate", raw.coordinate.as_ref())?,
                }
            }
            "left_mouse_down" | "left_mouse_up" => {
                reject_text(name, &raw)?;
                reject_coordinate(name, &raw)?;
                if name == "left_mouse_down" {
                    Action::MouseDown
                } else {
                    Action::MouseUp
                }
            }
            "key" => {
                reject_coordinate(name, &raw)?;
                let chord = KeyChord::parse(required_text(name, &raw)?)?;
                if chord.is_combo() {
                    Action::KeyCombo { chord }
                } else {
                    Action::KeyPress { key: chord.key }
                }
            }
            "hold_key" => {
                reject_coordinate(name, &raw)?;
                Action::HoldKey {
                    key: Key::parse(required_text(name, &raw)?)?,
                    duration: seconds(name, raw.duration.as_ref())?.unwrap_or(DEFAULT_HOLD),
                }
            }
            "type" => {
                reject_coordinate(name, &raw)?;
                Action::TypeText {
                    text: required_text(name, &raw)?.to_string(),
                }
            }
            "scroll" => {
                reject_text(name, &raw)?;
                let direction = match raw.scroll_direction.as_deref() {
                    None => ScrollDirection::Down,
                    Some(d) => ScrollDirection::parse(d).ok_or_else(|| ActionError::InvalidParam {
                        action: name,
                        param: "scroll_direction",
                        message: format!("'{d}' is not one of up, down, left, right"),
                    })?,
                };
                Action::Scroll {
                    at: required_coordinate(name, &raw)?,
                    direction,
                    amount: scroll_amount(name, raw.scroll_amount.as_ref())?,
                }
            }
            "wait" => Action::Wait {
                duration: seconds(name, raw.duration.as_ref())?.unwrap_or(DEFAULT_WAIT),
            },
            "screenshot" | "cursor_position" => {
                reject_text(name, &raw)?;
                reject_coordinate(name, &raw)?;
                if name == "screenshot" {
                    Action::Screenshot
                } else {
                    Action::CursorPosition
                }
            }
            other => return Err(ActionError::UnknownKind(other.to_string())),
        };
        Ok(action)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Action::MouseMove { .. } => "mouse_move",
            Action::Click { kind, .. } => match kind {
                ClickKind::Left => "left_click",
                ClickKind::Right => "right_click",
                ClickKind::Middle => "middle_click",
                ClickKind::Double => "double_click",
                ClickKind::Triple => "triple_click",
            },
            Action::Drag { .. } => "left_click_drag",
            Action::MouseDown => "left_mouse_down",
            Action::MouseUp => "left_mouse_up",
            Action::KeyPress { .. } | Action::KeyCombo { .. } => "key",
            Action::HoldKey { .. } => "hold_key",
            Action::TypeText { .. } => "type",
            Action::Scroll { .. } => "scroll",
            Action::Wait { .. } => "wait",
            Action::Screenshot => "screenshot",
            Action::CursorPosition => "cursor_position",
        }
    }

    /// State-changing actions are followed by a settle delay and a capture,
    /// since the model has no other way to see their effect.
    pub fn capture_policy(&self) -> CapturePolicy {
        match self {
            Action::Wait { .. } | Action::CursorPosition => CapturePolicy::Never,
            Action::Screenshot => CapturePolicy::Immediately,
            _ => CapturePolicy::AfterSettle,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::MouseMove { to } => write!(f, "mouse_move ({}, {})", to.x, to.y),
            Action::Click { at: Some(p), .. } => write!(f, "{} ({}, {})", self.name(), p.x, p.y),
            Action::Drag { from, to } => match from {
                Some(s) => write!(f, "left_click_drag ({}, {}) -> ({}, {})", s.x, s.y, to.x, to.y),
                None => write!(f, "left_click_drag -> ({}, {})", to.x, to.y),
            },
            Action::KeyPress { key } => write!(f, "key {key}"),
            Action::KeyCombo { chord } => write!(f, "key {chord}"),
            Action::HoldKey { key, duration } => {
                write!(f, "hold_key {key} for {:.1}s", duration.as_secs_f64())
            }
            Action::TypeText { text } => write!(f, "type {} chars", text.chars().count()),
            Action::Scroll {
                at,
                direction,
                amount,
            } => write!(f, "scroll {direction:?} x{amount} at ({}, {})", at.x, at.y),
            Action::Wait { duration } => write!(f, "wait {:.1}s", duration.as_secs_f64()),
            _ => f.write_str(self.name()),
        }
    }
}

fn reject_text(action: &'static str, raw: &RawInput) -> Result<(), ActionError> {
    match raw.text {
        Some(_) => Err(ActionError::UnexpectedParam {
            action,
            param: "text",
        }),
        None => Ok(()),
    }
}

fn reject_coordinate(action: &'static str, raw: &RawInput) -> Result<(), ActionError> {
    match raw.coordinate {
        Some(Value::Null) | None => Ok(()),
        Some(_) => Err(ActionError::UnexpectedParam {
            action,
            param: "coordinate",
        }),
    }
}

fn required_text<'a>(action: &'static str, raw: &'a RawInput) -> Result<&'a str, ActionError> {
    raw.text.as_deref().ok_or(ActionError::MissingParam {
        action,
        param: "text",
    })
}

fn required_coordinate(action: &'static str, raw: &RawInput) -> Result<LogicalPoint, ActionError> {
    optional_point("coordinate", raw.coordinate.as_ref())?.ok_or(
        ActionError::MissingParam {
            action,
            param: "coordinate",
        },
    )
}

fn optional_point(
    param: &'static str,
    value: Option<&Value>,
) -> Result<Option<LogicalPoint>, ActionError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(v) => Ok(Some(parse_coordinate(param, v)?)),
    }
}

fn seconds(action: &'static str, value: Option<&Value>) -> Result<Option<Duration>, ActionError> {
    let Some(value) = value.filter(|v| !v.is_null()) else {
        return Ok(None);
    };
    let secs = value
        .as_f64()
        .filter(|s| s.is_finite() && *s >= 0.0)
        .ok_or_else(|| ActionError::InvalidParam {
            action,
            param: "duration",
            message: "duration must be a non-negative number of seconds".into(),
        })?;
    Ok(Some(Duration::from_secs_f64(secs)))
}

fn scroll_amount(action: &'static str, value: Option<&Value>) -> Result<u32, ActionError> {
    let Some(value) = value.filter(|v| !v.is_null()) else {
        return Ok(DEFAULT_SCROLL_AMOUNT);
    };
    let amount = value.as_i64().ok_or_else(|| ActionError::InvalidParam {
        action,
        param: "scroll_amount",
        message: "scroll_amount must be an integer".into(),
    })?;
    u32::try_from(amount).map_err(|_| ActionError::InvalidParam {
        action,
        param: "scroll_amount",
        message: format!("scroll_amount must not be negative, got {amount}"),
    })
}

/// A screenshot ready to travel to the model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageArtifact {
    pub media_type: &'static str,
    /// Base64 of the encoded image bytes.
    pub data: String,
    pub width: u32,
    pub height: u32,
}

/// What one dispatched action produced. An error does not rule out output.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ActionResult {
    pub output: String,
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageArtifact>,
}

impl ActionResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            ..Default::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Appends another error message, keeping earlier ones.
    pub fn push_error(&mut self, message: impl Into<String>) {
        let message = message.into();
        self.error = Some(match self.error.take() {
            Some(existing) => format!("{existing}; {message}"),
            None => message,
        });
    }
}

/// Model output: plain text or a request to run a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
}

/// A tool call pulled out of a model response, with its correlation id.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionRequest {
    pub id: String,
    pub name: String,
    pub input: Value,
}

/// One entry of a session's ordered history.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Message {
    User { text: String },
    Model { content: Vec<ContentBlock> },
    ToolResult { tool_use_id: String, result: ActionResult },
}

/// The actions offered to the model, with their parameter schema.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionCatalog {
    pub tool_name: &'static str,
    pub display: Resolution,
    pub actions: Vec<&'static str>,
}

impl ActionCatalog {
    pub fn new(display: Resolution) -> Self {
        Self {
            tool_name: "computer",
            display,
            actions: ACTION_NAMES.to_vec(),
        }
    }

    /// JSON schema for models without a native computer tool.
    pub fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "action": { "type": "string", "enum": self.actions },
                "coordinate": {
                    "type": "array",
                    "items": { "type": "integer", "minimum": 0 },
                    "minItems": 2,
                    "maxItems": 2,
                    "description": format!(
                        "(x, y) in pixels on a {}x{} screen",
                        self.display.width, self.display.height
                    ),
                },
                "start_coordinate": {
                    "type": "array",
                    "items": { "type": "integer", "minimum": 0 },
                    "minItems": 2,
                    "maxItems": 2,
                },
                "text": { "type": "string" },
                "scroll_direction": { "type": "string", "enum": ["up", "down", "left", "right"] },
                "scroll_amount": { "type": "integer", "minimum": 0 },
                "duration": { "type": "number", "minimum": 0 },
            },
            "required": ["action"],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoordinateError;
    use crate::keys::{Modifier, NamedKey};

    #[test]
    fn parses_triple_click_with_coordinate() {
        let action =
            Action::from_input(&json!({"action": "triple_click", "coordinate": [10, 20]})).unwrap();
        assert_eq!(
            action,
            Action::Click {
                kind: ClickKind::Triple,
                at: Some(LogicalPoint { x: 10, y: 20 }),
            }
        );
        assert_eq!(action.name(), "triple_click");
    }

    #[test]
    fn key_with_plus_becomes_combo() {
        let action = Action::from_input(&json!({"action": "key", "text": "cmd+c"})).unwrap();
        match action {
            Action::KeyCombo { chord } => {
                assert_eq!(chord.modifiers, vec![Modifier::Cmd]);
                assert_eq!(chord.key, Key::Char('c'));
            }
            other => panic!("expected combo, got {other:?}"),
        }

        let action = Action::from_input(&json!({"action": "key", "text": "Return"})).unwrap();
        assert_eq!(
            action,
            Action::KeyPress {
                key: Key::Named(NamedKey::Return)
            }
        );
    }

    #[test]
    fn unknown_kind_is_rejected() {
        assert_eq!(
            Action::from_input(&json!({"action": "zoom"})),
            Err(ActionError::UnknownKind("zoom".into()))
        );
        assert_eq!(
            Action::from_input(&json!("left_click")),
            Err(ActionError::NotAnObject)
        );
    }

    #[test]
    fn missing_and_unexpected_params() {
        assert_eq!(
            Action::from_input(&json!({"action": "mouse_move"})),
            Err(ActionError::MissingParam {
                action: "mouse_move",
                param: "coordinate"
            })
        );
        assert_eq!(
            Action::from_input(&json!({"action": "type", "text": "hi", "coordinate": [1, 1]})),
            Err(ActionError::UnexpectedParam {
                action: "type",
                param: "coordinate"
            })
        );
        assert_eq!(
            Action::from_input(&json!({"action": "left_click", "text": "x"})),
            Err(ActionError::UnexpectedParam {
                action: "left_click",
                param: "text"
            })
        );
    }

    #[test]
    fn negative_coordinate_is_a_coordinate_error() {
        assert_eq!(
            Action::from_input(&json!({"action": "mouse_move", "coordinate": [-5, 3]})),
            Err(ActionError::Coordinate(CoordinateError::Negative { x: -5, y: 3 }))
        );
    }

    #[test]
    fn scroll_defaults_and_negative_amount() {
        let action =
            Action::from_input(&json!({"action": "scroll", "coordinate": [5, 5]})).unwrap();
        assert_eq!(
            action,
            Action::Scroll {
                at: LogicalPoint { x: 5, y: 5 },
                direction: ScrollDirection::Down,
                amount: DEFAULT_SCROLL_AMOUNT,
            }
        );

        let err = Action::from_input(&json!({
            "action": "scroll",
            "coordinate": [5, 5],
            "scroll_direction": "up",
            "scroll_amount": -2,
        }))
        .unwrap_err();
        assert!(matches!(
            err,
            ActionError::InvalidParam {
                param: "scroll_amount",
                ..
            }
        ));
    }

    #[test]
    fn wait_rejects_negative_duration() {
        assert!(Action::from_input(&json!({"action": "wait", "duration": -1})).is_err());
        assert_eq!(
            Action::from_input(&json!({"action": "wait", "duration": 0.5})).unwrap(),
            Action::Wait {
                duration: Duration::from_millis(500)
            }
        );
    }

    #[test]
    fn capture_policy_by_kind() {
        assert_eq!(
            Action::Wait {
                duration: DEFAULT_WAIT
            }
            .capture_policy(),
            CapturePolicy::Never
        );
        assert_eq!(Action::CursorPosition.capture_policy(), CapturePolicy::Never);
        assert_eq!(Action::Screenshot.capture_policy(), CapturePolicy::Immediately);
        assert_eq!(Action::MouseDown.capture_policy(), CapturePolicy::AfterSettle);
    }

    #[test]
    fn push_error_keeps_earlier_messages() {
        let mut result = ActionResult::ok("typed");
        result.push_error("chunk 2 failed");
        result.push_error("screenshot failed");
        assert_eq!(
            result.error.as_deref(),
            Some("chunk 2 failed; screenshot failed")
        );
        assert_eq!(result.output, "typed");
    }
}
