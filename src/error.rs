use std::time::Duration;

use thiserror::Error;

/// A coordinate the model sent could not be mapped onto the display.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoordinateError {
    #[error("{0} must be a list of two non-negative integers")]
    Malformed(String),
    #[error("coordinate ({x}, {y}) must be non-negative")]
    Negative { x: i64, y: i64 },
    #[error("coordinate ({x}, {y}) is out of bounds for {width}x{height}")]
    OutOfBounds {
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    },
    #[error("display reported an empty resolution {width}x{height}")]
    EmptyDisplay { width: u32, height: u32 },
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("screen capture unavailable: {0}")]
    Unavailable(String),
    #[error("failed to decode captured frame: {0}")]
    Decode(String),
    #[error("failed to encode screenshot: {0}")]
    Encode(String),
    #[error("screenshot i/o failed: {0}")]
    Io(#[from] std::io::Error),
}

/// A primitive input command exited abnormally.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} exited with status {code:?}: {stderr}")]
    Exit {
        program: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("unsupported by the input driver: {0}")]
    Unsupported(String),
    #[error("could not parse {what} from driver output {output:?}")]
    Parse { what: &'static str, output: String },
    #[error("input command did not finish within {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Error)]
pub enum ModelServiceError {
    #[error("no API key configured (set ANTHROPIC_API_KEY)")]
    MissingApiKey,
    #[error("model service unreachable: {0}")]
    Transport(String),
    #[error("model service returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("model call did not finish within {0:?}")]
    Timeout(Duration),
    #[error("unexpected model response: {0}")]
    Decode(String),
    #[error("model service failed after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: Box<ModelServiceError>,
    },
}

impl ModelServiceError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ModelServiceError::Transport(_) | ModelServiceError::Timeout(_) => true,
            ModelServiceError::Status { status, .. } => {
                matches!(status, 408 | 409 | 429 | 529) || (500..600).contains(status)
            }
            ModelServiceError::MissingApiKey
            | ModelServiceError::Decode(_)
            | ModelServiceError::Exhausted { .. } => false,
        }
    }
}

/// A caller-supplied budget ran out. Ends the session as done with a warning.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BudgetExceeded {
    #[error("turn budget of {limit} exhausted")]
    Turns { limit: u32 },
    #[error("token budget exhausted ({used} of {limit} tokens used)")]
    Tokens { used: u64, limit: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("key name is empty")]
    Empty,
    #[error(
        "unknown key '{0}'. Use a single character, a named key (return, tab, space, escape, \
         delete, home, end, pageup, pagedown, up/down/left/right, f1-f24) or modifiers \
         (cmd, ctrl, alt, shift, fn) joined with '+'"
    )]
    Unknown(String),
    #[error("'{0}' is not a modifier key")]
    NotAModifier(String),
}

/// A tool-call input that cannot be turned into an [`crate::types::Action`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActionError {
    #[error("invalid action: {0}")]
    UnknownKind(String),
    #[error("tool input must be a JSON object with an \"action\" field")]
    NotAnObject,
    #[error("{param} is required for {action}")]
    MissingParam {
        action: &'static str,
        param: &'static str,
    },
    #[error("{param} is not accepted for {action}")]
    UnexpectedParam {
        action: &'static str,
        param: &'static str,
    },
    #[error("invalid {param} for {action}: {message}")]
    InvalidParam {
        action: &'static str,
        param: &'static str,
        message: String,
    },
    #[error(transparent)]
    Coordinate(#[from] CoordinateError),
    #[error(transparent)]
    Key(#[from] KeyError),
}

/// Everything that can go wrong while dispatching one action.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Action(#[from] ActionError),
    #[error(transparent)]
    Coordinate(#[from] CoordinateError),
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error("{source} (after {done} of {total} chunks)")]
    Partial {
        output: String,
        done: usize,
        total: usize,
        #[source]
        source: CommandError,
    },
}
