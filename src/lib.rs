//! Lets a vision model drive a macOS desktop: it asks for actions, the
//! dispatcher performs them through `cliclick`, and every state change is
//! answered with a fresh screenshot until the model is done.

pub mod brain;
pub mod cliclick;
pub mod config;
pub mod coords;
pub mod display;
pub mod error;
pub mod events;
pub mod hands;
pub mod keys;
pub mod logging;
pub mod retry;
pub mod screen;
pub mod session;
pub mod types;

pub use brain::{AnthropicClient, ModelRequest, ModelResponse, ModelService, Resilient, Usage};
pub use config::AgentConfig;
pub use display::{DisplayProfile, Resolution};
pub use events::{EventKind, SessionEvent};
pub use hands::{DispatchSettings, Dispatcher, InputDriver, Primitive};
pub use screen::{ScreenCapturer, ScreenshotProvider};
pub use session::{Agent, LoopState, Session, SessionHandle, SessionOutcome, SessionReport};
pub use types::{Action, ActionResult, ContentBlock, Message};
