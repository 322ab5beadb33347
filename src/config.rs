//! Tunables for a computer-control agent, with defaults and env overrides.

use std::path::PathBuf;
use std::time::Duration;

use crate::hands::DispatchSettings;
use crate::retry::RetryPolicy;

pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";
pub const DEFAULT_API_BASE: &str = "https://api.anthropic.com";

pub const DEFAULT_SYSTEM_PROMPT: &str = r#"You are operating a macOS computer through the `computer` tool.

Rules:
1. Take a screenshot first if you do not know what is on screen.
2. Every state-changing action returns a fresh screenshot. Check it before the next step.
3. Coordinates are pixels on the screenshot you were given, origin top-left.
4. Use keyboard shortcuts (cmd+space, cmd+tab, cmd+w) when they are faster than clicking.
5. If an action reports an error, read it and try a different approach.
6. When the task is finished, reply with a short summary and no tool calls."#;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub model: String,
    pub api_base: String,
    pub api_key: Option<String>,
    pub max_tokens: u32,
    pub max_turns: u32,
    /// Input plus output tokens across the whole session.
    pub token_budget: Option<u64>,
    pub settle_delay: Duration,
    pub typing_chunk: usize,
    pub typing_delay: Duration,
    pub max_hold: Duration,
    pub max_scroll: u32,
    pub action_timeout: Duration,
    /// Bound on one model call.
    pub turn_timeout: Duration,
    pub retry: RetryPolicy,
    /// Downscale screenshots and coordinates to a standard resolution.
    pub scaling: bool,
    /// Offer the model's built-in computer tool instead of a custom schema.
    pub native_tool: bool,
    /// Older screenshots in history are replaced by a placeholder.
    pub keep_recent_images: usize,
    pub system_prompt: String,
    /// Where the last screenshot of an unsuccessful session is written.
    pub screenshot_dir: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        let dispatch = DispatchSettings::default();
        Self {
            model: DEFAULT_MODEL.to_string(),
            api_base: DEFAULT_API_BASE.to_string(),
            api_key: None,
            max_tokens: 4096,
            max_turns: 50,
            token_budget: None,
            settle_delay: dispatch.settle_delay,
            typing_chunk: dispatch.typing_chunk,
            typing_delay: dispatch.typing_delay,
            max_hold: dispatch.max_hold,
            max_scroll: dispatch.max_scroll,
            action_timeout: dispatch.action_timeout,
            turn_timeout: Duration::from_secs(120),
            retry: RetryPolicy::default(),
            scaling: true,
            native_tool: true,
            keep_recent_images: 3,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            screenshot_dir: dirs::cache_dir()
                .map(|dir| dir.join("mac-computer-control").join("screenshots")),
        }
    }
}

impl AgentConfig {
    /// Defaults overlaid with `ANTHROPIC_API_KEY`, `ANTHROPIC_BASE_URL` and
    /// `COMPUTER_CONTROL_MODEL`. Load `.env` before calling.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(key) = non_empty_var("ANTHROPIC_API_KEY") {
            config.api_key = Some(key);
        }
        if let Some(base) = non_empty_var("ANTHROPIC_BASE_URL") {
            config.api_base = base;
        }
        if let Some(model) = non_empty_var("COMPUTER_CONTROL_MODEL") {
            config.model = model;
        }
        config
    }

    pub fn dispatch_settings(&self) -> DispatchSettings {
        DispatchSettings {
            settle_delay: self.settle_delay,
            typing_chunk: self.typing_chunk.max(1),
            typing_delay: self.typing_delay,
            max_hold: self.max_hold,
            max_scroll: self.max_scroll,
            action_timeout: self.action_timeout,
        }
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
