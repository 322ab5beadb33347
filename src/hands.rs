//! Action dispatcher: turns one validated [`Action`] into primitive input
//! commands, waits for the UI to settle and captures the result.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::coords::{to_logical, to_physical};
use crate::display::{DisplayProfile, Resolution};
use crate::error::{CommandError, DispatchError};
use crate::keys::Key;
use crate::screen::ScreenshotProvider;
use crate::types::{
    Action, ActionResult, CapturePolicy, MouseButton, PhysicalPoint, ScrollDirection,
};

/// A discrete command for the input-injection facility. Coordinates are
/// always physical.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Primitive {
    MoveTo(PhysicalPoint),
    /// Click at a point, or at the current pointer position.
    Click {
        button: MouseButton,
        at: Option<PhysicalPoint>,
    },
    ButtonDown(Option<PhysicalPoint>),
    ButtonUp(Option<PhysicalPoint>),
    KeyDown(Key),
    KeyUp(Key),
    TypeText(String),
    ScrollStep(ScrollDirection),
}

/// The external input-injection facility. Each `issue` call runs one
/// ordered batch.
#[async_trait]
pub trait InputDriver: Send + Sync {
    /// Size of the display in the units `issue` expects.
    async fn display_size(&self) -> Result<Resolution, CommandError>;

    async fn issue(&self, batch: &[Primitive]) -> Result<String, CommandError>;

    async fn cursor_position(&self) -> Result<PhysicalPoint, CommandError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchSettings {
    /// Pause between a state-changing command and its screenshot.
    pub settle_delay: Duration,
    /// Max characters per text-entry command.
    pub typing_chunk: usize,
    pub typing_delay: Duration,
    pub max_hold: Duration,
    /// Most scroll steps one action may issue.
    pub max_scroll: u32,
    /// Bound on each primitive batch.
    pub action_timeout: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_secs(1),
            typing_chunk: 50,
            typing_delay: Duration::from_millis(12),
            max_hold: Duration::from_secs(10),
            max_scroll: 50,
            action_timeout: Duration::from_secs(30),
        }
    }
}

/// Keys and buttons that may currently be down on the real devices.
#[derive(Debug, Default)]
struct HeldInputs {
    keys: Vec<Key>,
    button: bool,
}

impl HeldInputs {
    fn track(&mut self, batch: &[Primitive]) {
        for primitive in batch {
            match primitive {
                Primitive::KeyDown(key) if !self.keys.contains(key) => self.keys.push(key.clone()),
                Primitive::KeyUp(key) => self.keys.retain(|k| k != key),
                Primitive::ButtonDown(_) => self.button = true,
                Primitive::ButtonUp(_) => self.button = false,
                _ => {}
            }
        }
    }

    /// After a failed batch any of its presses may have landed.
    fn assume_pressed(&mut self, batch: &[Primitive]) {
        for primitive in batch {
            match primitive {
                Primitive::KeyDown(key) if !self.keys.contains(key) => self.keys.push(key.clone()),
                Primitive::ButtonDown(_) => self.button = true,
                _ => {}
            }
        }
    }

    fn release_batch(&mut self) -> Vec<Primitive> {
        let mut batch: Vec<Primitive> = self.keys.drain(..).rev().map(Primitive::KeyUp).collect();
        if std::mem::take(&mut self.button) {
            batch.push(Primitive::ButtonUp(None));
        }
        batch
    }
}

/// One dispatcher drives one display. Actions run one at a time; the lock
/// also guards the held-input bookkeeping.
pub struct Dispatcher {
    driver: Arc<dyn InputDriver>,
    screen: ScreenshotProvider,
    settings: DispatchSettings,
    held: Mutex<HeldInputs>,
}

impl Dispatcher {
    pub fn new(
        driver: Arc<dyn InputDriver>,
        screen: ScreenshotProvider,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            driver,
            screen,
            settings,
            held: Mutex::new(HeldInputs::default()),
        }
    }

    /// Queries the display and builds a fresh profile for it.
    pub async fn display_profile(&self, scaling: bool) -> Result<DisplayProfile, DispatchError> {
        let physical = self.driver.display_size().await?;
        let profile = DisplayProfile::detect(physical, scaling)?;
        info!(
            "[hands] display {} -> model space {}",
            profile.physical(),
            profile.logical()
        );
        Ok(profile)
    }

    /// Parses raw tool input and executes it. Invalid input becomes an
    /// error result; nothing is issued.
    pub async fn execute_input(
        &self,
        input: &Value,
        profile: &DisplayProfile,
        cancel: &CancellationToken,
    ) -> ActionResult {
        match Action::from_input(input) {
            Ok(action) => self.execute(&action, profile, cancel).await,
            Err(e) => {
                warn!("[hands] rejected tool input {}: {}", input, e);
                ActionResult::failure(e.to_string())
            }
        }
    }

    /// Runs one action. Never fails: problems are reported in the result.
    pub async fn execute(
        &self,
        action: &Action,
        profile: &DisplayProfile,
        cancel: &CancellationToken,
    ) -> ActionResult {
        let mut held = self.held.lock().await;
        info!("[hands] {}", action);

        let mut result = match self.perform(action, profile, cancel, &mut held).await {
            Ok(output) => ActionResult::ok(output),
            Err(DispatchError::Partial {
                output,
                done,
                total,
                source,
            }) => {
                warn!("[hands] {} failed after {}/{} chunks: {}", action.name(), done, total, source);
                let mut result = ActionResult::ok(output);
                result.push_error(format!("{source} (after {done} of {total} chunks)"));
                result
            }
            Err(e) => {
                warn!("[hands] {} failed: {}", action.name(), e);
                ActionResult::failure(e.to_string())
            }
        };

        match action.capture_policy() {
            CapturePolicy::Never => {}
            CapturePolicy::Immediately => self.attach_screenshot(&mut result, profile).await,
            CapturePolicy::AfterSettle => {
                suspend(self.settings.settle_delay, cancel).await;
                self.attach_screenshot(&mut result, profile).await;
            }
        }
        result
    }

    /// Releases every key and button this dispatcher may have left down.
    pub async fn release_all(&self) -> Result<(), CommandError> {
        let mut held = self.held.lock().await;
        self.release_held(&mut held).await
    }

    async fn perform(
        &self,
        action: &Action,
        profile: &DisplayProfile,
        cancel: &CancellationToken,
        held: &mut HeldInputs,
    ) -> Result<String, DispatchError> {
        let output = match action {
            Action::MouseMove { to } => {
                let to = to_physical(*to, profile)?;
                self.issue(held, vec![Primitive::MoveTo(to)]).await?
            }
            Action::Click { kind, at } => {
                let at = at.map(|p| to_physical(p, profile)).transpose()?;
                let mut batch = Vec::with_capacity(kind.repeat() + 1);
                if let Some(p) = at {
                    batch.push(Primitive::MoveTo(p));
                }
                let click = Primitive::Click {
                    button: kind.button(),
                    at,
                };
                batch.extend(std::iter::repeat_n(click, kind.repeat()));
                self.issue(held, batch).await?
            }
            Action::Drag { from, to } => {
                let from = from.map(|p| to_physical(p, profile)).transpose()?;
                let to = to_physical(*to, profile)?;
                let mut batch = Vec::with_capacity(4);
                if let Some(p) = from {
                    batch.push(Primitive::MoveTo(p));
                }
                batch.push(Primitive::ButtonDown(from));
                batch.push(Primitive::MoveTo(to));
                batch.push(Primitive::ButtonUp(Some(to)));
                self.issue(held, batch).await?
            }
            Action::MouseDown => self.issue(held, vec![Primitive::ButtonDown(None)]).await?,
            Action::MouseUp => self.issue(held, vec![Primitive::ButtonUp(None)]).await?,
            Action::KeyPress { key } => {
                let batch = vec![Primitive::KeyDown(key.clone()), Primitive::KeyUp(key.clone())];
                self.issue(held, batch).await?
            }
            Action::KeyCombo { chord } => {
                let presses = chord.presses();
                let batch = presses
                    .iter()
                    .cloned()
                    .map(Primitive::KeyDown)
                    .chain(presses.iter().rev().cloned().map(Primitive::KeyUp))
                    .collect();
                self.issue(held, batch).await?
            }
            Action::HoldKey { key, duration } => {
                let duration = (*duration).min(self.settings.max_hold);
                let mut output = self.issue(held, vec![Primitive::KeyDown(key.clone())]).await?;
                let completed = suspend(duration, cancel).await;
                output.push_str(&self.issue(held, vec![Primitive::KeyUp(key.clone())]).await?);
                if completed {
                    format!("{output}Held {key} for {:.1}s", duration.as_secs_f64())
                } else {
                    format!("{output}Released {key} early: session cancelled")
                }
            }
            Action::TypeText { text } => self.type_text(text, held).await?,
            Action::Scroll {
                at,
                direction,
                amount,
            } => {
                let at = to_physical(*at, profile)?;
                let steps = (*amount).min(self.settings.max_scroll);
                let mut batch = vec![Primitive::MoveTo(at)];
                batch.extend(std::iter::repeat_n(
                    Primitive::ScrollStep(*direction),
                    steps as usize,
                ));
                let output = self.issue(held, batch).await?;
                if steps < *amount {
                    format!("{output}Scrolled {steps} of {amount} requested steps")
                } else {
                    output
                }
            }
            Action::Wait { duration } => {
                if suspend(*duration, cancel).await {
                    format!("Waited for {:.1} seconds", duration.as_secs_f64())
                } else {
                    "Wait interrupted: session cancelled".to_string()
                }
            }
            Action::Screenshot => String::new(),
            Action::CursorPosition => {
                let timeout = self.settings.action_timeout;
                let physical = tokio::time::timeout(timeout, self.driver.cursor_position())
                    .await
                    .map_err(|_| CommandError::Timeout(timeout))??;
                let logical = to_logical(physical, profile)?;
                format!("X={},Y={}", logical.x, logical.y)
            }
        };
        Ok(output)
    }

    async fn type_text(&self, text: &str, held: &mut HeldInputs) -> Result<String, DispatchError> {
        let chars: Vec<char> = text.chars().collect();
        let chunks: Vec<String> = chars
            .chunks(self.settings.typing_chunk.max(1))
            .map(|chunk| chunk.iter().collect())
            .collect();

        let mut output = String::new();
        for (i, chunk) in chunks.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.settings.typing_delay).await;
            }
            match self.issue(held, vec![Primitive::TypeText(chunk.clone())]).await {
                Ok(out) => output.push_str(&out),
                Err(source) => {
                    return Err(DispatchError::Partial {
                        output,
                        done: i,
                        total: chunks.len(),
                        source,
                    });
                }
            }
        }
        Ok(output)
    }

    async fn issue(
        &self,
        held: &mut HeldInputs,
        batch: Vec<Primitive>,
    ) -> Result<String, CommandError> {
        debug!("[hands] issuing {:?}", batch);
        let timeout = self.settings.action_timeout;
        let outcome = match tokio::time::timeout(timeout, self.driver.issue(&batch)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(CommandError::Timeout(timeout)),
        };

        match outcome {
            Ok(output) => {
                held.track(&batch);
                Ok(output)
            }
            Err(e) => {
                held.assume_pressed(&batch);
                if let Err(release) = self.release_held(held).await {
                    warn!("[hands] releasing inputs after failure also failed: {}", release);
                }
                Err(e)
            }
        }
    }

    async fn release_held(&self, held: &mut HeldInputs) -> Result<(), CommandError> {
        let batch = held.release_batch();
        if batch.is_empty() {
            return Ok(());
        }
        info!("[hands] releasing held inputs: {:?}", batch);
        let timeout = self.settings.action_timeout;
        match tokio::time::timeout(timeout, self.driver.issue(&batch)).await {
            Ok(result) => result.map(|_| ()),
            Err(_) => Err(CommandError::Timeout(timeout)),
        }
    }

    async fn attach_screenshot(&self, result: &mut ActionResult, profile: &DisplayProfile) {
        match self.screen.capture(profile).await {
            Ok(image) => result.image = Some(image),
            Err(e) => {
                warn!("[hands] screenshot failed: {}", e);
                result.push_error(format!("screenshot failed: {e}"));
            }
        }
    }
}

/// Sleeps for `duration` unless cancelled first. Returns whether the full
/// duration elapsed.
pub async fn suspend(duration: Duration, cancel: &CancellationToken) -> bool {
    if duration.is_zero() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = cancel.cancelled() => false,
    }
}
