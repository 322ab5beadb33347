#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use image::{DynamicImage, Rgba, RgbaImage};
use mac_computer_control::error::{CaptureError, CommandError, ModelServiceError};
use mac_computer_control::types::{ContentBlock, PhysicalPoint};
use mac_computer_control::{
    DispatchSettings, Dispatcher, DisplayProfile, InputDriver, ModelRequest, ModelResponse,
    ModelService, Primitive, Resolution, ScreenCapturer, ScreenshotProvider, Usage,
};
use mac_computer_control::retry::RetryPolicy;
use serde_json::Value;

type FailWhen = Box<dyn Fn(&[Primitive]) -> bool + Send + Sync>;

/// Records every batch it is asked to issue.
pub struct RecordingDriver {
    size: Resolution,
    cursor: PhysicalPoint,
    batches: Mutex<Vec<Vec<Primitive>>>,
    fail_when: Option<FailWhen>,
}

impl RecordingDriver {
    pub fn new(size: Resolution) -> Self {
        Self {
            size,
            cursor: PhysicalPoint { x: 0, y: 0 },
            batches: Mutex::new(Vec::new()),
            fail_when: None,
        }
    }

    pub fn with_cursor(mut self, cursor: PhysicalPoint) -> Self {
        self.cursor = cursor;
        self
    }

    /// Batches matching `predicate` are recorded, then fail with exit status 1.
    pub fn failing(mut self, predicate: impl Fn(&[Primitive]) -> bool + Send + Sync + 'static) -> Self {
        self.fail_when = Some(Box::new(predicate));
        self
    }

    pub fn batches(&self) -> Vec<Vec<Primitive>> {
        self.batches.lock().unwrap().clone()
    }

    pub fn primitives(&self) -> Vec<Primitive> {
        self.batches().into_iter().flatten().collect()
    }
}

#[async_trait]
impl InputDriver for RecordingDriver {
    async fn display_size(&self) -> Result<Resolution, CommandError> {
        Ok(self.size)
    }

    async fn issue(&self, batch: &[Primitive]) -> Result<String, CommandError> {
        self.batches.lock().unwrap().push(batch.to_vec());
        match &self.fail_when {
            Some(predicate) if predicate(batch) => Err(CommandError::Exit {
                program: "cliclick".into(),
                code: Some(1),
                stderr: "injected failure".into(),
            }),
            _ => Ok(String::new()),
        }
    }

    async fn cursor_position(&self) -> Result<PhysicalPoint, CommandError> {
        Ok(self.cursor)
    }
}

/// A capturer that returns a flat frame of the display size and counts calls.
pub struct SolidCapturer {
    size: Resolution,
    captures: AtomicUsize,
    broken: bool,
}

impl SolidCapturer {
    pub fn new(size: Resolution) -> Self {
        Self {
            size,
            captures: AtomicUsize::new(0),
            broken: false,
        }
    }

    pub fn broken(size: Resolution) -> Self {
        Self {
            broken: true,
            ..Self::new(size)
        }
    }

    pub fn captures(&self) -> usize {
        self.captures.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ScreenCapturer for SolidCapturer {
    async fn grab(&self) -> Result<DynamicImage, CaptureError> {
        self.captures.fetch_add(1, Ordering::SeqCst);
        if self.broken {
            return Err(CaptureError::Unavailable("display is asleep".into()));
        }
        Ok(DynamicImage::ImageRgba8(RgbaImage::from_pixel(
            self.size.width,
            self.size.height,
            Rgba([20, 20, 30, 255]),
        )))
    }
}

pub struct Rig {
    pub driver: Arc<RecordingDriver>,
    pub capturer: Arc<SolidCapturer>,
    pub dispatcher: Arc<Dispatcher>,
    pub profile: DisplayProfile,
}

impl Rig {
    pub fn new(physical: Resolution) -> Self {
        Self::with_parts(
            RecordingDriver::new(physical),
            SolidCapturer::new(physical),
            DispatchSettings::default(),
        )
    }

    pub fn with_parts(
        driver: RecordingDriver,
        capturer: SolidCapturer,
        settings: DispatchSettings,
    ) -> Self {
        let driver = Arc::new(driver);
        let capturer = Arc::new(capturer);
        let physical = capturer.size;
        let screen = ScreenshotProvider::new(capturer.clone(), RetryPolicy::none());
        let dispatcher = Arc::new(Dispatcher::new(driver.clone(), screen, settings));
        let profile = DisplayProfile::detect(physical, true).unwrap();
        Self {
            driver,
            capturer,
            dispatcher,
            profile,
        }
    }
}

/// Replays canned responses in order; answers "done" once they run out.
pub struct ScriptedModel {
    responses: Mutex<VecDeque<Result<ModelResponse, ModelServiceError>>>,
    calls: AtomicUsize,
    history_lengths: Mutex<Vec<usize>>,
}

impl ScriptedModel {
    pub fn new(responses: Vec<Result<ModelResponse, ModelServiceError>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            calls: AtomicUsize::new(0),
            history_lengths: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn history_lengths(&self) -> Vec<usize> {
        self.history_lengths.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelService for ScriptedModel {
    async fn respond(&self, request: &ModelRequest<'_>) -> Result<ModelResponse, ModelServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.history_lengths
            .lock()
            .unwrap()
            .push(request.history.len());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(reply(vec![text("done")])))
    }
}

/// A model that keeps asking for the same action forever.
pub struct LoopingModel {
    pub input: Value,
    pub tokens_per_turn: u64,
    calls: AtomicUsize,
}

impl LoopingModel {
    pub fn new(input: Value, tokens_per_turn: u64) -> Self {
        Self {
            input,
            tokens_per_turn,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelService for LoopingModel {
    async fn respond(&self, _request: &ModelRequest<'_>) -> Result<ModelResponse, ModelServiceError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        let mut response = reply(vec![tool_use(&format!("toolu_{n}"), self.input.clone())]);
        response.usage = Usage {
            input_tokens: self.tokens_per_turn,
            output_tokens: 0,
        };
        Ok(response)
    }
}

pub fn text(text: &str) -> ContentBlock {
    ContentBlock::Text { text: text.into() }
}

pub fn tool_use(id: &str, input: Value) -> ContentBlock {
    ContentBlock::ToolUse {
        id: id.into(),
        name: "computer".into(),
        input,
    }
}

pub fn reply(content: Vec<ContentBlock>) -> ModelResponse {
    ModelResponse {
        content,
        usage: Usage::default(),
        stop_reason: None,
    }
}
