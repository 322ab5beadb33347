mod face;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use dotenvy::dotenv;
use mac_computer_control::logging::init_logging;
use mac_computer_control::{Agent, AgentConfig, EventKind, SessionEvent, SessionOutcome};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "agent", version, about = "Let a vision model operate this Mac")]
struct Args {
    /// Run one task in the terminal instead of serving the web UI
    #[arg(short, long)]
    task: Option<String>,

    /// Model name (defaults to COMPUTER_CONTROL_MODEL or the built-in default)
    #[arg(long)]
    model: Option<String>,

    /// Maximum model turns per session
    #[arg(long, env = "COMPUTER_CONTROL_MAX_TURNS", default_value_t = 50)]
    max_turns: u32,

    /// Stop a session once this many tokens have been used
    #[arg(long, env = "COMPUTER_CONTROL_TOKEN_BUDGET")]
    token_budget: Option<u64>,

    /// Pause before the screenshot that follows an action, in milliseconds
    #[arg(long, env = "COMPUTER_CONTROL_SETTLE_MS", default_value_t = 1000)]
    settle_ms: u64,

    /// Characters per text-entry command
    #[arg(long, env = "COMPUTER_CONTROL_TYPING_CHUNK", default_value_t = 50)]
    typing_chunk: usize,

    /// Per-turn model timeout, in seconds
    #[arg(long, env = "COMPUTER_CONTROL_TURN_TIMEOUT", default_value_t = 120)]
    turn_timeout: u64,

    /// Send full-resolution screenshots and coordinates
    #[arg(long, env = "COMPUTER_CONTROL_NO_SCALING")]
    no_scaling: bool,

    /// Describe the tool with a JSON schema instead of the built-in computer tool
    #[arg(long)]
    custom_tool: bool,

    /// Where to save the last screen of a session that did not finish
    #[arg(long, env = "COMPUTER_CONTROL_SCREENSHOT_DIR")]
    screenshot_dir: Option<PathBuf>,

    /// First port to try for the web UI
    #[arg(long, env = "COMPUTER_CONTROL_PORT", default_value_t = 3000)]
    port: u16,
}

impl Args {
    fn apply(&self, mut config: AgentConfig) -> AgentConfig {
        if let Some(model) = &self.model {
            config.model = model.clone();
        }
        config.max_turns = self.max_turns;
        config.token_budget = self.token_budget;
        config.settle_delay = Duration::from_millis(self.settle_ms);
        config.typing_chunk = self.typing_chunk;
        config.turn_timeout = Duration::from_secs(self.turn_timeout);
        config.scaling = !self.no_scaling;
        config.native_tool = !self.custom_tool;
        if let Some(dir) = &self.screenshot_dir {
            config.screenshot_dir = Some(dir.clone());
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let args = Args::parse();
    init_logging();

    let config = args.apply(AgentConfig::from_env());
    if config.api_key.is_none() {
        bail!("ANTHROPIC_API_KEY not set in environment");
    }

    let agent = Agent::for_macos(config);
    info!(
        "[agent] model {} with up to {} turns",
        agent.config().model,
        agent.config().max_turns
    );
    match &args.task {
        Some(task) => run_once(&agent, task).await,
        None => face::serve(agent, args.port).await,
    }
}

async fn run_once(agent: &Agent, task: &str) -> Result<()> {
    let mut events = agent.subscribe();
    let handle = agent
        .start_session(task)
        .await
        .context("could not read the display size (is cliclick installed?)")?;

    let cancel = handle.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Cancelling, releasing held keys...");
            cancel.cancel();
        }
    });

    loop {
        match events.recv().await {
            Ok(event) if event.session_id == handle.id() => {
                print_event(&event);
                if event.kind.is_terminal() {
                    break;
                }
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => warn!("[agent] missed {} events", skipped),
            Err(RecvError::Closed) => break,
        }
    }

    let report = handle.join().await.context("session task panicked")?;
    info!(
        "[agent] {} turns, {} tokens",
        report.turns, report.tokens_used
    );
    match report.outcome {
        SessionOutcome::Failed { error } => bail!("session failed: {error}"),
        SessionOutcome::Cancelled => bail!("session cancelled"),
        SessionOutcome::Completed { .. } | SessionOutcome::BudgetExhausted { .. } => Ok(()),
    }
}

fn print_event(event: &SessionEvent) {
    match &event.kind {
        EventKind::TurnStarted { turn } => println!("--- turn {turn}"),
        EventKind::ModelText { text } => println!("{text}"),
        EventKind::ActionDispatched { input, .. } => println!("> {input}"),
        EventKind::ActionResult {
            output,
            error,
            has_image,
            ..
        } => {
            if !output.is_empty() {
                println!("  {output}");
            }
            if let Some(error) = error {
                println!("  error: {error}");
            }
            if *has_image {
                println!("  (screenshot)");
            }
        }
        EventKind::Done {
            final_text,
            warning,
            screenshot,
        } => {
            println!("Done: {final_text}");
            if let Some(warning) = warning {
                println!("Stopped early: {warning}");
            }
            if let Some(path) = screenshot {
                println!("Last screen: {}", path.display());
            }
        }
        EventKind::Failed {
            message,
            screenshot,
        } => {
            println!("Failed: {message}");
            if let Some(path) = screenshot {
                println!("Last screen: {}", path.display());
            }
        }
        EventKind::Cancelled { screenshot } => {
            println!("Cancelled.");
            if let Some(path) = screenshot {
                println!("Last screen: {}", path.display());
            }
        }
    }
}
