//! The `aiwf` CLI: a thin binary over the `Orchestrator`. Every subcommand maps
//! to one orchestrator call; the binary's only job is argument parsing, output
//! formatting (`--json` vs `key=value` text), and translating the result into the
//! documented exit code.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use aiwf_engine::{EngineConfig, EngineError, Factories, Orchestrator, ValidateTarget, WorkflowState};

#[derive(Parser)]
#[command(name = "aiwf")]
#[command(version, about = "Deterministic state-machine engine for AI-assisted code generation")]
struct Cli {
    /// Project directory containing (or to contain) `.aiwf/`. Defaults to the current directory.
    #[arg(long, global = true)]
    project_dir: Option<PathBuf>,

    /// Emit a single-line JSON record instead of `key=value` text.
    #[arg(long, global = true)]
    json: bool,

    /// Verbose (debug-level) logging to stderr.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Directory for rolling daily log files. Logging stays stderr-only when unset.
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new session and advance it to PLAN/PROMPT.
    Init {
        /// Profile key registered in the factory (built-in: "echo").
        #[arg(long, default_value = "echo")]
        profile: String,
        /// Context field as `key=value`; repeatable.
        #[arg(long = "context", value_parser = parse_key_val)]
        context: Vec<(String, String)>,
        /// Standards provider key; falls back to the profile's and then the engine's default.
        #[arg(long)]
        standards_provider: Option<String>,
    },
    /// Legacy single-step advance: runs `approve` once and maps pending/cancelled to
    /// their own exit codes.
    Step { session_id: String },
    /// Run the approval gate for the current stage and transition on approval.
    Approve { session_id: String },
    /// Record rejection feedback for the current RESPONSE stage without transitioning.
    Reject { session_id: String, feedback: String },
    /// Clear the current response and re-invoke the AI provider with feedback.
    Retry { session_id: String, feedback: String },
    /// Terminate a session to CANCELLED.
    Cancel { session_id: String },
    /// Print a session's current state.
    Status { session_id: String },
    /// List known session ids.
    List,
    /// Preflight-check a collaborator's configuration.
    Validate {
        /// "ai", "standards", or "all".
        target: String,
        /// Provider key; required unless target is "all".
        key: Option<String>,
    },
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) => Ok((k.to_string(), v.to_string())),
        None => Err(format!("expected key=value, got '{s}'")),
    }
}

fn init_logging(verbose: bool, log_dir: Option<&PathBuf>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "aiwf.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            fmt().with_env_filter(filter).with_writer(writer).with_ansi(false).init();
            Some(guard)
        }
        None => {
            fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
            None
        }
    }
}

#[derive(Serialize)]
struct CommandRecord {
    schema_version: u32,
    command: &'static str,
    exit_code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    phase: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    current_iteration: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pending_approval: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    sessions: Vec<String>,
}

impl CommandRecord {
    fn new(command: &'static str, exit_code: i32) -> Self {
        CommandRecord {
            schema_version: 1,
            command,
            exit_code,
            session_id: None,
            phase: None,
            stage: None,
            status: None,
            current_iteration: None,
            pending_approval: None,
            last_error: None,
            message: None,
            sessions: Vec::new(),
        }
    }

    fn from_state(command: &'static str, exit_code: i32, state: &WorkflowState) -> Self {
        let mut record = Self::new(command, exit_code);
        record.session_id = Some(state.session_id.clone());
        record.phase = Some(state.phase.to_string());
        record.stage = Some(state.stage.to_string());
        record.status = Some(format!("{:?}", state.status));
        record.current_iteration = Some(state.current_iteration);
        record.pending_approval = Some(state.pending_approval);
        record.last_error = state.last_error.clone();
        record
    }

    fn print(&self, json: bool) {
        if json {
            println!("{}", serde_json::to_string(self).expect("CommandRecord always serializes"));
            return;
        }

        println!("command={}", self.command);
        println!("exit_code={}", self.exit_code);
        if let Some(v) = &self.session_id {
            println!("session_id={v}");
        }
        if let Some(v) = &self.phase {
            println!("phase={v}");
        }
        if let Some(v) = &self.stage {
            println!("stage={v}");
        }
        if let Some(v) = &self.status {
            println!("status={v}");
        }
        if let Some(v) = self.current_iteration {
            println!("current_iteration={v}");
        }
        if let Some(v) = self.pending_approval {
            println!("pending_approval={v}");
        }
        if let Some(v) = &self.last_error {
            println!("last_error={v}");
        }
        if let Some(v) = &self.message {
            println!("message={v}");
        }
        for session_id in &self.sessions {
            println!("session={session_id}");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_logging(cli.verbose, cli.log_dir.as_ref());

    let project_dir = match &cli.project_dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("failed to get current directory")?,
    };
    let config = EngineConfig::load(&project_dir).context("failed to load engine configuration")?;
    let orchestrator = Orchestrator::new(config, Factories::default());

    let (record, exit_code) = dispatch(&orchestrator, cli.command)?;
    record.print(cli.json);
    std::process::exit(exit_code);
}

fn dispatch(orchestrator: &Orchestrator, command: Commands) -> Result<(CommandRecord, i32)> {
    match command {
        Commands::Init { profile, context, standards_provider } => {
            let context: HashMap<String, serde_json::Value> = context
                .into_iter()
                .map(|(k, v)| (k, serde_json::Value::String(v)))
                .collect();
            match orchestrator.init(None, &profile, context, HashMap::new(), standards_provider) {
                Ok(state) => Ok((CommandRecord::from_state("init", 0, &state), 0)),
                Err(err) => Ok((error_record("init", &err), 1)),
            }
        }
        Commands::Step { session_id } => match orchestrator.status(&session_id) {
            Ok(before) if before.phase.is_terminal() => {
                let code = if before.phase == aiwf_engine::Phase::Cancelled { 3 } else { 1 };
                Ok((CommandRecord::from_state("step", code, &before), code))
            }
            Ok(_) => match orchestrator.approve(&session_id) {
                Ok(state) if state.pending_approval => Ok((CommandRecord::from_state("step", 2, &state), 2)),
                Ok(state) if state.last_error.is_some() => Ok((CommandRecord::from_state("step", 1, &state), 1)),
                Ok(state) => Ok((CommandRecord::from_state("step", 0, &state), 0)),
                Err(err) => Ok((error_record("step", &err), 1)),
            },
            Err(err) => Ok((error_record("step", &err), 1)),
        },
        Commands::Approve { session_id } => match orchestrator.approve(&session_id) {
            Ok(state) if state.last_error.is_some() => Ok((CommandRecord::from_state("approve", 1, &state), 1)),
            Ok(state) => Ok((CommandRecord::from_state("approve", 0, &state), 0)),
            Err(err) => Ok((error_record("approve", &err), 1)),
        },
        Commands::Reject { session_id, feedback } => match orchestrator.reject(&session_id, feedback) {
            Ok(state) => Ok((CommandRecord::from_state("reject", 0, &state), 0)),
            Err(err) => Ok((error_record("reject", &err), 1)),
        },
        Commands::Retry { session_id, feedback } => match orchestrator.retry(&session_id, feedback) {
            Ok(state) if state.last_error.is_some() => Ok((CommandRecord::from_state("retry", 1, &state), 1)),
            Ok(state) => Ok((CommandRecord::from_state("retry", 0, &state), 0)),
            Err(err) => Ok((error_record("retry", &err), 1)),
        },
        Commands::Cancel { session_id } => match orchestrator.cancel(&session_id) {
            Ok(state) => Ok((CommandRecord::from_state("cancel", 0, &state), 0)),
            Err(err) => Ok((error_record("cancel", &err), 1)),
        },
        Commands::Status { session_id } => match orchestrator.status(&session_id) {
            Ok(state) => Ok((CommandRecord::from_state("status", 0, &state), 0)),
            Err(err) => Ok((error_record("status", &err), 1)),
        },
        Commands::List => match orchestrator.list() {
            Ok(sessions) => {
                let mut record = CommandRecord::new("list", 0);
                record.sessions = sessions;
                Ok((record, 0))
            }
            Err(err) => Ok((error_record("list", &err), 1)),
        },
        Commands::Validate { target, key } => {
            let target = match target.as_str() {
                "all" => ValidateTarget::All,
                "ai" => ValidateTarget::AiProvider(key.context("validate ai requires a provider key")?),
                "standards" => ValidateTarget::StandardsProvider(key.context("validate standards requires a provider key")?),
                other => anyhow::bail!("unknown validate target '{other}': expected ai, standards, or all"),
            };
            let outcomes = orchestrator.validate(target);
            let ok = outcomes.iter().all(|o| o.ok);
            let mut record = CommandRecord::new("validate", if ok { 0 } else { 1 });
            record.message = Some(
                outcomes
                    .iter()
                    .map(|o| format!("{}:{}={}", o.kind, o.key, if o.ok { "ok" } else { "fail" }))
                    .collect::<Vec<_>>()
                    .join(","),
            );
            Ok((record, if ok { 0 } else { 1 }))
        }
    }
}

fn error_record(command: &'static str, err: &EngineError) -> CommandRecord {
    let mut record = CommandRecord::new(command, 1);
    record.last_error = Some(err.to_string());
    record
}
