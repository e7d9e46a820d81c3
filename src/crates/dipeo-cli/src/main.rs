//! `dipeo`: run and inspect DiPeO diagrams from the command line.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;

use dipeo_core::services::{ServiceError, UserInputService};
use dipeo_core::{
    compile, decompile, DiagramSpec, EventType, ExecutionEngine, ExecutionOptions,
    ExecutionStatus, ServiceRegistry,
};
use dipeo_llm::MockLlm;

#[derive(Parser)]
#[command(name = "dipeo", version, about = "DiPeO diagram execution engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Base directory for file and diagram storage services.
    #[arg(long, global = true, default_value = ".")]
    base_dir: PathBuf,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a diagram and stream its events.
    Execute {
        /// Diagram file (.json / .yaml) or stored diagram id.
        diagram: String,
        /// Initial execution variables as key=value pairs.
        #[arg(long = "var", value_parser = parse_key_val)]
        vars: Vec<(String, Value)>,
        /// Capture per-node metrics in completion events.
        #[arg(long)]
        debug: bool,
        /// Default person_job iteration cap.
        #[arg(long, default_value_t = 100)]
        max_iterations: u32,
        /// Wall-clock limit in seconds.
        #[arg(long)]
        timeout: Option<u64>,
        /// Use the scripted mock LLM instead of a real provider.
        #[arg(long)]
        mock_llm: bool,
    },

    /// Compile a diagram and report diagnostics.
    Compile { diagram: String },

    /// Convert a diagram between JSON and YAML through compile/decompile.
    Convert { input: PathBuf, output: PathBuf },

    /// Print node and edge statistics for a diagram.
    Stats { diagram: String },

    /// Execute with metrics capture and print per-node timings.
    Metrics { diagram: String },
}

fn parse_key_val(s: &str) -> std::result::Result<(String, Value), String> {
    let (key, raw) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{s}'"))?;
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((key.to_string(), value))
}

/// Interactive stdin answers for `user_response` nodes.
struct StdinUserInput;

#[async_trait::async_trait]
impl UserInputService for StdinUserInput {
    async fn ask(&self, prompt: &str, timeout_seconds: u64) -> std::result::Result<String, ServiceError> {
        println!("{prompt}");
        let read = tokio::task::spawn_blocking(|| {
            let mut line = String::new();
            std::io::stdin().read_line(&mut line).map(|_| line)
        });
        match tokio::time::timeout(std::time::Duration::from_secs(timeout_seconds), read).await {
            Ok(Ok(Ok(line))) => Ok(line.trim_end().to_string()),
            Ok(Ok(Err(e))) => Err(ServiceError::Io(e)),
            Ok(Err(e)) => Err(ServiceError::Other(e.to_string())),
            Err(_) => Ok(String::new()),
        }
    }
}

async fn load_spec(reference: &str, base_dir: &Path) -> Result<DiagramSpec> {
    let path = if Path::new(reference).exists() {
        PathBuf::from(reference)
    } else {
        // Treat the reference as a stored diagram id.
        let storage = dipeo_core::services::LocalDiagramStorage::new(base_dir);
        use dipeo_core::services::DiagramStorage;
        PathBuf::from(
            storage
                .find_by_id(reference)
                .await
                .with_context(|| format!("diagram '{reference}' not found"))?,
        )
    };

    let text = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    parse_spec(&text, &path)
}

fn parse_spec(text: &str, path: &Path) -> Result<DiagramSpec> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => DiagramSpec::from_json(text).context("parsing JSON diagram"),
        _ => DiagramSpec::from_yaml(text).context("parsing YAML diagram"),
    }
}

fn compile_or_report(spec: &DiagramSpec) -> Result<Arc<dipeo_core::ExecutableDiagram>> {
    let result = compile(spec);
    for diagnostic in result.warnings.iter().chain(&result.infos) {
        eprintln!("{diagnostic}");
    }
    if !result.errors.is_empty() {
        for diagnostic in &result.errors {
            eprintln!("{diagnostic}");
        }
        bail!("compilation failed with {} error(s)", result.errors.len());
    }
    Ok(Arc::new(result.diagram.expect("diagram present without errors")))
}

fn services_for(base_dir: &Path, mock_llm: bool) -> ServiceRegistry {
    let mut services = ServiceRegistry::local(base_dir).with_user_input(Arc::new(StdinUserInput));
    if mock_llm {
        services = services.with_llm(Arc::new(MockLlm::new()));
    }
    services
}

async fn run_execute(
    spec: DiagramSpec,
    base_dir: &Path,
    options: ExecutionOptions,
    mock_llm: bool,
    print_metrics: bool,
) -> Result<i32> {
    let diagram = compile_or_report(&spec)?;
    let engine = ExecutionEngine::with_builtins();
    let services = services_for(base_dir, mock_llm);

    let mut handle = engine.execute(diagram, options, services);
    let mut events = handle.take_events().expect("fresh handle");
    let mut metrics: Vec<(String, u64)> = Vec::new();

    while let Some(event) = events.next().await {
        let node = event.node_id.as_deref().unwrap_or("-");
        println!("[{:>4}] {:?} {}", event.sequence, event.event_type, node);

        if event.event_type == EventType::NodeFailed {
            if let Some(error) = event.data.get("error").and_then(Value::as_str) {
                eprintln!("       error: {error}");
            }
        }
        if print_metrics && event.event_type == EventType::NodeCompleted {
            if let Some(duration) = event
                .data
                .pointer("/metrics/duration_ms")
                .and_then(Value::as_u64)
            {
                metrics.push((node.to_string(), duration));
            }
        }
        if event.event_type.is_terminal() {
            break;
        }
    }

    let state = handle.wait().await;

    if print_metrics {
        println!("\nper-node metrics:");
        for (node, duration) in &metrics {
            println!("  {node:<24} {duration:>8} ms");
        }
        println!(
            "  token usage: input={} output={} total={}",
            state.token_usage.input, state.token_usage.output, state.token_usage.total
        );
    }

    Ok(match state.status {
        ExecutionStatus::Completed => 0,
        _ => 1,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let base_dir = cli.base_dir.clone();

    let exit_code = match cli.command {
        Command::Execute { diagram, vars, debug, max_iterations, timeout, mock_llm } => {
            let spec = load_spec(&diagram, &base_dir).await?;
            let options = ExecutionOptions {
                variables: vars.into_iter().collect::<BTreeMap<_, _>>(),
                debug_mode: debug,
                max_iterations,
                timeout_seconds: timeout,
                ..Default::default()
            };
            run_execute(spec, &base_dir, options, mock_llm, false).await?
        }

        Command::Compile { diagram } => {
            let spec = load_spec(&diagram, &base_dir).await?;
            match compile_or_report(&spec) {
                Ok(diagram) => {
                    println!(
                        "ok: {} nodes, {} edges",
                        diagram.nodes().len(),
                        diagram.edges().len()
                    );
                    0
                }
                Err(e) => {
                    eprintln!("{e}");
                    1
                }
            }
        }

        Command::Convert { input, output } => {
            let text = tokio::fs::read_to_string(&input)
                .await
                .with_context(|| format!("reading {}", input.display()))?;
            let spec = parse_spec(&text, &input)?;
            let diagram = compile_or_report(&spec)?;
            let round = decompile(&diagram);

            let rendered = match output.extension().and_then(|e| e.to_str()) {
                Some("json") => round.to_json().context("rendering JSON")?,
                _ => round.to_yaml().context("rendering YAML")?,
            };
            tokio::fs::write(&output, rendered)
                .await
                .with_context(|| format!("writing {}", output.display()))?;
            println!("wrote {}", output.display());
            0
        }

        Command::Stats { diagram } => {
            let spec = load_spec(&diagram, &base_dir).await?;
            let diagram = compile_or_report(&spec)?;
            println!("nodes: {}", diagram.nodes().len());
            println!("edges: {}", diagram.edges().len());
            println!("persons: {}", diagram.persons().count());
            for (node_type, count) in diagram.type_counts() {
                println!("  {node_type:<16} {count}");
            }
            0
        }

        Command::Metrics { diagram } => {
            let spec = load_spec(&diagram, &base_dir).await?;
            let options = ExecutionOptions { debug_mode: true, ..Default::default() };
            run_execute(spec, &base_dir, options, true, true).await?
        }
    };

    std::process::exit(exit_code);
}
