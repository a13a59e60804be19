//! `relay run` command implementation

use std::io::Write;
use std::path::Path;

use colored::Colorize;
use futures::StreamExt;
use relay_foundation::GenerationHandle;
use relay_kernel::{
    CapabilityRequirements, ConversationTurn, FinishReason, InboundRequest, ResponseChunk,
    ShapingParameters,
};
use serde::Serialize;

use super::open_registry;
use crate::CliError;
use crate::cli::RunArgs;
use crate::output::{OutputFormat, print_json};

/// Execute the `relay run` command
pub async fn run(config: &Path, args: RunArgs, format: OutputFormat) -> Result<(), CliError> {
    let (relay_config, registry) = open_registry(config, false).await?;
    let orchestrator = relay_config.build_orchestrator(registry.clone());
    let request = build_request(args);

    let mut handle = orchestrator.submit(request);
    let summary = match format {
        OutputFormat::Json => collect(&mut handle).await,
        OutputFormat::Text | OutputFormat::Table => stream_to_stdout(&mut handle).await?,
    };
    let attempts = handle.attempts();
    drop(handle);
    registry.shutdown().await;

    if format == OutputFormat::Json {
        print_json(&RunReport {
            summary: &summary,
            attempts: &attempts,
        })?;
    } else {
        print_summary(&summary);
    }

    match summary.terminal.finish_reason {
        Some(FinishReason::Stop | FinishReason::Length) => Ok(()),
        Some(FinishReason::Cancelled) => Err(CliError::GenerationFailed("cancelled".into())),
        _ => Err(CliError::GenerationFailed(
            summary
                .terminal
                .error
                .clone()
                .unwrap_or_else(|| "no terminal chunk received".to_string()),
        )),
    }
}

fn build_request(args: RunArgs) -> InboundRequest {
    let mut history = Vec::new();
    if let Some(system) = args.system {
        history.push(ConversationTurn::system(system));
    }
    history.push(ConversationTurn::user(args.prompt));

    let mut shaping = ShapingParameters::new();
    if let Some(t) = args.temperature {
        shaping = shaping.with(ShapingParameters::TEMPERATURE, t);
    }
    if let Some(p) = args.top_p {
        shaping = shaping.with(ShapingParameters::TOP_P, p);
    }
    if let Some(n) = args.max_tokens {
        shaping = shaping.with(ShapingParameters::MAX_TOKENS, f64::from(n));
    }
    for (name, value) in args.params {
        shaping = shaping.with(name, value);
    }

    let required = args
        .require
        .into_iter()
        .fold(CapabilityRequirements::none(), |req, tag| req.require(tag));

    let mut request = InboundRequest::new(history)
        .with_shaping(shaping)
        .with_requirements(required);
    if let Some(model) = args.model {
        request = request.with_model_hint(model);
    }
    for stop in args.stop {
        request = request.with_stop(stop);
    }
    request
}

#[derive(Debug, Serialize)]
struct RunSummary {
    text: String,
    terminal: ResponseChunk,
}

#[derive(Serialize)]
struct RunReport<'a> {
    #[serde(flatten)]
    summary: &'a RunSummary,
    attempts: &'a [relay_foundation::AttemptRecord],
}

fn missing_terminal(sequence: u64) -> ResponseChunk {
    let mut chunk = ResponseChunk::terminal(sequence, FinishReason::Error);
    chunk.error = Some("session ended without a terminal chunk".to_string());
    chunk
}

async fn collect(handle: &mut GenerationHandle) -> RunSummary {
    let mut text = String::new();
    let mut sequence = 0;
    while let Some(chunk) = handle.next().await {
        if chunk.done {
            return RunSummary {
                text,
                terminal: chunk,
            };
        }
        text.push_str(&chunk.text_delta);
        sequence = chunk.sequence + 1;
    }
    RunSummary {
        text,
        terminal: missing_terminal(sequence),
    }
}

/// Print deltas as they arrive; Ctrl-C cancels the request.
async fn stream_to_stdout(handle: &mut GenerationHandle) -> Result<RunSummary, CliError> {
    let mut stdout = std::io::stdout();
    let mut text = String::new();
    let mut sequence = 0;
    let mut interrupted = false;

    loop {
        let next = tokio::select! {
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                handle.cancel();
                continue;
            }
            next = handle.next() => next,
        };
        let Some(chunk) = next else { break };
        if chunk.done {
            if !text.is_empty() {
                writeln!(stdout)?;
            }
            return Ok(RunSummary {
                text,
                terminal: chunk,
            });
        }
        write!(stdout, "{}", chunk.text_delta)?;
        stdout.flush()?;
        text.push_str(&chunk.text_delta);
        sequence = chunk.sequence + 1;
    }
    Ok(RunSummary {
        text,
        terminal: missing_terminal(sequence),
    })
}

fn print_summary(summary: &RunSummary) {
    let terminal = &summary.terminal;
    for warning in &terminal.warnings {
        eprintln!("{} {}", "!".yellow(), warning);
    }
    let model = terminal
        .model_id
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_else(|| "-".to_string());
    let reason = terminal
        .finish_reason
        .map(FinishReason::as_str)
        .unwrap_or("error");

    match terminal.finish_reason {
        Some(FinishReason::Stop | FinishReason::Length) => {
            eprintln!("{} model={} finish={}", "✓".green(), model, reason);
        }
        _ => {
            let mut line = format!("{} model={} finish={}", "✗".red(), model, reason);
            if terminal.incomplete {
                line.push_str(" (incomplete)");
            }
            eprintln!("{line}");
            if let Some(error) = &terminal.error {
                eprintln!("  {}", error.red());
            }
        }
    }
}
