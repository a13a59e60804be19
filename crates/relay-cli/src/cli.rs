//! CLI command definitions using clap

use crate::output::OutputFormat;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Relay CLI - route prompts across local and remote models
#[derive(Parser)]
#[command(name = "relay")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json, table)
    #[arg(short = 'o', long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    pub output: OutputFormat,

    /// Configuration file path
    #[arg(
        short = 'c',
        long,
        global = true,
        env = "RELAY_CONFIG_PATH",
        default_value = "relay.yaml"
    )]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Send one prompt and stream the response
    Run(RunArgs),

    /// List declared models and their lifecycle state
    Models {
        /// Load the configured preload list first
        #[arg(long)]
        preload: bool,
    },

    /// Show registry health and capacity
    Health {
        /// Load the configured preload list first
        #[arg(long)]
        preload: bool,
    },

    /// Check the configuration file without loading any model
    Validate,
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// User prompt
    pub prompt: String,

    /// Serve from this model only (no fallback)
    #[arg(short, long)]
    pub model: Option<String>,

    /// System instruction placed before the prompt
    #[arg(short, long)]
    pub system: Option<String>,

    #[arg(long)]
    pub temperature: Option<f64>,

    #[arg(long)]
    pub top_p: Option<f64>,

    #[arg(long)]
    pub max_tokens: Option<u32>,

    /// Stop sequence (repeatable)
    #[arg(long = "stop")]
    pub stop: Vec<String>,

    /// Extra shaping knob as NAME=VALUE (repeatable)
    #[arg(long = "param", value_parser = parse_param)]
    pub params: Vec<(String, f64)>,

    /// Capability the serving model must declare (repeatable)
    #[arg(long = "require")]
    pub require: Vec<String>,
}

fn parse_param(raw: &str) -> Result<(String, f64), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got '{raw}'"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("missing parameter name in '{raw}'"));
    }
    let value: f64 = value
        .trim()
        .parse()
        .map_err(|e| format!("invalid value for '{name}': {e}"))?;
    Ok((name.to_string(), value))
}
