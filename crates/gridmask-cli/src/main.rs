//! CLI for gridmask.
//!
//! Runs recorded policy outputs through the masked action selector, keeps the
//! global step counter in a state file between runs, and evaluates the
//! configured schedules. It is the operational interface for checking
//! masking behaviour outside a training run.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gridmask_core::{
    InferenceInput, InferenceOutput, ModelCapability, ModelError, PolicyModel, StepInfo,
};
use gridmask_select::{Exploration, MaskedActionSelector, SelectError, SelectorConfig};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

const FALLBACK_TIMESTAMP: &str = "1970-01-01T00:00:00Z";

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Select actions for recorded policy outputs (JSONL)
    Select {
        /// Run config: selector settings plus the model's action space
        #[arg(long)]
        config: PathBuf,

        /// Input file with one step record per line; "-" reads stdin
        #[arg(long, default_value = "-")]
        input: PathBuf,

        /// Path to the state file holding the global step counter
        #[arg(long, default_value = "data/gridmask.state.json")]
        state_file: PathBuf,

        /// Seed for the exploration RNG
        #[arg(long)]
        seed: Option<u64>,

        /// Number of records per selector call
        #[arg(long, default_value = "32")]
        batch_size: usize,

        /// Override the config's explore flag
        #[arg(long)]
        explore: Option<bool>,
    },
    /// Print schedule values at a timestep
    Schedule {
        #[arg(long)]
        config: PathBuf,

        /// Explicit timestep; defaults to the state file's counter
        #[arg(long)]
        timestep: Option<u64>,

        #[arg(long, default_value = "data/gridmask.state.json")]
        state_file: PathBuf,
    },
    /// Check legality trees in info lines against the configured action space
    Tree {
        #[arg(long)]
        config: PathBuf,

        /// Input file with one info object per line; "-" reads stdin
        #[arg(long, default_value = "-")]
        input: PathBuf,
    },
}

/// Selector config plus the action space of the recorded model.
#[derive(Deserialize, Debug)]
struct RunConfig {
    model: ModelCapability,
    #[serde(flatten)]
    selector: SelectorConfig,
}

impl RunConfig {
    fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open config {}", path.display()))?;
        let config: RunConfig = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config.selector.validate()?;
        Ok(config)
    }
}

#[derive(Serialize, Deserialize, Debug)]
struct StepState {
    global_timestep: u64,
    #[serde(with = "time::serde::iso8601::option")]
    last_ok: Option<OffsetDateTime>,
    last_error: Option<String>,
}

impl StepState {
    fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let file = File::open(path)?;
        let state: StepState = serde_json::from_reader(file)?;
        Ok(Some(state))
    }

    fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }
}

fn record_state_error(state_file: &Path, global_timestep: u64, err_msg: &str) -> Result<()> {
    let old_last_ok = if let Ok(Some(s)) = StepState::load(state_file) {
        s.last_ok
    } else {
        None
    };

    let state = StepState {
        global_timestep,
        last_ok: old_last_ok,
        last_error: Some(err_msg.to_string()),
    };

    if let Err(e) = state.save(state_file) {
        tracing::error!(
            "failed to save error state to {}; original error: {err_msg}; save error: {e}",
            state_file.display()
        );
        return Err(e);
    }

    Ok(())
}

/// One recorded policy step: observation, raw scores, environment info.
#[derive(Deserialize, Debug, Clone)]
struct StepRecord {
    #[serde(default)]
    obs: Value,
    logits: Vec<f32>,
    #[serde(default)]
    info: StepInfo,
}

/// Stand-in model that answers with the scores recorded next to each observation.
struct ReplayModel {
    capability: ModelCapability,
}

impl PolicyModel for ReplayModel {
    type Observation = StepRecord;

    fn capability(&self) -> ModelCapability {
        self.capability.clone()
    }

    fn forward(
        &self,
        input: &InferenceInput<'_, StepRecord>,
    ) -> std::result::Result<InferenceOutput, ModelError> {
        Ok(InferenceOutput {
            scores: input
                .observations
                .iter()
                .map(|record| record.logits.clone())
                .collect(),
            state_out: Vec::new(),
        })
    }
}

#[derive(Serialize, Debug)]
struct SelectionRecord {
    ts: String,
    line: usize,
    timestep: u64,
    action: Vec<u32>,
    logp: f32,
    prob: f32,
    mask: Vec<u8>,
    #[serde(skip_serializing_if = "Value::is_null")]
    obs: Value,
}

fn iso8601_now() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| FALLBACK_TIMESTAMP.to_string())
}

fn open_input(path: &Path) -> Result<Box<dyn BufRead>> {
    if path.as_os_str() == "-" {
        return Ok(Box::new(BufReader::new(io::stdin())));
    }
    let file = File::open(path)
        .with_context(|| format!("Failed to open input file {}", path.display()))?;
    Ok(Box::new(BufReader::new(file)))
}

/// Parses step records lazily, one per non-blank line, with 1-based line numbers.
fn step_records(reader: impl BufRead) -> impl Iterator<Item = Result<(usize, StepRecord)>> {
    reader
        .lines()
        .enumerate()
        .filter_map(|(idx, line)| {
            let line = match line {
                Ok(line) => line,
                Err(e) => return Some(Err(anyhow::Error::from(e))),
            };
            if line.trim().is_empty() {
                return None;
            }
            Some(
                serde_json::from_str::<StepRecord>(&line)
                    .map(|record| (idx + 1, record))
                    .with_context(|| format!("Invalid step record on line {}", idx + 1)),
            )
        })
}

/// Runs `records` through the selector in batches of `batch_size` as they
/// arrive and writes one JSON line per example to `out`.
fn run_batches(
    selector: &MaskedActionSelector<ReplayModel>,
    records: impl IntoIterator<Item = Result<(usize, StepRecord)>>,
    batch_size: usize,
    explore: Option<bool>,
    rng: &mut StdRng,
    out: &mut impl Write,
) -> Result<usize> {
    let batch_size = batch_size.max(1);
    let mut lines = Vec::with_capacity(batch_size);
    let mut observations = Vec::with_capacity(batch_size);
    let mut written = 0;

    for record in records {
        let (line, record) = record?;
        lines.push(line);
        observations.push(record);
        if observations.len() == batch_size {
            written += select_batch(selector, &lines, &observations, explore, rng, out)?;
            lines.clear();
            observations.clear();
        }
    }
    if !observations.is_empty() {
        written += select_batch(selector, &lines, &observations, explore, rng, out)?;
    }
    Ok(written)
}

fn select_batch(
    selector: &MaskedActionSelector<ReplayModel>,
    lines: &[usize],
    observations: &[StepRecord],
    explore: Option<bool>,
    rng: &mut StdRng,
    out: &mut impl Write,
) -> Result<usize> {
    let infos: Vec<StepInfo> = observations.iter().map(|r| r.info.clone()).collect();
    let timestep = selector.timestep().get();

    let selection = selector.select(
        &InferenceInput::new(observations),
        &infos,
        explore,
        None,
        rng,
    )?;

    let side = selection.side_info;
    let mut written = 0;
    for (i, action) in selection.actions.into_iter().enumerate() {
        let record = SelectionRecord {
            ts: iso8601_now(),
            line: lines[i],
            timestep,
            action,
            logp: side.action_logp[i],
            prob: side.action_prob[i],
            mask: side.valid_action_mask[i].clone(),
            obs: observations[i].obs.clone(),
        };
        serde_json::to_writer(&mut *out, &record)?;
        writeln!(out)?;
        written += 1;
    }
    out.flush()?;
    Ok(written)
}

fn run_select(
    config: &Path,
    input: &Path,
    state_file: &Path,
    seed: Option<u64>,
    batch_size: usize,
    explore: Option<bool>,
) -> Result<()> {
    let run_config = RunConfig::load(config)?;
    if !run_config.selector.env_config.invalid_action_masking {
        return Err(SelectError::MaskingDisabled.into());
    }

    let selector = MaskedActionSelector::new(
        run_config.selector,
        ReplayModel {
            capability: run_config.model,
        },
    )?;

    // An unreadable state file must not be replaced by a counter restarted at 0.
    let resumed = StepState::load(state_file).with_context(|| {
        format!(
            "Failed to read state file {}; fix or remove it to continue",
            state_file.display()
        )
    })?;
    if let Some(state) = resumed {
        selector.timestep().set(state.global_timestep);
        tracing::info!("resuming from global timestep {}", state.global_timestep);
    }

    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let outcome = open_input(input).and_then(|reader| {
        let stdout = io::stdout();
        let mut out = stdout.lock();
        run_batches(
            &selector,
            step_records(reader),
            batch_size,
            explore,
            &mut rng,
            &mut out,
        )
    });

    match outcome {
        Ok(count) => {
            StepState {
                global_timestep: selector.timestep().get(),
                last_ok: Some(OffsetDateTime::now_utc()),
                last_error: None,
            }
            .save(state_file)
            .context("Failed to save state")?;
            tracing::info!(
                "selected {count} actions; global timestep now {}",
                selector.timestep().get()
            );
            Ok(())
        }
        Err(e) => {
            let err_msg = format!("{e:#}");
            if let Err(save_err) =
                record_state_error(state_file, selector.timestep().get(), &err_msg)
            {
                tracing::error!("failed to record error state: {save_err}");
            }
            Err(e.context("Selection run failed"))
        }
    }
}

#[derive(Serialize, Debug)]
struct ScheduleReport {
    timestep: u64,
    entropy_coeff: Option<f64>,
    lr: Option<f64>,
    epsilon: Option<f64>,
}

fn schedule_report(config: &SelectorConfig, timestep: u64) -> Result<ScheduleReport> {
    let exploration = Exploration::from_config(&config.exploration_config)?;
    Ok(ScheduleReport {
        timestep,
        entropy_coeff: config.entropy_coeff(timestep),
        lr: config.learning_rate(timestep),
        epsilon: exploration.epsilon(timestep),
    })
}

fn run_tree(config: &Path, input: &Path) -> Result<()> {
    let run_config = RunConfig::load(config)?;
    let depth = run_config.model.tree_depth();
    let mut mismatches = 0;

    for (idx, line) in open_input(input)?.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let info: StepInfo = serde_json::from_str(&line)
            .with_context(|| format!("Invalid info on line {}", idx + 1))?;
        match &info.valid_action_tree {
            Some(tree) if tree.depth() == depth => {
                println!("{}\t{}\tok", idx + 1, tree.count_leaves());
            }
            Some(tree) => {
                mismatches += 1;
                println!(
                    "{}\t{}\tdepth {} != {}",
                    idx + 1,
                    tree.count_leaves(),
                    tree.depth(),
                    depth
                );
            }
            None => println!("{}\t1\tdefault", idx + 1),
        }
    }

    if mismatches > 0 {
        anyhow::bail!("{mismatches} tree(s) do not match the action space");
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".to_string()))
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Select {
            config,
            input,
            state_file,
            seed,
            batch_size,
            explore,
        } => run_select(&config, &input, &state_file, seed, batch_size, explore)?,
        Commands::Schedule {
            config,
            timestep,
            state_file,
        } => {
            let run_config = RunConfig::load(&config)?;
            let timestep = match timestep {
                Some(t) => t,
                None => StepState::load(&state_file)?
                    .map(|s| s.global_timestep)
                    .unwrap_or(0),
            };
            let report = schedule_report(&run_config.selector, timestep)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Tree { config, input } => run_tree(&config, &input)?,
    }

    Ok(())
}
