#![warn(clippy::unwrap_used, clippy::expect_used)]

//! Maskierte Aktionsauswahl während der Policy-Inferenz.
//!
//! [`MaskedActionSelector`] kapselt ein [`PolicyModel`], führt es auf einem
//! Batch von Beobachtungen aus und wählt pro Beispiel eine Aktion, die im
//! Legalitätsbaum dieses Beispiels steht. Maskierte Scores, Maske und
//! Log-Wahrscheinlichkeit unter der maskierten Verteilung kommen neben den
//! Aktionen zurück, unter den Schlüsseln, die der Trainer erwartet.
//!
//! Die Aktionsraum-Capability des Modells wird einmal beim Bau gelesen;
//! die Auswahl verzweigt danach statisch über [`ModelCapability`].

macro_rules! warn_event {
    ($($arg:tt)*) => {{
        #[cfg(feature = "telemetry")]
        tracing::warn!($($arg)*);
        #[cfg(not(feature = "telemetry"))]
        eprintln!($($arg)*);
    }};
}

macro_rules! debug_event {
    ($($arg:tt)*) => {{
        #[cfg(feature = "telemetry")]
        tracing::debug!($($arg)*);
        #[cfg(not(feature = "telemetry"))]
        let _ = format_args!($($arg)*);
    }};
}

pub mod config;
pub mod distribution;
pub mod error;
pub mod exploration;
pub mod schedule;
pub mod timestep;

pub use config::{EnvConfig, ExplorationConfig, SelectorConfig};
pub use distribution::{
    masked_entropy, masked_log_prob, GridnetMaskedCategorical, MaskedSample, MASKED_LOGIT,
};
pub use error::{ConfigError, Result, SelectError};
pub use exploration::{ConditionalMaskingExploration, Exploration, MaskedActions};
pub use schedule::PiecewiseSchedule;
pub use timestep::GlobalTimestep;

use gridmask_core::{
    ActionTree, InferenceInput, ModelCapability, PolicyModel, Selection, SideInfo, StepInfo,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Serialize, Deserialize)]
struct SelectorSnapshot {
    global_timestep: u64,
}

/// Wählt legale Aktionen für ganze Batches.
#[derive(Debug)]
pub struct MaskedActionSelector<M: PolicyModel> {
    config: SelectorConfig,
    model: M,
    capability: ModelCapability,
    default_tree: ActionTree,
    exploration: Exploration,
    timestep: GlobalTimestep,
}

impl<M: PolicyModel> MaskedActionSelector<M> {
    /// Baut einen Selektor um `model` mit frischem Schrittzähler.
    ///
    /// Prüft Config und Modell-Capability. Den Masking-Schalter selbst
    /// erzwingt [`select`](Self::select) bei jedem Aufruf.
    pub fn new(config: SelectorConfig, model: M) -> Result<Self> {
        config.validate()?;
        let capability = model.capability();
        validate_capability(&capability)?;
        let exploration = Exploration::from_config(&config.exploration_config)?;
        let default_tree = ActionTree::identity(capability.tree_depth());

        if !config.env_config.generate_valid_action_trees {
            warn_event!(
                "generate_valid_action_trees is off; every example falls back to the no-op default"
            );
        }

        Ok(Self {
            config,
            model,
            capability,
            default_tree,
            exploration,
            timestep: GlobalTimestep::default(),
        })
    }

    /// Teilt `timestep` mit anderen Selektoren statt eines eigenen Zählers.
    #[must_use]
    pub fn with_timestep(mut self, timestep: GlobalTimestep) -> Self {
        self.timestep = timestep;
        self
    }

    #[must_use]
    pub fn config(&self) -> &SelectorConfig {
        &self.config
    }

    #[must_use]
    pub fn model(&self) -> &M {
        &self.model
    }

    #[must_use]
    pub fn capability(&self) -> &ModelCapability {
        &self.capability
    }

    /// Baum für Beispiele, deren Info keinen mitbringt.
    #[must_use]
    pub fn default_tree(&self) -> &ActionTree {
        &self.default_tree
    }

    #[must_use]
    pub fn exploration(&self) -> &Exploration {
        &self.exploration
    }

    #[must_use]
    pub fn timestep(&self) -> &GlobalTimestep {
        &self.timestep
    }

    /// Führt das Modell auf `input` aus und wählt pro Beispiel eine legale Aktion.
    ///
    /// `infos[i]` gehört zu `input.observations[i]`. `explore` und
    /// `timestep` fallen auf Config und globalen Zähler zurück. Bei Erfolg
    /// rückt der globale Zähler um die Batch-Größe vor.
    pub fn select<R: Rng + ?Sized>(
        &self,
        input: &InferenceInput<'_, M::Observation>,
        infos: &[StepInfo],
        explore: Option<bool>,
        timestep: Option<u64>,
        rng: &mut R,
    ) -> Result<Selection> {
        if !self.config.env_config.invalid_action_masking {
            warn_event!("masked action selection refused: invalid_action_masking is not enabled");
            return Err(SelectError::MaskingDisabled);
        }

        let batch = input.len();
        expect_len("infos", batch, infos.len())?;
        if !input.state.is_empty() {
            expect_len("state", batch, input.state.len())?;
        }
        if let Some(prev_actions) = input.prev_actions {
            expect_len("prev_actions", batch, prev_actions.len())?;
        }
        if let Some(prev_rewards) = input.prev_rewards {
            expect_len("prev_rewards", batch, prev_rewards.len())?;
        }

        let explore = explore.unwrap_or(self.config.explore);
        let timestep = timestep.unwrap_or_else(|| self.timestep.get());

        let output = self.model.forward(input)?;
        expect_len("scores", batch, output.scores.len())?;
        if !output.state_out.is_empty() {
            expect_len("state_out", batch, output.state_out.len())?;
        }
        let width = self.capability.row_width();
        for (index, row) in output.scores.iter().enumerate() {
            if row.len() != width {
                return Err(SelectError::ScoreShape {
                    index,
                    expected: width,
                    found: row.len(),
                });
            }
            if let Some(position) = row.iter().position(|v| !v.is_finite()) {
                return Err(SelectError::NonFiniteScore { index, position });
            }
        }

        let trees: Vec<ActionTree> = infos
            .iter()
            .enumerate()
            .map(|(index, info)| match &info.valid_action_tree {
                Some(tree) => tree.clone(),
                None => {
                    debug_event!("example {index} has no valid_action_tree; using the no-op default");
                    self.default_tree.clone()
                }
            })
            .collect();

        let masked = match &self.capability {
            ModelCapability::Flat { nvec } => {
                ConditionalMaskingExploration::new(nvec, &output.scores, &trees, &self.exploration)
                    .get_actions_and_mask(explore, timestep, rng)?
            }
            ModelCapability::SpatialGrid {
                width,
                height,
                cell_nvec,
            } => {
                let mut dist =
                    GridnetMaskedCategorical::new(*width, *height, cell_nvec, &output.scores, &trees);
                let (actions, logp) = dist.sample(&self.exploration, explore, timestep, rng)?;
                let (masked_logits, masks) = dist.into_sampled();
                MaskedActions {
                    actions,
                    masked_logits,
                    logp,
                    masks,
                }
            }
        };

        let action_prob = masked.logp.iter().map(|lp| lp.exp()).collect();
        let previous = self.timestep.advance(batch as u64);
        debug_event!(
            "selected {batch} actions (explore={explore}, timestep={timestep}); global timestep {previous} -> {}",
            previous + batch as u64
        );

        Ok(Selection {
            actions: masked.actions,
            state_out: output.state_out,
            side_info: SideInfo {
                valid_action_mask: masked.masks,
                valid_action_trees: trees,
                action_dist_inputs: masked.masked_logits,
                action_logp: masked.logp,
                action_prob,
            },
        })
    }

    /// Persistiert den globalen Schrittzähler als JSON.
    #[must_use]
    pub fn snapshot(&self) -> Value {
        serde_json::json!({ "global_timestep": self.timestep.get() })
    }

    /// Stellt den globalen Schrittzähler aus einem Snapshot wieder her.
    pub fn load(&mut self, snapshot: Value) -> Result<()> {
        let snapshot: SelectorSnapshot = serde_json::from_value(snapshot)?;
        self.timestep.set(snapshot.global_timestep);
        Ok(())
    }
}

fn expect_len(what: &'static str, expected: usize, found: usize) -> Result<()> {
    if expected == found {
        Ok(())
    } else {
        Err(SelectError::BatchMismatch {
            what,
            expected,
            found,
        })
    }
}

fn validate_capability(capability: &ModelCapability) -> Result<()> {
    let dims = match capability {
        ModelCapability::Flat { nvec } => nvec,
        ModelCapability::SpatialGrid {
            width,
            height,
            cell_nvec,
        } => {
            if *width == 0 || *height == 0 {
                return Err(SelectError::InvalidCapability(format!(
                    "grid must not be empty, got {width}x{height}"
                )));
            }
            let cell_width = cell_nvec
                .iter()
                .try_fold(0usize, |acc, &n| acc.checked_add(n));
            let cells = width.checked_mul(*height);
            let fits = cells
                .zip(cell_width)
                .and_then(|(cells, cell_width)| {
                    cells
                        .checked_mul(cell_nvec.len())
                        .and(cells.checked_mul(cell_width))
                })
                .is_some();
            if !fits {
                return Err(SelectError::InvalidCapability(format!(
                    "grid {width}x{height} with cell dimensions {cell_nvec:?} is too large"
                )));
            }
            cell_nvec
        }
    };
    if dims.is_empty() {
        return Err(SelectError::InvalidCapability(
            "action space has no dimensions".to_string(),
        ));
    }
    if dims.iter().any(|&n| n == 0 || u32::try_from(n).is_err()) {
        return Err(SelectError::InvalidCapability(format!(
            "action dimension sizes must be within 1..=u32::MAX, got {dims:?}"
        )));
    }
    Ok(())
}
