//! Explorationsstrategien über maskierten Scores.
//!
//! Eine Strategie sieht immer nur ein Segment maskierter Scores und die
//! legalen Werte darin, nie die Roh-Scores. Mit `explore == false` ist jede
//! Strategie greedy.

use crate::config::ExplorationConfig;
use crate::distribution::sample_conditional;
use crate::error::{ConfigError, Result};
use crate::schedule::PiecewiseSchedule;
use gridmask_core::ActionTree;
use rand::distributions::{Distribution, WeightedIndex};
use rand::seq::SliceRandom;
use rand::Rng;

#[derive(Debug, Clone, PartialEq)]
pub enum Exploration {
    StochasticSampling { temperature: f32 },
    EpsilonGreedy { epsilon: PiecewiseSchedule },
}

impl Default for Exploration {
    fn default() -> Self {
        Exploration::StochasticSampling { temperature: 1.0 }
    }
}

impl Exploration {
    pub fn from_config(config: &ExplorationConfig) -> std::result::Result<Self, ConfigError> {
        Ok(match *config {
            ExplorationConfig::StochasticSampling { temperature } => {
                Exploration::StochasticSampling { temperature }
            }
            ExplorationConfig::EpsilonGreedy {
                initial_epsilon,
                final_epsilon,
                epsilon_timesteps,
            } => Exploration::EpsilonGreedy {
                epsilon: PiecewiseSchedule::linear(
                    initial_epsilon,
                    final_epsilon,
                    epsilon_timesteps,
                )?,
            },
        })
    }

    /// Aktuelles ε bei ε-greedy, `None` bei anderen Strategien.
    #[must_use]
    pub fn epsilon(&self, timestep: u64) -> Option<f64> {
        match self {
            Exploration::EpsilonGreedy { epsilon } => Some(epsilon.value(timestep)),
            Exploration::StochasticSampling { .. } => None,
        }
    }

    /// Wählt einen Wert aus `legal` über einem maskierten Segment.
    ///
    /// `None`, wenn `legal` leer ist oder einen Wert außerhalb von `masked` nennt.
    pub(crate) fn choose<R: Rng + ?Sized>(
        &self,
        masked: &[f32],
        legal: &[u32],
        explore: bool,
        timestep: u64,
        rng: &mut R,
    ) -> Option<u32> {
        if legal.iter().any(|&v| v as usize >= masked.len()) {
            return None;
        }
        let greedy = argmax(masked, legal)?;
        if !explore {
            return Some(greedy);
        }
        let chosen = match self {
            Exploration::StochasticSampling { temperature } => {
                let max = masked[greedy as usize];
                let weights = legal
                    .iter()
                    .map(|&v| ((masked[v as usize] - max) / temperature).exp());
                WeightedIndex::new(weights)
                    .map(|dist| legal[dist.sample(rng)])
                    .unwrap_or(greedy)
            }
            Exploration::EpsilonGreedy { epsilon } => {
                if rng.gen::<f64>() < epsilon.value(timestep) {
                    legal.choose(rng).copied().unwrap_or(greedy)
                } else {
                    greedy
                }
            }
        };
        Some(chosen)
    }
}

/// Höchster maskierter Score unter `legal`; bei Gleichstand gewinnt der kleinste Wert.
fn argmax(masked: &[f32], legal: &[u32]) -> Option<u32> {
    let (&first, rest) = legal.split_first()?;
    let mut best = first;
    for &v in rest {
        if masked[v as usize] > masked[best as usize] {
            best = v;
        }
    }
    Some(best)
}

/// Ergebnisbündel von [`ConditionalMaskingExploration`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MaskedActions {
    pub actions: Vec<Vec<u32>>,
    pub masked_logits: Vec<Vec<f32>>,
    pub logp: Vec<f32>,
    pub masks: Vec<Vec<u8>>,
}

/// Explorations-Helfer für flache (nicht räumliche) Aktionsräume.
///
/// Nimmt Aktionsraum, Roh-Scores und einen Baum pro Beispiel entgegen und
/// liefert Aktionen, maskierte Scores, Log-Wahrscheinlichkeiten und Masken
/// gemeinsam zurück.
#[derive(Debug)]
pub struct ConditionalMaskingExploration<'a> {
    nvec: &'a [usize],
    scores: &'a [Vec<f32>],
    trees: &'a [ActionTree],
    exploration: &'a Exploration,
}

impl<'a> ConditionalMaskingExploration<'a> {
    #[must_use]
    pub fn new(
        nvec: &'a [usize],
        scores: &'a [Vec<f32>],
        trees: &'a [ActionTree],
        exploration: &'a Exploration,
    ) -> Self {
        Self {
            nvec,
            scores,
            trees,
            exploration,
        }
    }

    pub fn get_actions_and_mask<R: Rng + ?Sized>(
        &self,
        explore: bool,
        timestep: u64,
        rng: &mut R,
    ) -> Result<MaskedActions> {
        let mut out = MaskedActions::default();
        for (index, (row, tree)) in self.scores.iter().zip(self.trees).enumerate() {
            let sample = sample_conditional(
                row,
                self.nvec,
                tree,
                self.exploration,
                explore,
                timestep,
                rng,
                index,
            )?;
            out.actions.push(sample.action);
            out.masked_logits.push(sample.masked_logits);
            out.logp.push(sample.logp);
            out.masks.push(sample.mask);
        }
        Ok(out)
    }
}
