//! Gemeinsame Typen für die maskierte Aktionsauswahl.
//!
//! Das Modell und der Trainer sind externe Mitspieler. Sie begegnen uns
//! hier nur als Trait ([`PolicyModel`]) und als Daten, die die Grenze
//! überqueren: Beobachtungen, Rohscores, Info-Einträge und das Ergebnis
//! ([`Selection`]) mit seinen Schlüsseln für den Trainer.

pub mod info;
pub mod legality;

pub use info::StepInfo;
pub use legality::ActionTree;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Schlüssel, unter denen der Trainer die Nebeninformationen findet.
pub mod keys {
    pub const VALID_ACTION_MASK: &str = "valid_action_mask";
    pub const VALID_ACTION_TREES: &str = "valid_action_trees";
    pub const ACTION_DIST_INPUTS: &str = "action_dist_inputs";
    pub const ACTION_LOGP: &str = "action_logp";
    pub const ACTION_PROB: &str = "action_prob";
}

/// Form des Aktionsraums, die ein Modell anbietet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelCapability {
    /// Diskreter Mehrdimensionsraum, eine Wahl pro Dimension.
    Flat { nvec: Vec<usize> },
    /// Eine Aktion pro Gitterzelle; jede Zelle hat die Dimensionen `cell_nvec`.
    SpatialGrid {
        width: usize,
        height: usize,
        cell_nvec: Vec<usize>,
    },
}

impl ModelCapability {
    /// Anzahl der Dimensionen, die ein Legalitätsbaum beschreibt.
    /// Im Gitter kommen die beiden Koordinaten vor die Zellendimensionen.
    #[must_use]
    pub fn tree_depth(&self) -> usize {
        match self {
            ModelCapability::Flat { nvec } => nvec.len(),
            ModelCapability::SpatialGrid { cell_nvec, .. } => 2 + cell_nvec.len(),
        }
    }

    /// Länge einer Score-Zeile pro Beispiel.
    #[must_use]
    pub fn row_width(&self) -> usize {
        self.segments().iter().sum()
    }

    /// Segmentgrößen einer Score-Zeile in Speicherreihenfolge.
    #[must_use]
    pub fn segments(&self) -> Vec<usize> {
        match self {
            ModelCapability::Flat { nvec } => nvec.clone(),
            ModelCapability::SpatialGrid {
                width,
                height,
                cell_nvec,
            } => cell_nvec
                .iter()
                .copied()
                .cycle()
                .take(width * height * cell_nvec.len())
                .collect(),
        }
    }

}

/// Eingabe eines Inferenzaufrufs. Alle Folgen sind nach Beispiel geordnet.
#[derive(Debug, Clone, Copy)]
pub struct InferenceInput<'a, O> {
    pub observations: &'a [O],
    /// Rekurrenter Zustand pro Beispiel; leer bei zustandslosen Modellen.
    pub state: &'a [Vec<f32>],
    pub prev_actions: Option<&'a [Vec<u32>]>,
    pub prev_rewards: Option<&'a [f32]>,
}

impl<'a, O> InferenceInput<'a, O> {
    #[must_use]
    pub fn new(observations: &'a [O]) -> Self {
        Self {
            observations,
            state: &[],
            prev_actions: None,
            prev_rewards: None,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.observations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }
}

/// Ausgabe eines Inferenzaufrufs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InferenceOutput {
    /// Rohscores, eine Zeile pro Beispiel.
    pub scores: Vec<Vec<f32>>,
    /// Nächster rekurrenter Zustand; leer bei zustandslosen Modellen.
    pub state_out: Vec<Vec<f32>>,
}

#[derive(Debug, Error)]
#[error("model inference failed: {0}")]
pub struct ModelError(pub String);

/// Das Policy-Netz, von außen gesehen.
pub trait PolicyModel {
    type Observation;

    /// Form des Aktionsraums. Wird einmal beim Bau des Selektors gelesen.
    fn capability(&self) -> ModelCapability;

    fn forward(
        &self,
        input: &InferenceInput<'_, Self::Observation>,
    ) -> Result<InferenceOutput, ModelError>;
}

/// Nebeninformationen für den Trainer, pro Beispiel geordnet.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SideInfo {
    pub valid_action_mask: Vec<Vec<u8>>,
    pub valid_action_trees: Vec<ActionTree>,
    pub action_dist_inputs: Vec<Vec<f32>>,
    pub action_logp: Vec<f32>,
    pub action_prob: Vec<f32>,
}

/// Ergebnis eines Auswahlaufrufs.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Selection {
    pub actions: Vec<Vec<u32>>,
    pub state_out: Vec<Vec<f32>>,
    pub side_info: SideInfo,
}

impl Selection {
    #[must_use]
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}
