//! Maskierte kategoriale Verteilungen über Score-Zeilen.
//!
//! Illegale Einträge werden durch [`MASKED_LOGIT`] ersetzt. Sie tragen dann
//! keine Wahrscheinlichkeitsmasse, die Zeile behält aber ihre Form. Jede
//! Score-Zeile besteht aus Segmenten (eines pro Aktionsdimension bzw. pro
//! Dimension jeder Gitterzelle); jedes Segment ist eine eigene Kategorische.

use crate::error::{invalid_legality, Result};
use crate::exploration::Exploration;
use gridmask_core::ActionTree;
use rand::Rng;

/// Score für illegale Einträge.
pub const MASKED_LOGIT: f32 = -1e10;

/// Ergebnis der Auswahl für ein Beispiel (oder eine Gitterzelle).
#[derive(Debug, Clone, PartialEq)]
pub struct MaskedSample {
    pub action: Vec<u32>,
    pub masked_logits: Vec<f32>,
    pub mask: Vec<u8>,
    pub logp: f32,
}

pub(crate) fn log_softmax_at(segment: &[f32], index: usize) -> f32 {
    let max = segment.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let sum: f32 = segment.iter().map(|x| (x - max).exp()).sum();
    segment[index] - (max + sum.ln())
}

fn segment_entropy(segment: &[f32], mask: &[u8]) -> f32 {
    let max = segment
        .iter()
        .zip(mask)
        .filter(|(_, &m)| m != 0)
        .map(|(x, _)| *x)
        .fold(f32::NEG_INFINITY, f32::max);
    let lse = max
        + segment
            .iter()
            .zip(mask)
            .filter(|(_, &m)| m != 0)
            .map(|(x, _)| (x - max).exp())
            .sum::<f32>()
            .ln();
    segment
        .iter()
        .zip(mask)
        .filter(|(_, &m)| m != 0)
        .map(|(x, _)| {
            let logp = x - lse;
            -logp.exp() * logp
        })
        .sum()
}

/// Läuft `tree` Dimension für Dimension über eine Score-Zeile ab.
///
/// Die Maske einer Dimension ist die Schlüsselmenge des aktuellen Knotens;
/// der gewählte Wert bestimmt den Knoten der nächsten Dimension.
#[allow(clippy::too_many_arguments)]
pub(crate) fn sample_conditional<R: Rng + ?Sized>(
    scores: &[f32],
    nvec: &[usize],
    tree: &ActionTree,
    exploration: &Exploration,
    explore: bool,
    timestep: u64,
    rng: &mut R,
    index: usize,
) -> Result<MaskedSample> {
    let mut action = Vec::with_capacity(nvec.len());
    let mut masked_logits = vec![MASKED_LOGIT; scores.len()];
    let mut mask = vec![0u8; scores.len()];
    let mut logp = 0.0;
    let mut node = Some(tree);
    let mut offset = 0;

    for (dim, &size) in nvec.iter().enumerate() {
        let last = dim + 1 == nvec.len();
        let current = node.ok_or_else(|| {
            invalid_legality(index, format!("tree ends before action dimension {dim}"))
        })?;
        if current.is_leaf() != last {
            return Err(invalid_legality(
                index,
                format!(
                    "tree depth {} does not match {} action dimensions",
                    tree.depth(),
                    nvec.len()
                ),
            ));
        }

        let legal = current.choices();
        if legal.is_empty() {
            return Err(invalid_legality(
                index,
                format!("no legal value in action dimension {dim}"),
            ));
        }
        if let Some(&bad) = legal.iter().find(|&&v| v as usize >= size) {
            return Err(invalid_legality(
                index,
                format!("value {bad} out of range for action dimension {dim} of size {size}"),
            ));
        }

        for &value in &legal {
            let i = offset + value as usize;
            mask[i] = 1;
            masked_logits[i] = scores[i];
        }

        let segment = &masked_logits[offset..offset + size];
        let chosen = exploration
            .choose(segment, &legal, explore, timestep, rng)
            .ok_or_else(|| {
                invalid_legality(index, format!("no legal value in action dimension {dim}"))
            })?;
        logp += log_softmax_at(segment, chosen as usize);
        action.push(chosen);

        node = current.child(chosen);
        offset += size;
    }

    Ok(MaskedSample {
        action,
        masked_logits,
        mask,
        logp,
    })
}

/// Maskierte Verteilung für räumliche Aktionsräume: eine Aktion pro Gitterzelle.
///
/// Bäume haben die Form `{x: {y: zellen-teilbaum}}`. Zellen, die im Baum
/// fehlen, behalten Aktion 0 und eine Null-Maske und tragen nichts zur
/// Log-Wahrscheinlichkeit bei. Maskieren und Ziehen passieren zusammen in
/// [`sample`]; die verwendeten Scores und Masken bleiben danach lesbar.
///
/// [`sample`]: GridnetMaskedCategorical::sample
#[derive(Debug)]
pub struct GridnetMaskedCategorical<'a> {
    width: usize,
    height: usize,
    cell_nvec: &'a [usize],
    scores: &'a [Vec<f32>],
    trees: &'a [ActionTree],
    masked_logits: Vec<Vec<f32>>,
    masks: Vec<Vec<u8>>,
}

impl<'a> GridnetMaskedCategorical<'a> {
    #[must_use]
    pub fn new(
        width: usize,
        height: usize,
        cell_nvec: &'a [usize],
        scores: &'a [Vec<f32>],
        trees: &'a [ActionTree],
    ) -> Self {
        Self {
            width,
            height,
            cell_nvec,
            scores,
            trees,
            masked_logits: Vec::new(),
            masks: Vec::new(),
        }
    }

    /// Wählt für jedes Beispiel; liefert Aktionen und ihre Log-Wahrscheinlichkeiten.
    pub fn sample<R: Rng + ?Sized>(
        &mut self,
        exploration: &Exploration,
        explore: bool,
        timestep: u64,
        rng: &mut R,
    ) -> Result<(Vec<Vec<u32>>, Vec<f32>)> {
        let dims = self.cell_nvec.len();
        let cell_width: usize = self.cell_nvec.iter().sum();
        let cells = self.width * self.height;

        let mut actions = Vec::with_capacity(self.scores.len());
        let mut logps = Vec::with_capacity(self.scores.len());
        self.masked_logits.clear();
        self.masks.clear();

        for (index, (row, tree)) in self.scores.iter().zip(self.trees).enumerate() {
            let mut action = vec![0u32; cells * dims];
            let mut masked = vec![MASKED_LOGIT; cells * cell_width];
            let mut mask = vec![0u8; cells * cell_width];
            let mut logp = 0.0;

            let ActionTree::Node(columns) = tree else {
                return Err(invalid_legality(
                    index,
                    "spatial tree must start with x coordinates",
                ));
            };
            for (&x, column) in columns {
                let ActionTree::Node(cells_in_column) = column else {
                    return Err(invalid_legality(
                        index,
                        format!("column {x} must map y coordinates"),
                    ));
                };
                for (&y, cell_tree) in cells_in_column {
                    let (x, y) = (x as usize, y as usize);
                    if x >= self.width || y >= self.height {
                        return Err(invalid_legality(
                            index,
                            format!(
                                "cell ({x}, {y}) outside {}x{} grid",
                                self.width, self.height
                            ),
                        ));
                    }
                    let cell = y * self.width + x;
                    let span = cell * cell_width..(cell + 1) * cell_width;
                    let sample = sample_conditional(
                        &row[span.clone()],
                        self.cell_nvec,
                        cell_tree,
                        exploration,
                        explore,
                        timestep,
                        rng,
                        index,
                    )?;
                    action[cell * dims..(cell + 1) * dims].copy_from_slice(&sample.action);
                    masked[span.clone()].copy_from_slice(&sample.masked_logits);
                    mask[span].copy_from_slice(&sample.mask);
                    logp += sample.logp;
                }
            }

            actions.push(action);
            logps.push(logp);
            self.masked_logits.push(masked);
            self.masks.push(mask);
        }

        Ok((actions, logps))
    }

    /// Maskierte Scores des letzten [`sample`](Self::sample)-Aufrufs.
    #[must_use]
    pub fn sampled_masked_logits(&self) -> &[Vec<f32>] {
        &self.masked_logits
    }

    /// Masken des letzten [`sample`](Self::sample)-Aufrufs.
    #[must_use]
    pub fn sampled_action_masks(&self) -> &[Vec<u8>] {
        &self.masks
    }

    pub(crate) fn into_sampled(self) -> (Vec<Vec<f32>>, Vec<Vec<u8>>) {
        (self.masked_logits, self.masks)
    }
}

/// Log-Wahrscheinlichkeit von `action` unter gespeicherten maskierten Scores.
///
/// `segments` sind die Segmentgrößen der Zeile, `action` enthält einen Wert
/// pro Segment. Segmente mit reiner Null-Maske werden übersprungen. `None`,
/// wenn die Formen nicht passen oder ein Wert auf einen maskierten Eintrag fällt.
#[must_use]
pub fn masked_log_prob(
    masked_logits: &[f32],
    mask: &[u8],
    segments: &[usize],
    action: &[u32],
) -> Option<f32> {
    if action.len() != segments.len()
        || masked_logits.len() != mask.len()
        || segments.iter().sum::<usize>() != masked_logits.len()
    {
        return None;
    }
    let mut offset = 0;
    let mut logp = 0.0;
    for (&size, &value) in segments.iter().zip(action) {
        let range = offset..offset + size;
        offset += size;
        if mask[range.clone()].iter().all(|&m| m == 0) {
            continue;
        }
        let value = value as usize;
        if value >= size || mask[range.start + value] == 0 {
            return None;
        }
        logp += log_softmax_at(&masked_logits[range], value);
    }
    Some(logp)
}

/// Entropie der maskierten Verteilung, summiert über die Segmente.
#[must_use]
pub fn masked_entropy(masked_logits: &[f32], mask: &[u8], segments: &[usize]) -> Option<f32> {
    if masked_logits.len() != mask.len() || segments.iter().sum::<usize>() != masked_logits.len() {
        return None;
    }
    let mut offset = 0;
    let mut entropy = 0.0;
    for &size in segments {
        let range = offset..offset + size;
        offset += size;
        if mask[range.clone()].iter().any(|&m| m != 0) {
            entropy += segment_entropy(&masked_logits[range.clone()], &mask[range]);
        }
    }
    Some(entropy)
}
