//! Metadaten, die die Umgebung zu jedem Schritt mitliefert.
//!
//! Dieses Modul definiert [`StepInfo`], den Info-Eintrag eines einzelnen
//! Beispiels. Für die Aktionsauswahl zählt nur der Legalitätsbaum; alle
//! übrigen Felder (Episodenzähler, Belohnungsdetails, Videopfade, ...)
//! werden unverändert in [`StepInfo::extra`] durchgereicht.

use crate::legality::ActionTree;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Info-Eintrag eines Beispiels, wie ihn die Umgebung neben der
/// Beobachtung liefert.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StepInfo {
    /// Erlaubte Aktionen in diesem Schritt. Fehlt der Eintrag, gilt der
    /// Standardbaum des Selektors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_action_tree: Option<ActionTree>,
    /// Alle weiteren Felder, unverändert.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl StepInfo {
    /// Info-Eintrag, der nur einen Legalitätsbaum trägt.
    #[must_use]
    pub fn with_tree(tree: ActionTree) -> Self {
        Self {
            valid_action_tree: Some(tree),
            extra: BTreeMap::new(),
        }
    }

    /// Der gelieferte Baum oder `default`, falls keiner mitkam.
    #[must_use]
    pub fn tree_or<'a>(&'a self, default: &'a ActionTree) -> &'a ActionTree {
        self.valid_action_tree.as_ref().unwrap_or(default)
    }
}
