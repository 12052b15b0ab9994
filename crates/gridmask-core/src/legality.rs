//! Legalitätsbäume für bedingte Aktionsräume.
//!
//! Die Umgebung beschreibt pro Schritt, welche Aktionen erlaubt sind, als
//! verschachtelte Abbildung: Jede Ebene entspricht einer Aktionsdimension,
//! die Schlüssel einer Ebene sind die dort erlaubten Werte, und das Kind
//! eines Schlüssels beschreibt die nächste Dimension unter dieser Wahl. Die
//! letzte Dimension ist eine einfache Liste.
//!
//! Im JSON der Umgebung sind die Schlüssel Dezimal-Strings:
//! `{"0": {"0": {"0": [0]}}}`. Eine flache Legalitätsliste ist einfach ein
//! Blatt auf Wurzelebene: `[1, 2]`.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Baum der erlaubten Aktionen eines Beispiels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ActionTree {
    /// Erlaubte Werte der aktuellen Dimension samt Teilbaum der nächsten.
    Node(BTreeMap<u32, ActionTree>),
    /// Erlaubte Werte der letzten Dimension.
    Leaf(Vec<u32>),
}

impl ActionTree {
    /// Der Standardbaum "nur die No-op-Aktion ist erlaubt": eine Kette aus
    /// `0`-Schlüsseln, die in `[0]` endet.
    ///
    /// `depth` ist die Anzahl der Aktionsdimensionen; Werte unter 1 werden
    /// als 1 behandelt.
    #[must_use]
    pub fn identity(depth: usize) -> Self {
        let mut tree = ActionTree::Leaf(vec![0]);
        for _ in 1..depth.max(1) {
            let mut level = BTreeMap::new();
            level.insert(0, tree);
            tree = ActionTree::Node(level);
        }
        tree
    }

    /// Flache Legalitätsliste für einen eindimensionalen Aktionsraum.
    #[must_use]
    pub fn from_flat(values: impl IntoIterator<Item = u32>) -> Self {
        ActionTree::Leaf(values.into_iter().collect())
    }

    #[must_use]
    pub fn is_leaf(&self) -> bool {
        matches!(self, ActionTree::Leaf(_))
    }

    /// Tiefe des Baums, also die Anzahl der Dimensionen, die er beschreibt.
    /// Bei uneinheitlich tiefen Ästen zählt der tiefste.
    #[must_use]
    pub fn depth(&self) -> usize {
        match self {
            ActionTree::Leaf(_) => 1,
            ActionTree::Node(children) => {
                1 + children.values().map(ActionTree::depth).max().unwrap_or(0)
            }
        }
    }

    /// Erlaubte Werte auf dieser Ebene, aufsteigend und ohne Duplikate.
    #[must_use]
    pub fn choices(&self) -> Vec<u32> {
        match self {
            ActionTree::Node(children) => children.keys().copied().collect(),
            ActionTree::Leaf(values) => {
                let mut values = values.clone();
                values.sort_unstable();
                values.dedup();
                values
            }
        }
    }

    /// Teilbaum der nächsten Dimension, nachdem `value` gewählt wurde.
    #[must_use]
    pub fn child(&self, value: u32) -> Option<&ActionTree> {
        match self {
            ActionTree::Node(children) => children.get(&value),
            ActionTree::Leaf(_) => None,
        }
    }

    /// Anzahl vollständiger, erlaubter Aktionen.
    #[must_use]
    pub fn count_leaves(&self) -> usize {
        match self {
            ActionTree::Leaf(_) => self.choices().len(),
            ActionTree::Node(children) => children.values().map(ActionTree::count_leaves).sum(),
        }
    }

    /// Prüft, ob eine vollständige Aktion erlaubt ist.
    #[must_use]
    pub fn contains(&self, action: &[u32]) -> bool {
        match (self, action) {
            (ActionTree::Leaf(values), [last]) => values.contains(last),
            (ActionTree::Node(children), [head, rest @ ..]) => children
                .get(head)
                .is_some_and(|child| child.contains(rest)),
            _ => false,
        }
    }
}

impl TryFrom<Value> for ActionTree {
    type Error = String;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Array(items) => items
                .into_iter()
                .map(|item| parse_action_value(&item))
                .collect::<Result<Vec<_>, _>>()
                .map(ActionTree::Leaf),
            Value::Object(map) => {
                let mut children = BTreeMap::new();
                for (key, child) in map {
                    let key: u32 = key
                        .trim()
                        .parse()
                        .map_err(|_| format!("tree key '{key}' is not an action value"))?;
                    if children.contains_key(&key) {
                        return Err(format!("tree key {key} appears more than once"));
                    }
                    children.insert(key, ActionTree::try_from(child)?);
                }
                Ok(ActionTree::Node(children))
            }
            other => Err(format!("expected object or array in action tree, got {other}")),
        }
    }
}

fn parse_action_value(item: &Value) -> Result<u32, String> {
    item.as_u64()
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| format!("leaf entry {item} is not an action value"))
}

// Über `Value`, weil die Schlüssel im JSON Strings sind und ein
// untagged-Enum sie nicht als Zahlen lesen kann.
impl<'de> Deserialize<'de> for ActionTree {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        ActionTree::try_from(value).map_err(D::Error::custom)
    }
}
