//! Konfiguration des Selektors.
//!
//! Folgt dem Trainer-Config-Format: Der Masking-Schalter steht in
//! `env_config`, die Explorationsstrategie in `exploration_config` und die
//! Schedules auf oberster Ebene. Unbekannte `env_config`-Schlüssel bleiben
//! erhalten, damit eine vollständige Trainer-Config unverändert ladbar ist.

use crate::error::ConfigError;
use crate::schedule::PiecewiseSchedule;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SelectorConfig {
    /// Vorgabe für `explore`, wenn der Aufrufer `None` übergibt.
    #[serde(default = "default_explore")]
    pub explore: bool,
    #[serde(default)]
    pub env_config: EnvConfig,
    #[serde(default)]
    pub exploration_config: ExplorationConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entropy_coeff_schedule: Option<PiecewiseSchedule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lr_schedule: Option<PiecewiseSchedule>,
}

fn default_explore() -> bool {
    true
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            explore: default_explore(),
            env_config: EnvConfig::default(),
            exploration_config: ExplorationConfig::default(),
            entropy_coeff_schedule: None,
            lr_schedule: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EnvConfig {
    /// Capability-Flag. Fehlt es oder ist es `false`, wird die Auswahl verweigert.
    #[serde(default)]
    pub invalid_action_masking: bool,
    /// Ob die Umgebung `valid_action_tree` an ihre Infos hängt.
    #[serde(default = "default_generate_trees")]
    pub generate_valid_action_trees: bool,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

fn default_generate_trees() -> bool {
    true
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            invalid_action_masking: false,
            generate_valid_action_trees: default_generate_trees(),
            extra: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum ExplorationConfig {
    /// Zieht proportional zu den maskierten Wahrscheinlichkeiten.
    StochasticSampling {
        #[serde(default = "default_temperature")]
        temperature: f32,
    },
    /// Mit Wahrscheinlichkeit ε gleichverteilt über die legalen Werte, sonst greedy.
    EpsilonGreedy {
        #[serde(default = "default_initial_epsilon")]
        initial_epsilon: f64,
        #[serde(default = "default_final_epsilon")]
        final_epsilon: f64,
        #[serde(default = "default_epsilon_timesteps")]
        epsilon_timesteps: u64,
    },
}

fn default_temperature() -> f32 {
    1.0
}

fn default_initial_epsilon() -> f64 {
    1.0
}

fn default_final_epsilon() -> f64 {
    0.05
}

fn default_epsilon_timesteps() -> u64 {
    100_000
}

impl Default for ExplorationConfig {
    fn default() -> Self {
        ExplorationConfig::StochasticSampling {
            temperature: default_temperature(),
        }
    }
}

impl SelectorConfig {
    /// Standard-Config mit eingeschaltetem Masking.
    #[must_use]
    pub fn masked() -> Self {
        let mut config = Self::default();
        config.env_config.invalid_action_masking = true;
        config
    }

    /// Lädt und prüft eine JSON-Config-Datei.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        text.parse()
    }

    /// Bereichsprüfungen, die serde nicht ausdrücken kann.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.exploration_config {
            ExplorationConfig::StochasticSampling { temperature } => {
                if !(temperature.is_finite() && temperature > 0.0) {
                    return Err(ConfigError::Invalid(format!(
                        "temperature must be positive and finite, got {temperature}"
                    )));
                }
            }
            ExplorationConfig::EpsilonGreedy {
                initial_epsilon,
                final_epsilon,
                ..
            } => {
                for (name, eps) in [
                    ("initial_epsilon", initial_epsilon),
                    ("final_epsilon", final_epsilon),
                ] {
                    if !(0.0..=1.0).contains(&eps) {
                        return Err(ConfigError::Invalid(format!(
                            "{name} must be within [0, 1], got {eps}"
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Entropie-Koeffizient bei `timestep`, falls ein Schedule konfiguriert ist.
    #[must_use]
    pub fn entropy_coeff(&self, timestep: u64) -> Option<f64> {
        self.entropy_coeff_schedule
            .as_ref()
            .map(|s| s.value(timestep))
    }

    /// Lernrate bei `timestep`, falls ein Schedule konfiguriert ist.
    #[must_use]
    pub fn learning_rate(&self, timestep: u64) -> Option<f64> {
        self.lr_schedule.as_ref().map(|s| s.value(timestep))
    }
}

impl FromStr for SelectorConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: SelectorConfig = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_refuse_masking() {
        let config: SelectorConfig = "{}".parse().expect("parse");
        assert!(!config.env_config.invalid_action_masking);
        assert!(config.env_config.generate_valid_action_trees);
        assert!(config.explore);
        assert_eq!(config.exploration_config, ExplorationConfig::default());
        assert!(SelectorConfig::masked().env_config.invalid_action_masking);
    }

    #[test]
    fn parses_training_config() {
        let config: SelectorConfig = r#"{
            "explore": false,
            "env_config": {
                "invalid_action_masking": true,
                "generate_valid_action_trees": true,
                "random_level_on_reset": true,
                "max_steps": 1000
            },
            "exploration_config": {"type": "EpsilonGreedy", "epsilon_timesteps": 500},
            "entropy_coeff_schedule": [[0, 0.01], [5000000, 0.0]],
            "lr_schedule": [[0, 0.005], [5000000, 0.0]]
        }"#
        .parse()
        .expect("parse");

        assert!(!config.explore);
        assert!(config.env_config.invalid_action_masking);
        assert_eq!(
            config.env_config.extra.get("max_steps"),
            Some(&serde_json::json!(1000))
        );
        assert_eq!(
            config.exploration_config,
            ExplorationConfig::EpsilonGreedy {
                initial_epsilon: 1.0,
                final_epsilon: 0.05,
                epsilon_timesteps: 500,
            }
        );
        assert!(config.entropy_coeff(0).is_some_and(|c| (c - 0.01).abs() < 1e-12));
        assert!(config.learning_rate(5_000_000).is_some_and(|lr| lr.abs() < 1e-12));
    }

    #[test]
    fn validate_rejects_out_of_range_values() {
        let bad_temp = r#"{"exploration_config": {"type": "StochasticSampling", "temperature": 0.0}}"#;
        assert!(matches!(
            bad_temp.parse::<SelectorConfig>(),
            Err(ConfigError::Invalid(_))
        ));

        let bad_eps = r#"{"exploration_config": {"type": "EpsilonGreedy", "initial_epsilon": 1.5}}"#;
        assert!(matches!(
            bad_eps.parse::<SelectorConfig>(),
            Err(ConfigError::Invalid(_))
        ));

        assert!(matches!(
            "{not json".parse::<SelectorConfig>(),
            Err(ConfigError::Json(_))
        ));
    }

    #[test]
    fn from_path_reports_missing_file() {
        let missing = std::env::temp_dir().join("gridmask_missing_config_does_not_exist.json");
        assert!(matches!(
            SelectorConfig::from_path(&missing),
            Err(ConfigError::Io(_))
        ));
    }
}
