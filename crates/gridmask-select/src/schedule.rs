//! Stückweise lineare Schedules über dem globalen Schrittzähler.
//!
//! In der Config als `[[timestep, value], ...]`, z. B. ein
//! Entropie-Koeffizient, der über den Lauf auf null fällt:
//! `[[0, 0.01], [5000000, 0.0]]`.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<(u64, f64)>", into = "Vec<(u64, f64)>")]
pub struct PiecewiseSchedule {
    endpoints: Vec<(u64, f64)>,
}

impl PiecewiseSchedule {
    /// Stützstellen: nicht leer, endlich, streng aufsteigend nach Timestep.
    pub fn new(endpoints: Vec<(u64, f64)>) -> Result<Self, ConfigError> {
        if endpoints.is_empty() {
            return Err(ConfigError::Invalid(
                "schedule needs at least one endpoint".to_string(),
            ));
        }
        if let Some((t, v)) = endpoints.iter().find(|(_, v)| !v.is_finite()) {
            return Err(ConfigError::Invalid(format!(
                "schedule value at timestep {t} is not finite: {v}"
            )));
        }
        if endpoints.windows(2).any(|w| w[0].0 >= w[1].0) {
            return Err(ConfigError::Invalid(
                "schedule timesteps must be strictly increasing".to_string(),
            ));
        }
        Ok(Self { endpoints })
    }

    /// Linearer Abfall von `initial` bei 0 auf `final_value` bei `timesteps`.
    pub fn linear(initial: f64, final_value: f64, timesteps: u64) -> Result<Self, ConfigError> {
        if timesteps == 0 {
            return Self::new(vec![(0, final_value)]);
        }
        Self::new(vec![(0, initial), (timesteps, final_value)])
    }

    /// Wert bei `timestep`; außerhalb des Bereichs gilt die erste bzw. letzte Stützstelle.
    #[must_use]
    pub fn value(&self, timestep: u64) -> f64 {
        let (first_t, first_v) = self.endpoints[0];
        if timestep <= first_t {
            return first_v;
        }
        for pair in self.endpoints.windows(2) {
            let (t0, v0) = pair[0];
            let (t1, v1) = pair[1];
            if timestep < t1 {
                #[allow(clippy::cast_precision_loss)]
                let alpha = (timestep - t0) as f64 / (t1 - t0) as f64;
                return v0 + alpha * (v1 - v0);
            }
        }
        self.endpoints[self.endpoints.len() - 1].1
    }

    #[must_use]
    pub fn endpoints(&self) -> &[(u64, f64)] {
        &self.endpoints
    }
}

impl TryFrom<Vec<(u64, f64)>> for PiecewiseSchedule {
    type Error = ConfigError;

    fn try_from(endpoints: Vec<(u64, f64)>) -> Result<Self, Self::Error> {
        Self::new(endpoints)
    }
}

impl From<PiecewiseSchedule> for Vec<(u64, f64)> {
    fn from(schedule: PiecewiseSchedule) -> Self {
        schedule.endpoints
    }
}
