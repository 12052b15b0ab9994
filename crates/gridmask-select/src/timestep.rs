use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Gesamtzahl verarbeiteter Umgebungsschritte, geteilt zwischen Selektoren.
///
/// Klone teilen denselben Zähler; mehrere Worker zählen ohne verlorene
/// Updates in einen globalen Stand.
#[derive(Debug, Clone, Default)]
pub struct GlobalTimestep(Arc<AtomicU64>);

impl GlobalTimestep {
    #[must_use]
    pub fn new(start: u64) -> Self {
        Self(Arc::new(AtomicU64::new(start)))
    }

    #[must_use]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    /// Addiert `n` und liefert den vorherigen Wert.
    pub fn advance(&self, n: u64) -> u64 {
        self.0.fetch_add(n, Ordering::Relaxed)
    }

    pub fn set(&self, value: u64) {
        self.0.store(value, Ordering::Relaxed);
    }
}
