//! Budget d'horloge en virgule fixe 32.32

use serde::{Deserialize, Serialize};

use super::Timestamp;

/// Nombre de bits fractionnaires du budget
pub const CLOCK_FRAC_BITS: u32 = 32;

/// Budget de cycles d'une unité, en virgule fixe 32.32
///
/// Crédité des cycles écoulés à chaque mise à jour, débité par chaque étape
/// de coroutine. Un budget négatif signifie que l'étape courante attend
/// encore des cycles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockBudget(i64);

impl ClockBudget {
    pub fn new() -> Self {
        Self(0)
    }

    pub fn from_raw(raw: i64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> i64 {
        self.0
    }

    /// Ajoute des cycles déjà exprimés en virgule fixe
    pub fn credit(&mut self, fixed_clocks: i64) {
        self.0 += fixed_clocks;
    }

    /// Débite `cycles` cycles entiers ; retourne `true` s'il faut suspendre
    pub fn eat(&mut self, cycles: i64) -> bool {
        self.0 -= cycles << CLOCK_FRAC_BITS;
        self.is_exhausted()
    }

    /// Fixe le budget à une valeur entière de cycles
    pub fn set_cycles(&mut self, cycles: i64) {
        self.0 = cycles << CLOCK_FRAC_BITS;
    }

    pub fn is_exhausted(&self) -> bool {
        self.0 < 0
    }

    /// Cycles (virgule fixe) manquants avant de pouvoir reprendre
    pub fn deficit(&self) -> i64 {
        -self.0
    }
}

/// Convertit des cycles entiers en virgule fixe
pub const fn fixed_cycles(cycles: i64) -> i64 {
    cycles << CLOCK_FRAC_BITS
}

/// Ratio 32.32 entre l'horloge d'une unité et l'horloge maître
pub fn clock_ratio(unit_hz: u32, master_hz: u32) -> u32 {
    let ratio = ((unit_hz as u64) << CLOCK_FRAC_BITS) / master_hz.max(1) as u64;
    ratio.clamp(1, u32::MAX as u64) as u32
}

/// Nombre de cycles maître (arrondi supérieur) couvrant `fixed_clocks`
pub fn master_cycles_for(fixed_clocks: i64, ratio: u32) -> Timestamp {
    let ratio = ratio.max(1) as i64;
    let cycles = fixed_clocks.saturating_add(ratio - 1) / ratio;
    cycles.clamp(0, Timestamp::MAX as i64) as Timestamp
}
