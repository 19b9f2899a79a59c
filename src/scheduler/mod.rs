//! Noyau de synchronisation à événements discrets
//!
//! Chaque unité matérielle possède un créneau dans une file d'événements
//! triée. La boucle principale avance le timestamp global et appelle
//! `update(timestamp)` sur l'unité la plus en retard, qui rend la date à
//! laquelle elle doit être rappelée.

pub mod budget;
pub mod event;

pub use budget::*;
pub use event::*;

use serde::{Deserialize, Serialize};

/// Compteur de cycles de bus émulés, partagé par toutes les unités
pub type Timestamp = i32;

/// Date « jamais » : une unité planifiée à cette date est désarmée
pub const DISABLED_TS: Timestamp = Timestamp::MAX;

/// Identifiant d'une unité matérielle planifiable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum UnitId {
    /// Contrôleur du bloc CD
    Cdb,
    /// Minuterie de lignes du VDP2
    Vdp2,
}

impl UnitId {
    /// Toutes les unités, dans l'ordre de leurs créneaux
    pub const ALL: [UnitId; 2] = [UnitId::Cdb, UnitId::Vdp2];

    /// Nombre d'unités planifiables
    pub const COUNT: usize = Self::ALL.len();

    /// Index du créneau dans l'arène (0 est la sentinelle de tête)
    pub(crate) fn slot(self) -> usize {
        self as usize + 1
    }

    pub(crate) fn from_slot(slot: usize) -> Option<UnitId> {
        slot.checked_sub(1).and_then(|i| Self::ALL.get(i).copied())
    }
}

/// Contrat de mise à jour d'une unité
///
/// `update` fait avancer l'état interne jusqu'à `timestamp` inclus et
/// retourne la prochaine date à laquelle l'unité a besoin d'être appelée.
/// Un timestamp antérieur au dernier vu est une erreur de programmation :
/// l'unité le journalise et ne recule jamais.
pub trait Unit {
    fn update(&mut self, timestamp: Timestamp) -> Timestamp;

    /// Rebasage : le timestamp global repart de zéro
    fn reset_ts(&mut self);
}

/// Aiguillage d'un événement vers l'unité concernée
///
/// Implémenté par le propriétaire des unités (la console), ce qui évite de
/// stocker des pointeurs de fonction dans les créneaux.
pub trait UnitDispatch {
    fn dispatch(&mut self, unit: UnitId, timestamp: Timestamp) -> Timestamp;
}
