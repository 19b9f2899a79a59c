//! Filtres de sélection de secteurs

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use super::pipeline::{FilterId, PartitionId};
use super::sector::{header_fad, Subheader};

bitflags! {
    /// Conditions actives d'un filtre
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct FilterMode: u8 {
        const FILE = 0x01;
        const CHANNEL = 0x02;
        const SUBMODE = 0x04;
        const CODING_INFO = 0x08;
        /// Inverse les conditions de sous-en-tête
        const SUBHEADER_REVERSE = 0x10;
        const FAD_RANGE = 0x40;
        /// Demande la remise à zéro des conditions
        const INIT = 0x80;
    }
}

/// Filtre : prédicat sur l'en-tête du secteur et connexions de sortie
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    pub mode: FilterMode,
    /// Partition qui reçoit les secteurs acceptés (`None` : rejet)
    pub true_conn: Option<PartitionId>,
    /// Filtre suivant pour les secteurs refusés (`None` : rejet)
    pub false_conn: Option<FilterId>,

    pub fad: u32,
    pub range: u32,

    pub channel: u8,
    pub file: u8,

    pub submode: u8,
    pub submode_mask: u8,

    pub coding_info: u8,
    pub coding_info_mask: u8,
}

impl Filter {
    /// Filtre au repos, connecté à la partition de même numéro
    pub fn new(id: FilterId) -> Self {
        Self {
            mode: FilterMode::empty(),
            true_conn: Some(PartitionId(id.0)),
            false_conn: None,
            fad: 0,
            range: 0,
            channel: 0,
            file: 0,
            submode: 0,
            submode_mask: 0,
            coding_info: 0,
            coding_info_mask: 0,
        }
    }

    /// Efface les conditions, conserve les connexions
    pub fn reset_conditions(&mut self) {
        self.mode = FilterMode::empty();
        self.fad = 0;
        self.range = 0;
        self.channel = 0;
        self.file = 0;
        self.submode = 0;
        self.submode_mask = 0;
        self.coding_info = 0;
        self.coding_info_mask = 0;
    }

    /// Évalue le prédicat sur un secteur brut
    pub fn matches(&self, data: &[u8]) -> bool {
        if self.mode.contains(FilterMode::FAD_RANGE) {
            let fad = header_fad(data);

            if fad < self.fad || fad >= self.fad.wrapping_add(self.range) {
                return false;
            }
        }

        let sh = Subheader::of(data);
        let subheader_conds = FilterMode::FILE | FilterMode::CHANNEL | FilterMode::SUBMODE | FilterMode::CODING_INFO;
        let reverse = self.mode.contains(FilterMode::SUBHEADER_REVERSE) && self.mode.intersects(subheader_conds);

        if self.mode.contains(FilterMode::FILE) && sh.file != self.file {
            return reverse;
        }

        if self.mode.contains(FilterMode::CHANNEL) && sh.channel != self.channel {
            return reverse;
        }

        if self.mode.contains(FilterMode::SUBMODE) && (sh.submode & self.submode_mask) != self.submode {
            return reverse;
        }

        if self.mode.contains(FilterMode::CODING_INFO) && (sh.coding_info & self.coding_info_mask) != self.coding_info {
            return reverse;
        }

        !reverse
    }
}
