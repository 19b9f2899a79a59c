//! Contrôleur du bloc CD (CDB)
//!
//! Le bloc CD est une unité planifiable : chaque appel à `update` fait
//! avancer le modèle du lecteur des cycles écoulés, puis reprend la
//! coroutine de commandes avec le budget obtenu. L'hôte dialogue par les
//! registres (`read`/`write`) : quatre mots de commande, quatre mots de
//! résultat, le registre d'interruptions et la FIFO de données.
//!
//! ```text
//!   lecteur ──► CD device conn ──► filtre ─┬─► partition ──► transfert hôte
//!                                          └─► filtre suivant ...
//! ```

pub mod command;
pub mod disc;
pub mod drive;
pub mod filesys;
pub mod filter;
pub mod pipeline;
pub mod registers;
pub mod sector;
pub mod state;
pub mod transfer;

pub use command::{CommandPhase, Continuation};
pub use disc::{Disc, MemoryDisc, Toc, TrackKind};
pub use drive::{DrivePhase, PositionInfo};
pub use filesys::FileInfo;
pub use filter::{Filter, FilterMode};
pub use pipeline::{BufferId, FilterId, PartitionId, Pipeline, PipelineError};
pub use registers::{reg, status, Command, Hirq, SectorLength};
pub use state::StateError;

use std::sync::Arc;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::scheduler::{clock_ratio, master_cycles_for, ClockBudget, Timestamp, Unit};
use crate::NTSC_MASTER_CLOCK;
use command::{CommandSnapshot, FadSearch};
use drive::{Drive, DRIVE_CLOCK};
use filesys::Filesys;
use pipeline::DEFAULT_BUFFER_COUNT;
use transfer::DataTransfer;

/// Unité bloc CD
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cdb {
    hirq: Hirq,
    hirq_mask: Hirq,
    cdata: [u16; 4],
    results: [u16; 4],

    command_pending: bool,
    results_read: bool,
    /// Bits HIRQ différés jusqu'au prochain CMOK après réinitialisation logicielle
    sw_reset_deferred: Hirq,
    sw_reset_pending: bool,

    get_sec_len: SectorLength,
    put_sec_len: SectorLength,

    auth_disc_type: u8,
    last_buf_dest: Option<FilterId>,

    pipeline: Pipeline,
    fad_search: FadSearch,
    calced_actual_size: u32,

    tray_open: bool,
    #[serde(skip)]
    disc: Option<Arc<dyn Disc>>,
    toc: Toc,

    last_ts: Timestamp,
    phase: CommandPhase,
    budget: ClockBudget,
    #[serde(skip)]
    clock_ratio: u32,
    ctr: CommandSnapshot,

    transfer: DataTransfer,
    drive: Drive,
    fs: Filesys,
}

impl Cdb {
    /// Crée le bloc CD avec `buffer_count` tampons de secteur
    ///
    /// `clock_ratio` convertit les cycles maître en cycles du lecteur
    /// (virgule fixe 32.32, voir [`clock_ratio`]).
    pub fn new(buffer_count: usize, clock_ratio: u32) -> Self {
        let mut cdb = Self {
            hirq: Hirq::empty(),
            hirq_mask: Hirq::empty(),
            cdata: [0; 4],
            results: [0; 4],
            command_pending: false,
            results_read: true,
            sw_reset_deferred: Hirq::empty(),
            sw_reset_pending: false,
            get_sec_len: SectorLength::Bytes2048,
            put_sec_len: SectorLength::Bytes2048,
            auth_disc_type: 0,
            last_buf_dest: None,
            pipeline: Pipeline::new(buffer_count),
            fad_search: FadSearch::default(),
            calced_actual_size: 0,
            tray_open: true,
            disc: None,
            toc: Toc::new(),
            last_ts: 0,
            phase: CommandPhase::PowerOn,
            budget: ClockBudget::new(),
            clock_ratio: clock_ratio.max(1),
            ctr: CommandSnapshot::default(),
            transfer: DataTransfer::new(),
            drive: Drive::new(),
            fs: Filesys::new(),
        };
        cdb.reset();
        cdb
    }

    /// Réinitialisation matérielle ; la coroutine repart de la mise sous tension
    pub fn reset(&mut self) {
        self.hirq = Hirq::empty();
        self.hirq_mask = Hirq::empty();

        self.drive.periodic_counter = i64::MAX;
        self.drive.phase = drive::DrivePhase::Resetting;
        self.drive.counter = i64::MAX;

        self.results = [0; 4];
        self.results_read = true;

        self.phase = CommandPhase::PowerOn;
        self.budget = ClockBudget::new();
    }

    /// Insère ou retire un disque ; un plateau ouvert masque le disque
    pub fn set_disc(&mut self, tray_open: bool, disc: Option<Arc<dyn Disc>>) {
        self.tray_open = tray_open;
        self.disc = if tray_open { None } else { disc };

        match &self.disc {
            None => {
                if self.drive.phase != DrivePhase::Resetting {
                    self.auth_disc_type = 0;
                    self.drive.phase = DrivePhase::Ejected;
                    self.drive.counter = crate::scheduler::fixed_cycles(1000);
                }
            }
            Some(disc) => self.toc = disc.read_toc(),
        }
    }

    pub(crate) fn disc_present(&self) -> bool {
        self.disc.is_some()
    }

    pub(crate) fn trigger_irq(&mut self, bits: Hirq) {
        self.hirq |= bits;
    }

    /// Lecture hôte d'un registre (offset en mots)
    pub fn read(&mut self, offset: u32) -> u16 {
        if (reg::CR1..=reg::CR4).contains(&offset) && self.command_pending {
            warn!("[CDB] Lecture de CR{} pendant qu'une commande est en attente", offset - reg::CR1 + 1);
        }

        match offset {
            reg::DATA => self.transfer_read_word(),
            reg::HIRQ => self.hirq.bits(),
            reg::HIRQ_MASK => self.hirq_mask.bits(),
            reg::CR1..=reg::CR3 => self.results[(offset - reg::CR1) as usize],
            reg::CR4 => {
                self.results_read = true;
                self.results[3]
            }
            _ => {
                warn!("[CDB] Lecture d'un registre inconnu: 0x{:x}", offset);
                0
            }
        }
    }

    /// Écriture hôte d'un registre ; `true` si une commande vient d'être soumise
    ///
    /// L'appelant doit alors planifier le bloc CD à `ts + 1`.
    pub fn write(&mut self, offset: u32, value: u16, mask: u16) -> bool {
        if (reg::CR1..=reg::CR4).contains(&offset) && self.command_pending {
            warn!(
                "[CDB] Écriture de CR{} (0x{:04x}) pendant qu'une commande est en attente",
                offset - reg::CR1 + 1,
                value
            );
        }

        match offset {
            reg::DATA => self.transfer_write_word(value, mask),
            reg::HIRQ => {
                // Les bits écrits à 0 sont effacés
                self.hirq = Hirq::from_bits_retain(self.hirq.bits() & (value | !mask));
            }
            reg::HIRQ_MASK => {
                self.hirq_mask = Hirq::from_bits_retain((self.hirq_mask.bits() & !mask) | (value & mask));
            }
            reg::CR1..=reg::CR4 => {
                let i = (offset - reg::CR1) as usize;
                self.cdata[i] = (self.cdata[i] & !mask) | (value & mask);

                if offset == reg::CR4 && mask == 0xFFFF {
                    self.command_pending = true;
                    return true;
                }
            }
            _ => warn!("[CDB] Écriture d'un registre inconnu: 0x{:x} <- 0x{:04x}", offset, value),
        }

        false
    }

    /// Ligne d'interruption vers le processeur hôte
    pub fn irq_asserted(&self) -> bool {
        self.hirq.bits() & self.hirq_mask.bits() != 0
    }

    /// Échantillon stéréo CD-DA suivant, silence si le tampon est vide
    pub fn take_cdda_sample(&mut self) -> [u16; 2] {
        self.drive.cdda.pop().unwrap_or([0, 0])
    }

    pub fn hirq(&self) -> Hirq {
        self.hirq
    }

    pub fn hirq_mask(&self) -> Hirq {
        self.hirq_mask
    }

    pub fn results(&self) -> [u16; 4] {
        self.results
    }

    pub fn results_read(&self) -> bool {
        self.results_read
    }

    pub fn is_command_pending(&self) -> bool {
        self.command_pending
    }

    pub fn command_phase(&self) -> CommandPhase {
        self.phase
    }

    pub fn drive_phase(&self) -> DrivePhase {
        self.drive.phase
    }

    pub fn position(&self) -> PositionInfo {
        self.drive.pos
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn toc(&self) -> &Toc {
        &self.toc
    }

    pub fn transfer_active(&self) -> bool {
        self.transfer.active
    }

    pub fn filesys_active(&self) -> bool {
        self.fs.active
    }

    pub fn root_dir(&self) -> Option<FileInfo> {
        self.fs.root_dir_valid.then_some(self.fs.root_dir)
    }

    pub fn auth_disc_type(&self) -> u8 {
        self.auth_disc_type
    }

    pub fn sector_lengths(&self) -> (SectorLength, SectorLength) {
        (self.get_sec_len, self.put_sec_len)
    }

    pub fn last_ts(&self) -> Timestamp {
        self.last_ts
    }

    pub fn clock_ratio(&self) -> u32 {
        self.clock_ratio
    }

    pub fn budget(&self) -> ClockBudget {
        self.budget
    }
}

impl Default for Cdb {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_COUNT, clock_ratio(DRIVE_CLOCK as u32, NTSC_MASTER_CLOCK))
    }
}

impl Unit for Cdb {
    fn update(&mut self, timestamp: Timestamp) -> Timestamp {
        if timestamp < self.last_ts {
            warn!(
                "[CDB] Timestamp en arrière: {} < {}, mise à jour ignorée",
                timestamp, self.last_ts
            );
        } else {
            let clocks = (timestamp - self.last_ts) as i64 * self.clock_ratio as i64;
            self.last_ts = timestamp;

            self.drive_run(clocks);
            self.budget.credit(clocks);
            self.command_resume();
        }

        let wait = self
            .budget
            .deficit()
            .min(self.drive.counter)
            .min(self.drive.periodic_counter);

        self.last_ts.saturating_add(master_cycles_for(wait, self.clock_ratio))
    }

    fn reset_ts(&mut self) {
        self.last_ts = 0;
    }
}
