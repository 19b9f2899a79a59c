//! Coroutine d'exécution des commandes hôte
//!
//! La coroutine est une machine à états explicite : chaque point de
//! suspension (`eat`, `yield`) enregistre une [`Continuation`] dans
//! [`CommandPhase`]. L'état complet est sérialisable, une sauvegarde prise
//! au milieu d'une commande reprend exactement au même point.
//!
//! Les coûts en cycles après publication des résultats reproduisent le
//! comportement observé du bloc CD ; ils conditionnent l'ordre des
//! interruptions vu par les programmes.

use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};

use super::drive::{DrivePhase, PositionInfo, PERIODIC_RELOAD, POS_FAD};
use super::filter::FilterMode;
use super::pipeline::{conn_raw, BufferId, FilterId, PartitionId, FILTER_COUNT, PARTITION_COUNT};
use super::registers::{status, Command, Hirq, SectorLength};
use super::sector::{header_fad, header_mode, Subheader};
use super::transfer::TransferSource;
use super::Cdb;
use crate::scheduler::fixed_cycles;

/// Cycles d'attente à la mise sous tension
pub const POWER_ON_CYCLES: i64 = 4_880_000;

/// Budget imposé par un `yield`
const YIELD_CYCLES: i64 = -500;

/// Point de reprise après un `eat`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Continuation {
    /// Fin du délai de mise sous tension
    PowerOnInit,
    /// Opération du système de fichiers terminée : lever EFLS
    FilesysIrq,
    /// Retour en haut de boucle
    Top,
    /// Commande capturée, exécution
    Dispatch,
    /// Lever des bits HIRQ puis terminer la commande
    RaiseIrq(Hirq),
    /// Réinitialisation logicielle programmée par INIT
    SoftResetArmed,
    /// Réinitialisation logicielle achevée
    SoftResetDone,
    /// Fin d'un transfert en écriture (BFUL éventuel, EHST)
    EndWriteTransfer,
    /// Fin de copie ou de déplacement (BFUL éventuel, ECPY)
    CopyDone,
}

/// État de la coroutine entre deux mises à jour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandPhase {
    PowerOn,
    Idle,
    /// Suspendue par `yield` : le budget repart de zéro à la reprise
    Yielded,
    Eating(Continuation),
}

/// Mots de commande capturés au début de l'exécution
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSnapshot {
    pub command: u8,
    pub words: [u16; 4],
}

/// Résultat de la dernière recherche par FAD
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FadSearch {
    pub fad: u32,
    pub spos: u16,
    pub pnum: u8,
}

enum Step {
    Top,
    Run(Continuation),
    Suspend,
}

/// Décalage / nombre de secteurs demandés, 0xFFFF résolu
fn resolve_range(count: usize, offs: u16, numsec: u16) -> (i64, i64) {
    let offs = if offs == 0xFFFF { count as i64 - 1 } else { offs as i64 };
    let numsec = if numsec == 0xFFFF { count as i64 - offs } else { numsec as i64 };
    (offs, numsec)
}

fn range_invalid(count: usize, offs: i64, numsec: i64) -> bool {
    numsec <= 0 || offs < 0 || offs + numsec > count as i64
}

/// Identifiant 24 bits réparti sur deux mots
fn word24(high: u16, low: u16) -> u32 {
    (((high & 0xFF) as u32) << 16) | low as u32
}

impl Cdb {
    /// Reprend la coroutine jusqu'à la prochaine suspension
    pub(super) fn command_resume(&mut self) {
        let mut step = match self.phase {
            CommandPhase::PowerOn => self.eat(POWER_ON_CYCLES, Continuation::PowerOnInit),
            CommandPhase::Idle => Step::Top,
            CommandPhase::Yielded => {
                self.budget.set_cycles(0);
                Step::Top
            }
            CommandPhase::Eating(cont) => {
                if self.budget.is_exhausted() {
                    Step::Suspend
                } else {
                    Step::Run(cont)
                }
            }
        };

        loop {
            step = match step {
                Step::Suspend => return,
                Step::Top => self.command_top(),
                Step::Run(cont) => self.command_continue(cont),
            };
        }
    }

    fn eat(&mut self, cycles: i64, then: Continuation) -> Step {
        if self.budget.eat(cycles) {
            self.phase = CommandPhase::Eating(then);
            Step::Suspend
        } else {
            Step::Run(then)
        }
    }

    fn yield_now(&mut self) -> Step {
        self.budget.set_cycles(YIELD_CYCLES);
        self.phase = CommandPhase::Yielded;
        Step::Suspend
    }

    fn command_top(&mut self) -> Step {
        if !self.command_pending {
            if self.filesys_run() {
                return self.eat(60, Continuation::FilesysIrq);
            }
            return self.yield_now();
        }

        self.ctr = CommandSnapshot {
            command: (self.cdata[0] >> 8) as u8,
            words: self.cdata,
        };

        if !self.results_read {
            warn!(
                "[CDB] Commande 0x{:02x} acceptée alors que les résultats précédents n'ont pas été lus",
                self.ctr.command
            );
        }

        debug!(
            "[CDB] Command: {:?} {:04x} {:04x} {:04x} {:04x} --- HIRQ=0x{:04x}, HIRQ_Mask=0x{:04x}",
            Command::from_code(self.ctr.command),
            self.ctr.words[0],
            self.ctr.words[1],
            self.ctr.words[2],
            self.ctr.words[3],
            self.hirq.bits(),
            self.hirq_mask.bits()
        );

        self.eat(84, Continuation::Dispatch)
    }

    fn command_continue(&mut self, cont: Continuation) -> Step {
        match cont {
            Continuation::PowerOnInit => {
                self.power_on_init();
                Step::Top
            }
            Continuation::FilesysIrq => {
                self.trigger_irq(Hirq::EFLS);
                self.eat(60, Continuation::Top)
            }
            Continuation::Top => Step::Top,
            Continuation::Dispatch => self.dispatch(),
            Continuation::RaiseIrq(bits) => {
                self.trigger_irq(bits);
                self.epilogue()
            }
            Continuation::SoftResetArmed => {
                self.sw_reset_pending = true;

                // Une commande arrivée pendant l'attente passe avant la réinitialisation
                if self.command_pending {
                    Step::Top
                } else {
                    self.epilogue()
                }
            }
            Continuation::SoftResetDone => {
                self.sw_reset_deferred =
                    Hirq::MPED | Hirq::EFLS | Hirq::ECPY | Hirq::EHST | Hirq::ESEL | Hirq::CMOK;

                // Si une commande attend, ses CMOK absorbent les bits différés
                if !self.command_pending {
                    self.trigger_irq(self.sw_reset_deferred);
                    self.sw_reset_deferred = Hirq::empty();
                }
                Step::Top
            }
            Continuation::EndWriteTransfer => {
                if self.pipeline.free_count() == 0 {
                    self.trigger_irq(Hirq::BFUL);
                }
                self.trigger_irq(Hirq::EHST);
                self.epilogue()
            }
            Continuation::CopyDone => {
                if self.pipeline.free_count() == 0 {
                    self.trigger_irq(Hirq::BFUL);
                }
                self.trigger_irq(Hirq::ECPY);
                self.epilogue()
            }
        }
    }

    /// Fin de commande : réinitialisation logicielle éventuelle
    fn epilogue(&mut self) -> Step {
        if self.sw_reset_pending {
            self.sw_reset_pending = false;
            self.sw_reset();
            return self.eat(8192 - 180, Continuation::SoftResetDone);
        }
        Step::Top
    }

    fn power_on_init(&mut self) {
        self.command_pending = false;
        self.sw_reset_pending = false;
        self.sw_reset_deferred = Hirq::empty();
        self.results_read = true;

        let drive = &mut self.drive;
        drive.play_cmd_start = 0;
        drive.play_cmd_end = 0;
        drive.play_cmd_rep_cnt = 0;
        drive.cur_play_repeat = 0;
        drive.play_repeat_counter = 0;

        drive.counter = fixed_cycles(1000);
        drive.phase = DrivePhase::EjectedWaiting;
        drive.toc_buffer.fill(0xFF);
        drive.periodic_counter = PERIODIC_RELOAD;

        let repcount = drive.pos.repcount;
        drive.pos = PositionInfo {
            is_cdrom: false,
            repcount,
            ..PositionInfo::unknown(status::OPEN)
        };
        drive.cdda.clear();

        self.auth_disc_type = 0;
        self.fs.file_info_valid = false;
        self.fs.root_dir_valid = false;

        self.sw_reset();

        self.drive.pos.status = status::BUSY;
        self.drive.pos.is_cdrom = false;
        self.drive.cur_sector = 0;

        // "CDBLOCK"
        self.results = [0x0043, 0x4442, 0x4c4f, 0x434b];
        self.results_read = false;
        self.trigger_irq(
            Hirq::CMOK | Hirq::DCHG | Hirq::ESEL | Hirq::EHST | Hirq::MPED | Hirq::ECPY | Hirq::EFLS,
        );
    }

    /// Réinitialisation logicielle du bloc CD
    pub(super) fn sw_reset(&mut self) {
        self.get_sec_len = SectorLength::Bytes2048;
        self.put_sec_len = SectorLength::Bytes2048;
        self.last_buf_dest = None;
        self.transfer = Default::default();
        self.pipeline.reset();
        self.fad_search = FadSearch::default();
        self.calced_actual_size = 0;

        self.drive.play_end_irq_type = 0;
        self.drive.cur_play_end = POS_FAD;
        self.drive.cur_play_repeat = 0;
        self.clear_pending_sec();

        self.fs.reset();
    }

    fn base_status(&self, rejected: bool, hb: u8) -> u8 {
        if rejected {
            return status::REJECTED;
        }

        let st = if self.tray_open {
            status::OPEN
        } else if self.disc.is_none() {
            status::NODISC
        } else {
            self.drive.pos.status
        };

        st | hb
    }

    /// Rapport de position dans les registres de résultat
    pub(super) fn make_report(&mut self, rejected: bool, hb: u8) {
        let pos = self.drive.pos;

        self.results = [
            ((self.base_status(rejected, hb) as u16) << 8)
                | ((pos.is_cdrom as u16) << 7)
                | (pos.repcount & 0x7F) as u16,
            ((pos.ctrl_adr as u16) << 8) | pos.tno as u16,
            ((pos.idx as u16) << 8) | ((pos.fad >> 16) & 0xFF) as u16,
            pos.fad as u16,
        ];
    }

    fn status_results(&mut self, rejected: bool, hb: u8) {
        self.make_report(rejected, hb);
        self.publish_results();
    }

    fn basic_results(&mut self, words: [u32; 4]) {
        self.results = words.map(|w| w as u16);
        self.publish_results();
    }

    fn publish_results(&mut self) {
        trace!(
            "[CDB]   Results: {:04x} {:04x} {:04x} {:04x}",
            self.results[0],
            self.results[1],
            self.results[2],
            self.results[3]
        );

        self.results_read = false;
        self.command_pending = false;
        self.trigger_irq(Hirq::CMOK | self.sw_reset_deferred);
        self.sw_reset_deferred = Hirq::empty();
    }

    fn reject(&mut self) -> Step {
        self.status_results(true, 0);
        self.epilogue()
    }

    fn wait(&mut self) -> Step {
        self.status_results(false, status::WAIT);
        self.epilogue()
    }

    fn report(&mut self) -> Step {
        self.status_results(false, 0);
        self.epilogue()
    }

    fn reply(&mut self, words: [u32; 4]) -> Step {
        self.basic_results(words);
        self.epilogue()
    }

    /// Statut de base décalé pour `results[0]`
    fn st(&self) -> u32 {
        (self.base_status(false, 0) as u32) << 8
    }

    fn dispatch(&mut self) -> Step {
        let cd = self.ctr.words;

        let Some(cmd) = Command::from_code(self.ctr.command) else {
            return self.unknown_command();
        };

        match cmd {
            Command::GetCdStatus => self.report(),
            Command::GetHwInfo => self.reply([self.st(), 0x0002, 0x0000, 0x0600]),
            Command::GetToc => self.cmd_get_toc(),
            Command::GetSessionInfo => self.cmd_get_session_info(cd),
            Command::Init => self.cmd_init(cd),
            Command::Open | Command::Scan => self.unknown_command(),
            Command::EndDataTransfer => self.cmd_end_data_transfer(),
            Command::Play => self.cmd_play(cd),
            Command::Seek => self.cmd_seek(cd),
            Command::GetSubcode => self.cmd_get_subcode(cd),
            Command::SetCdDeviceConn => {
                let fnum = (cd[2] >> 8) as u8;
                if fnum as usize >= FILTER_COUNT && fnum != 0xFF {
                    return self.reject();
                }
                self.pipeline.set_cd_device_conn(FilterId::new(fnum));
                self.status_results(false, 0);
                self.eat(96, Continuation::RaiseIrq(Hirq::ESEL))
            }
            Command::GetCdDeviceConn => {
                let conn = conn_raw(self.pipeline.cd_device_conn()) as u32;
                self.reply([self.st(), 0, conn << 8, 0])
            }
            Command::GetLastBufferDest => {
                let dest = conn_raw(self.last_buf_dest) as u32;
                self.reply([self.st(), 0, dest << 8, 0])
            }
            Command::SetFilterRange
            | Command::GetFilterRange
            | Command::SetFilterSubheader
            | Command::GetFilterSubheader
            | Command::SetFilterMode
            | Command::GetFilterMode
            | Command::SetFilterConn
            | Command::GetFilterConn => self.cmd_filter(cmd, cd),
            Command::ResetSelector => self.cmd_reset_selector(cd),
            Command::GetBufferSize => {
                let free = self.pipeline.free_count() as u32;
                let total = self.pipeline.buffer_count() as u32;
                self.reply([self.st(), free, (PARTITION_COUNT as u32) << 8, total])
            }
            Command::GetSectorNumber => {
                let Some(p) = PartitionId::new((cd[2] >> 8) as u8) else {
                    return self.reject();
                };
                let count = self.pipeline.partition_count(p) as u32;
                self.reply([self.st(), 0, 0, count])
            }
            Command::CalcActualSize => self.cmd_calc_actual_size(cd),
            Command::GetActualSize => {
                let size = self.calced_actual_size;
                self.reply([self.st() | (size >> 16), size, 0, 0])
            }
            Command::GetSectorInfo => self.cmd_get_sector_info(cd),
            Command::ExecFadSearch => self.cmd_exec_fad_search(cd),
            Command::GetFadSearch => {
                let fs = self.fad_search;
                self.reply([self.st(), fs.spos as u32, ((fs.pnum as u32) << 8) | (fs.fad >> 16), fs.fad])
            }
            Command::SetSectorLength => {
                let new_get = (cd[0] & 0xFF) as u8;
                let new_put = (cd[1] >> 8) as u8;
                let get = SectorLength::from_code(new_get);
                let put = SectorLength::from_code(new_put);

                if (new_get != 0xFF && get.is_none()) || (new_put != 0xFF && put.is_none()) {
                    return self.reject();
                }
                if let Some(len) = get {
                    self.get_sec_len = len;
                }
                if let Some(len) = put {
                    self.put_sec_len = len;
                }

                self.status_results(false, 0);
                self.trigger_irq(Hirq::ESEL);
                self.epilogue()
            }
            Command::GetSectorData | Command::DeleteSectorData | Command::GetDeleteSectorData => {
                self.cmd_sector_data(cmd, cd)
            }
            Command::PutSectorData => self.cmd_put_sector_data(cd),
            Command::CopySectorData | Command::MoveSectorData => self.cmd_copy_move(cmd, cd),
            Command::GetCopyError => self.reply([self.st(), 0, 0, 0]),
            Command::ChangeDir => self.cmd_change_dir(cd),
            Command::ReadDir => self.cmd_read_dir(cd),
            Command::GetFsScope => {
                if self.fs.active {
                    return self.wait();
                }
                if !self.fs.file_info_valid {
                    return self.reject();
                }
                let same_root = (self.fs.file_info[0].fad == self.fs.file_info[1].fad) as u32;
                let offs = self.fs.file_info_offs;
                let count = self.fs.file_info_valid_count as u32;
                self.reply([self.st(), count, (same_root << 8) | (offs >> 16), offs])
            }
            Command::GetFileInfo => self.cmd_get_file_info(cd),
            Command::ReadFile => self.cmd_read_file(cd),
            Command::AbortFile => {
                self.status_results(false, 0);
                self.fs.abort = true;
                self.epilogue()
            }
            Command::AuthDevice => self.cmd_auth_device(cd),
            Command::GetAuth => {
                if self.fs.active && self.fs.do_auth {
                    return self.reject();
                }
                self.reply([self.st(), self.auth_disc_type as u32, 0, 0])
            }
        }
    }

    fn unknown_command(&mut self) -> Step {
        let cd = self.ctr.words;
        warn!(
            "[CDB] Unknown Command: 0x{:04x} 0x{:04x} 0x{:04x} 0x{:04x} --- HIRQ=0x{:04x}, HIRQ_Mask=0x{:04x}",
            cd[0],
            cd[1],
            cd[2],
            cd[3],
            self.hirq.bits(),
            self.hirq_mask.bits()
        );

        self.results_read = false;
        self.command_pending = false;
        self.epilogue()
    }

    fn cmd_get_toc(&mut self) -> Step {
        if self.drive.phase == DrivePhase::Startup || self.transfer.active {
            return self.wait();
        }

        let st = (self.base_status(false, status::DTREQ) as u32) << 8;
        self.basic_results([st, 0xCC, 0, 0]);

        self.transfer.begin_read(vec![TransferSource::Toc], false);
        self.transfer.in_buf_offs = 0;
        self.transfer.in_buf_counter = 0xCC;
        self.transfer.active = true;

        self.eat(128, Continuation::RaiseIrq(Hirq::DRDY))
    }

    fn cmd_get_session_info(&mut self, cd: [u16; 4]) -> Step {
        if self.drive.phase == DrivePhase::Startup {
            return self.wait();
        }

        let sess = (cd[0] & 0xFF) as u32;
        let (fad, rsw) = match sess {
            0 => (150 + self.toc.leadout().lba, 0x01),
            1 => (0, sess),
            _ => (0xFF_FFFF, 0xFF),
        };

        self.reply([self.st(), 0, (rsw << 8) | (fad >> 16), fad])
    }

    fn cmd_init(&mut self, cd: [u16; 4]) -> Step {
        self.clear_pending_sec();
        self.drive.cur_play_end = POS_FAD;
        self.drive.cur_play_repeat = 0;
        self.drive.pos.status = status::BUSY;

        self.status_results(false, 0);

        if cd[0] & 0x01 != 0 {
            return self.eat(180, Continuation::SoftResetArmed);
        }
        self.epilogue()
    }

    fn cmd_end_data_transfer(&mut self) -> Step {
        if !self.transfer.active {
            return self.reply([self.st() | 0xFF, 0xFFFF, 0, 0]);
        }

        self.transfer.active = false;
        let total = self.transfer.total_counter;
        self.basic_results([self.st() | ((total >> 16) & 0xFF), total, 0, 0]);

        if self.transfer.in_buf_counter > 0 || self.transfer.fifo_len() > 0 {
            warn!(
                "[CDB] Data transfer ended prematurely at {} bytes left!",
                (self.transfer.in_buf_counter + self.transfer.fifo_len()) * 2
            );
        }

        let buffers: Vec<BufferId> = self.transfer.buffers().collect();

        if self.transfer.writing {
            let fnum = Some(self.transfer.fnum);
            self.pipeline.disconnect_input(fnum);

            for id in buffers {
                self.pipeline.route(fnum, id);
            }

            return self.eat(270, Continuation::EndWriteTransfer);
        }

        if self.transfer.need_buf_free {
            for id in buffers {
                if let Err(e) = self.pipeline.free(id) {
                    warn!("[CDB] Fin de transfert: {}", e);
                }
            }
        }

        match self.transfer.sources.first() {
            Some(TransferSource::SubcodeQ) | Some(TransferSource::SubcodeRw) => self.epilogue(),
            _ => self.eat(130, Continuation::RaiseIrq(Hirq::EHST)),
        }
    }

    fn cmd_play(&mut self, cd: [u16; 4]) -> Step {
        let mut psp = word24(cd[0], cd[1]);
        let mut pep = word24(cd[2], cd[3]);
        let pm = (cd[2] >> 8) as u8;

        if psp == 0xFF_FFFF {
            psp = self.drive.play_cmd_start;
        }

        if pep == 0xFF_FFFF {
            pep = self.drive.play_cmd_end;
        } else if psp & POS_FAD != 0 && pep & POS_FAD != 0 {
            // Fin relative : longueur ajoutée au début
            pep = POS_FAD | (psp.wrapping_add(pep) & 0x7F_FFFF);
        }

        if (psp ^ pep) & POS_FAD != 0 && pep != 0 {
            return self.reject();
        }

        self.drive.play_cmd_start = psp;
        self.drive.play_cmd_end = pep;

        self.drive.pos.status = status::BUSY;
        self.status_results(false, 0);

        if pm & 0x80 == 0 {
            self.clear_pending_sec();
        }

        self.drive.play_end_irq_type = Hirq::PEND.bits() as u32;
        self.drive.cur_play_end = pep;

        if pm & 0x70 == 0 {
            self.drive.play_cmd_rep_cnt = pm & 0x0F;
        }
        self.drive.cur_play_repeat = self.drive.play_cmd_rep_cnt;
        self.drive.play_repeat_counter = 0;

        self.start_seek(psp, pm & 0x80 != 0);
        self.epilogue()
    }

    fn cmd_seek(&mut self, cd: [u16; 4]) -> Step {
        self.drive.pos.status = status::BUSY;
        self.status_results(false, 0);

        let target = word24(cd[0], cd[1]);

        if target == 0 {
            // Arrêt
            self.clear_pending_sec();
            self.drive.pos = PositionInfo::unknown(status::BUSY);
            self.drive.phase = DrivePhase::Stopped;
            self.drive.counter = fixed_cycles(380_000);
        } else if target == 0xFF_FFFF {
            // Pause
            if self.drive.phase == DrivePhase::Stopped {
                self.clear_pending_sec();
                self.start_seek(POS_FAD | 150, false);
            }

            self.drive.sec_pre_buf_in = -self.drive.sec_pre_buf_in.abs();
            self.drive.play_end_irq_type = 0;
            self.drive.cur_play_end = POS_FAD;
            self.drive.cur_play_repeat = 0;
        } else {
            self.clear_pending_sec();
            self.drive.cur_play_end = POS_FAD;
            self.drive.cur_play_repeat = 0;
            self.start_seek(target, false);
        }

        self.epilogue()
    }

    fn cmd_get_subcode(&mut self, cd: [u16; 4]) -> Step {
        if self.transfer.active {
            return self.wait();
        }

        let kind = cd[0] & 0xFF;
        if kind >= 0x02 {
            return self.reject();
        }

        let st = (self.base_status(false, status::DTREQ) as u32) << 8;

        let (source, words) = if kind == 0 {
            (TransferSource::SubcodeQ, 0x05)
        } else {
            self.drive.subcode_rw.fill(0xFF);
            (TransferSource::SubcodeRw, 0x0C)
        };

        self.basic_results([st, words as u32, 0, 0]);

        self.transfer.begin_read(vec![source], false);
        self.transfer.in_buf_offs = 0;
        self.transfer.in_buf_counter = words;
        self.transfer.active = true;

        self.eat(128, Continuation::RaiseIrq(Hirq::DRDY))
    }

    fn cmd_filter(&mut self, cmd: Command, cd: [u16; 4]) -> Step {
        let Some(fid) = FilterId::new((cd[2] >> 8) as u8) else {
            return self.reject();
        };
        let fnum = fid.0 as u32;

        match cmd {
            Command::SetFilterRange => {
                self.pipeline.set_range(fid, word24(cd[0], cd[1]), word24(cd[2], cd[3]));
            }
            Command::GetFilterRange => {
                let f = self.pipeline.filter(fid);
                let (fad, range) = (f.fad, f.range);
                return self.reply([self.st() | (fad >> 16), fad, (fnum << 8) | (range >> 16), range]);
            }
            Command::SetFilterSubheader => {
                let f = self.pipeline.filter_mut(fid);
                f.channel = (cd[0] & 0xFF) as u8;
                f.submode_mask = (cd[1] >> 8) as u8;
                f.coding_info_mask = (cd[1] & 0xFF) as u8;
                f.file = (cd[2] & 0xFF) as u8;
                f.submode = (cd[3] >> 8) as u8;
                f.coding_info = (cd[3] & 0xFF) as u8;
            }
            Command::GetFilterSubheader => {
                let f = self.pipeline.filter(fid).clone();
                return self.reply([
                    self.st() | f.channel as u32,
                    ((f.submode_mask as u32) << 8) | f.coding_info_mask as u32,
                    (fnum << 8) | f.file as u32,
                    ((f.submode as u32) << 8) | f.coding_info as u32,
                ]);
            }
            Command::SetFilterMode => {
                let f = self.pipeline.filter_mut(fid);
                f.mode = FilterMode::from_bits_retain((cd[0] & 0xFF) as u8);
                if f.mode.contains(FilterMode::INIT) {
                    f.reset_conditions();
                }
            }
            Command::GetFilterMode => {
                let mode = self.pipeline.filter(fid).mode.bits() as u32;
                return self.reply([self.st() | mode, 0, fnum << 8, 0]);
            }
            Command::SetFilterConn => {
                let flags = cd[0] & 0xFF;
                let tconn = (cd[1] >> 8) as u8;
                let fconn = (cd[1] & 0xFF) as u8;
                let bad = |raw: u8, limit: usize| raw as usize >= limit && raw != 0xFF;

                if (flags & 0x1 != 0 && bad(tconn, PARTITION_COUNT)) || (flags & 0x2 != 0 && bad(fconn, FILTER_COUNT)) {
                    return self.reject();
                }
                if flags & 0x1 != 0 {
                    self.pipeline.set_true_conn(fid, PartitionId::new(tconn));
                }
                if flags & 0x2 != 0 {
                    self.pipeline.set_false_conn(fid, FilterId::new(fconn));
                }
            }
            Command::GetFilterConn => {
                let f = self.pipeline.filter(fid);
                let conns = ((conn_raw(f.true_conn) as u32) << 8) | conn_raw(f.false_conn) as u32;
                return self.reply([self.st(), conns, fnum << 8, 0]);
            }
            _ => return self.unknown_command(),
        }

        self.status_results(false, 0);
        self.eat(96, Continuation::RaiseIrq(Hirq::ESEL))
    }

    fn cmd_reset_selector(&mut self, cd: [u16; 4]) -> Step {
        let rflags = cd[0] & 0xFF;

        if rflags == 0 {
            let Some(p) = PartitionId::new((cd[2] >> 8) as u8) else {
                return self.reject();
            };
            self.pipeline.clear(p);
            self.status_results(false, 0);
            return self.eat(150, Continuation::RaiseIrq(Hirq::ESEL));
        }

        for i in 0..PARTITION_COUNT as u8 {
            let fid = FilterId(i);

            if rflags & 0x04 != 0 {
                self.pipeline.clear(PartitionId(i));
            }
            if rflags & 0x10 != 0 {
                self.pipeline.filter_mut(fid).reset_conditions();
            }
            if rflags & 0x20 != 0 {
                if self.pipeline.cd_device_conn() == Some(fid) {
                    self.pipeline.set_cd_device_conn(None);
                }
                self.pipeline.filter_mut(fid).false_conn = None;
            }
            if rflags & 0x40 != 0 {
                self.pipeline.set_true_conn(fid, Some(PartitionId(i)));
            }
            if rflags & 0x80 != 0 {
                self.pipeline.filter_mut(fid).false_conn = None;
            }
        }

        self.status_results(false, 0);
        self.eat(300, Continuation::RaiseIrq(Hirq::ESEL))
    }

    fn cmd_calc_actual_size(&mut self, cd: [u16; 4]) -> Step {
        let Some(p) = PartitionId::new((cd[2] >> 8) as u8) else {
            return self.reject();
        };

        let count = self.pipeline.partition_count(p);
        let (offs, numsec) = resolve_range(count, cd[1], cd[3]);

        if (self.transfer.active && self.transfer.writing) || range_invalid(count, offs, numsec) {
            return self.wait();
        }

        self.status_results(false, 0);

        let get_sec_len = self.get_sec_len;
        self.calced_actual_size = self
            .pipeline
            .iter_partition(p)
            .skip(offs as usize)
            .take(numsec as usize)
            .map(|id| {
                let sd = self.pipeline.data(id);
                match get_sec_len {
                    SectorLength::Bytes2048 => {
                        if header_mode(sd) == 0x2 && sd[18] & Subheader::SUBMODE_FORM2 != 0 {
                            1162
                        } else {
                            1024
                        }
                    }
                    SectorLength::Bytes2336 => 1168,
                    SectorLength::Bytes2340 => 1170,
                    SectorLength::Bytes2352 => 1176,
                }
            })
            .sum();

        self.eat(240, Continuation::RaiseIrq(Hirq::ESEL))
    }

    fn cmd_get_sector_info(&mut self, cd: [u16; 4]) -> Step {
        let offs = cd[1];
        let Some(p) = PartitionId::new((cd[2] >> 8) as u8) else {
            return self.reject();
        };
        let count = self.pipeline.partition_count(p);

        let id = if offs == 0xFFFF {
            self.pipeline.last_buffer(p)
        } else {
            self.pipeline.buffer_at(p, offs as usize)
        };

        let Some(id) = id.filter(|_| count > 0) else {
            return self.reject();
        };

        let sd = self.pipeline.data(id);
        let fad = header_fad(sd);
        let sh = Subheader::of(sd);

        self.reply([
            self.st() | (fad >> 16),
            fad,
            ((sh.file as u32) << 8) | sh.channel as u32,
            ((sh.submode as u32) << 8) | sh.coding_info as u32,
        ])
    }

    fn cmd_exec_fad_search(&mut self, cd: [u16; 4]) -> Step {
        let offs = cd[1];
        let sfad = word24(cd[2], cd[3]);
        let Some(p) = PartitionId::new((cd[2] >> 8) as u8) else {
            return self.reject();
        };
        let count = self.pipeline.partition_count(p);

        if count == 0 || (offs != 0xFFFF && offs as usize >= count) {
            return self.reject();
        }

        let effoffs = if offs == 0xFFFF { count - 1 } else { offs as usize };
        let mut search = FadSearch {
            fad: 0,
            spos: 0xFFFF,
            pnum: p.0,
        };
        let mut match_made = false;

        for (counter, id) in self.pipeline.iter_partition(p).enumerate() {
            if counter < effoffs {
                continue;
            }

            let fad = header_fad(self.pipeline.data(id));
            if fad <= sfad && fad >= search.fad + match_made as u32 {
                search.spos = counter as u16;
                search.fad = fad;
                match_made = true;
            }
        }

        self.fad_search = search;
        self.status_results(false, 0);
        self.eat(300, Continuation::RaiseIrq(Hirq::ESEL))
    }

    fn cmd_sector_data(&mut self, cmd: Command, cd: [u16; 4]) -> Step {
        let Some(p) = PartitionId::new((cd[2] >> 8) as u8) else {
            return self.reject();
        };

        let count = self.pipeline.partition_count(p);
        let (offs, numsec) = resolve_range(count, cd[1], cd[3]);
        let deleting = cmd == Command::DeleteSectorData;

        if (self.transfer.active && !deleting) || range_invalid(count, offs, numsec) {
            return self.wait();
        }

        let ids: Vec<BufferId> = self
            .pipeline
            .iter_partition(p)
            .skip(offs as usize)
            .take(numsec as usize)
            .collect();

        if deleting {
            self.status_results(false, 0);

            for id in ids {
                if let Err(e) = self.pipeline.unlink(p, id).and_then(|_| self.pipeline.free(id)) {
                    warn!("[CDB] Suppression de secteur: {}", e);
                }
            }

            return self.eat(485, Continuation::RaiseIrq(Hirq::EHST));
        }

        let get_and_delete = cmd == Command::GetDeleteSectorData;
        if get_and_delete {
            for &id in &ids {
                if let Err(e) = self.pipeline.unlink(p, id) {
                    warn!("[CDB] Lecture de secteur: {}", e);
                }
            }
        }

        self.status_results(false, status::DTREQ);

        self.transfer
            .begin_read(ids.into_iter().map(TransferSource::Buffer).collect(), get_and_delete);
        self.transfer_set_offsets();
        for _ in 0..5 {
            self.transfer_read_into_fifo();
        }
        self.transfer.active = true;

        self.eat(460, Continuation::RaiseIrq(Hirq::DRDY))
    }

    fn cmd_put_sector_data(&mut self, cd: [u16; 4]) -> Step {
        let Some(fid) = FilterId::new((cd[2] >> 8) as u8) else {
            return self.reject();
        };
        let numsec = cd[3] as usize;

        if numsec == 0 || numsec > self.pipeline.free_count() || self.transfer.active {
            return self.wait();
        }

        self.pipeline.disconnect_input(Some(fid));
        self.status_results(false, status::DTREQ);

        let mut ids = Vec::with_capacity(numsec);
        for _ in 0..numsec {
            match self.pipeline.allocate(true) {
                Ok(id) => ids.push(id),
                Err(e) => {
                    warn!("[CDB] Écriture de secteur: {}", e);
                    break;
                }
            }
        }

        self.transfer.begin_write(fid, ids);
        self.transfer_set_offsets();
        self.transfer.active = true;

        self.eat(300, Continuation::RaiseIrq(Hirq::DRDY))
    }

    fn cmd_copy_move(&mut self, cmd: Command, cd: [u16; 4]) -> Step {
        let dst = FilterId::new((cd[0] & 0xFF) as u8);
        let src = PartitionId::new((cd[2] >> 8) as u8);

        let (Some(dst), Some(src)) = (dst, src) else {
            return self.reject();
        };

        let moving = cmd == Command::MoveSectorData;
        let count = self.pipeline.partition_count(src);
        let (offs, numsec) = resolve_range(count, cd[1], cd[3]);

        if self.transfer.active
            || range_invalid(count, offs, numsec)
            || (!moving && numsec > self.pipeline.free_count() as i64)
        {
            return self.wait();
        }

        self.pipeline.disconnect_input(Some(dst));

        let ids: Vec<BufferId> = self
            .pipeline
            .iter_partition(src)
            .skip(offs as usize)
            .take(numsec as usize)
            .collect();

        for id in ids {
            if moving {
                if let Err(e) = self.pipeline.unlink(src, id) {
                    warn!("[CDB] Déplacement de secteur: {}", e);
                    continue;
                }
                self.pipeline.route(Some(dst), id);
            } else {
                let Ok(copy) = self.pipeline.allocate(false) else {
                    break;
                };
                let data = self.pipeline.data(id).to_vec();
                self.pipeline.data_mut(copy).copy_from_slice(&data);
                self.pipeline.route(Some(dst), copy);
            }
        }

        self.status_results(false, 0);
        self.eat(300, Continuation::CopyDone)
    }

    /// Configure un filtre pour lire une zone du disque vers sa partition
    fn route_filesys_read(&mut self, fid: FilterId, fad: u32, sectors: u32, mode: FilterMode) {
        self.pipeline.set_cd_device_conn(Some(fid));
        self.pipeline.set_true_conn(fid, Some(PartitionId(fid.0)));
        self.pipeline.set_false_conn(fid, None);
        self.pipeline.set_range(fid, fad, sectors);
        self.pipeline.filter_mut(fid).mode = mode;
    }

    /// Sélection par numéro de fichier seul
    fn select_file(&mut self, fid: FilterId, file: u8) {
        let f = self.pipeline.filter_mut(fid);
        f.file = file;
        f.channel = 0;
        f.submode = 0;
        f.submode_mask = 0;
        f.coding_info = 0;
        f.coding_info_mask = 0;
    }

    /// Lance la lecture d'un répertoire par la coroutine du système de fichiers
    fn start_dir_read(&mut self, fid: FilterId, fad: u32, size: u32, first_id: u32) {
        self.fs.pnum = PartitionId(fid.0);
        self.fs.total_max = size;
        self.fs.file_info_offs = first_id;
        self.fs.do_auth = false;
        self.fs.active = true;

        self.clear_pending_sec();
        self.drive.cur_play_end = 0;
        self.drive.cur_play_repeat = 0;
        self.drive.play_repeat_counter = 0;
        self.start_seek(POS_FAD | fad, false);
    }

    fn cmd_change_dir(&mut self, cd: [u16; 4]) -> Step {
        let fid = FilterId::new((cd[2] >> 8) as u8);
        let fileid = word24(cd[2], cd[3]);

        let reject = fid.is_none()
            || if fileid == 0xFF_FFFF {
                !self.fs.root_dir_valid
            } else {
                !self.fs.file_info_valid || self.fs.outside_window(fileid) || !self.fs.info(fileid).is_dir()
            };

        if self.fs.active {
            return self.wait();
        }
        let Some(fid) = fid.filter(|_| !reject) else {
            return self.reject();
        };

        self.status_results(false, 0);

        if fileid == 0 {
            return self.eat(400, Continuation::RaiseIrq(Hirq::EFLS));
        }

        let fi = if fileid == 0xFF_FFFF {
            self.fs.root_dir
        } else {
            self.fs.info(fileid)
        };

        self.pipeline.clear(PartitionId(fid.0));
        self.route_filesys_read(fid, fi.fad, (fi.size + 2047) >> 11, FilterMode::FAD_RANGE);
        self.select_file(fid, fi.fnum);
        self.start_dir_read(fid, fi.fad, fi.size, 2);
        self.epilogue()
    }

    fn cmd_read_dir(&mut self, cd: [u16; 4]) -> Step {
        let fid = FilterId::new((cd[2] >> 8) as u8);
        let mut start_fileid = word24(cd[2], cd[3]);

        if self.fs.active {
            return self.wait();
        }
        let Some(fid) = fid.filter(|_| self.fs.file_info_valid) else {
            return self.reject();
        };

        self.status_results(false, 0);

        let fi = self.fs.file_info[0];
        if start_fileid < self.fs.file_info_offs
            || start_fileid >= self.fs.file_info_offs + self.fs.file_info_valid_count as u32
        {
            start_fileid = 2;
        }

        self.route_filesys_read(fid, fi.fad, (fi.size + 2047) >> 11, FilterMode::FAD_RANGE);
        self.start_dir_read(fid, fi.fad, fi.size, start_fileid);
        self.epilogue()
    }

    fn cmd_get_file_info(&mut self, cd: [u16; 4]) -> Step {
        if self.fs.active || self.transfer.active {
            return self.wait();
        }

        let fileid = word24(cd[2], cd[3]);
        if !self.fs.file_info_valid || (fileid != 0xFF_FFFF && self.fs.outside_window(fileid)) {
            return self.reject();
        }

        self.transfer.begin_read(vec![TransferSource::FileInfo], false);
        if fileid == 0xFF_FFFF {
            self.transfer.in_buf_offs = 6 * 2;
            self.transfer.in_buf_counter = 6 * self.fs.file_info_valid_count as usize;
        } else {
            self.transfer.in_buf_offs = 6 * self.fs.info_index(fileid);
            self.transfer.in_buf_counter = 6;
        }
        self.transfer.active = true;

        let st = (self.base_status(false, status::DTREQ) as u32) << 8;
        self.basic_results([st, self.transfer.in_buf_counter as u32, 0, 0]);

        self.eat(128, Continuation::RaiseIrq(Hirq::DRDY))
    }

    fn cmd_read_file(&mut self, cd: [u16; 4]) -> Step {
        let offset = word24(cd[0], cd[1]);
        let fileid = word24(cd[2], cd[3]);
        let fid = FilterId::new((cd[2] >> 8) as u8);

        if self.fs.active {
            return self.wait();
        }
        let Some(fid) = fid.filter(|_| self.fs.file_info_valid && !self.fs.outside_window(fileid)) else {
            return self.reject();
        };

        self.status_results(false, 0);
        self.pipeline.clear(PartitionId(fid.0));

        let fi = self.fs.info(fileid);
        let start_fad = fi.fad.wrapping_add(offset) & 0xFF_FFFF;
        let sec_count = ((fi.size.wrapping_add(2047)) >> 11).wrapping_sub(offset);

        self.clear_pending_sec();
        self.route_filesys_read(fid, start_fad, sec_count, FilterMode::FAD_RANGE | FilterMode::FILE);
        self.select_file(fid, fi.fnum);

        self.drive.play_end_irq_type = Hirq::EFLS.bits() as u32;
        self.drive.cur_play_end = POS_FAD | (start_fad.wrapping_add(sec_count) & 0x7F_FFFF);
        self.drive.cur_play_repeat = 0;
        self.drive.play_repeat_counter = 0;

        self.start_seek(start_fad | POS_FAD, false);
        self.epilogue()
    }

    fn cmd_auth_device(&mut self, cd: [u16; 4]) -> Step {
        let Some(fid) = FilterId::new((cd[2] >> 8) as u8) else {
            return self.reject();
        };
        if self.fs.active {
            return self.wait();
        }

        self.status_results(false, 0);

        let Some(data_track_fad) = self.first_data_track_fad() else {
            self.auth_disc_type = 0x01;
            return self.eat(200, Continuation::RaiseIrq(Hirq::EFLS));
        };

        self.pipeline.set_cd_device_conn(Some(fid));
        self.pipeline.set_true_conn(fid, Some(PartitionId(fid.0)));
        self.pipeline.set_false_conn(fid, None);
        self.pipeline.set_range(fid, 0, 0);
        self.pipeline.filter_mut(fid).mode = FilterMode::empty();

        self.fs.pnum = PartitionId(fid.0);
        self.fs.do_auth = true;
        self.fs.active = true;

        self.clear_pending_sec();
        self.drive.cur_play_end = 0;
        self.drive.cur_play_repeat = 0;
        self.drive.play_repeat_counter = 0;
        self.start_seek(POS_FAD | (data_track_fad + 16), false);
        self.epilogue()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_range_sentinels() {
        assert_eq!(resolve_range(5, 0xFFFF, 0xFFFF), (4, 1));
        assert_eq!(resolve_range(5, 1, 0xFFFF), (1, 4));
        assert_eq!(resolve_range(0, 0xFFFF, 1), (-1, 1));
        assert!(range_invalid(0, -1, 1));
        assert!(range_invalid(3, 0, 5));
        assert!(!range_invalid(3, 1, 2));
    }

    #[test]
    fn test_word24() {
        assert_eq!(word24(0x10FF, 0x1234), 0xFF_1234);
    }
}
