//! Modèle du lecteur : éjection, démarrage, recherche, lecture
//!
//! Le lecteur avance par phases temporisées en virgule fixe 32.32. En
//! lecture, chaque secteur passe par un pré-tampon : les secteurs de
//! données sont routés dans le graphe de filtres, les secteurs audio
//! alimentent l'anneau CD-DA. Un compteur périodique publie l'état et le
//! sous-code Q.

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use super::disc::CTRL_DATA;
use super::registers::{status, Hirq};
use super::sector::{bcd_to_u8, FAD_LBA_OFFSET, RAW_SECTOR_SIZE, SUBCHANNEL_SIZE};
use super::Cdb;
use crate::scheduler::fixed_cycles;

/// Horloge du lecteur (44,1 kHz × 256)
pub const DRIVE_CLOCK: i64 = 44100 * 256;

/// Rechargement du compteur périodique hors lecture
pub const PERIODIC_RELOAD: i64 = fixed_cycles(187_065);

/// Période du compteur périodique en lecture
pub const PERIODIC_PLAYING: i64 = fixed_cycles(17_712);

/// Trames CD-DA insérées avant le premier secteur audio
pub const CDDA_PREFILL: usize = 4;

/// Capacité de l'anneau CD-DA (trames stéréo)
pub const CDDA_CAPACITY: usize = 4 + 588 + 4;

/// Taille de la table des matières traduite (0xCC mots)
pub const TOC_BUFFER_SIZE: usize = (99 + 3) * 4;

/// Adresse « absolue » : bit 23 des positions de lecture
pub const POS_FAD: u32 = 0x80_0000;

/// Phase du lecteur
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DrivePhase {
    Stopped,
    Playing,
    SeekStart,
    Seeking,
    /// Plateau ouvert : publie DCHG
    Ejected,
    /// Délai avant EFLS
    EjectedSettle,
    EjectedWaiting,
    Startup,
    Resetting,
}

/// Position courante rapportée dans les résultats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionInfo {
    pub status: u8,
    pub fad: u32,
    pub rel_fad: u32,
    pub ctrl_adr: u8,
    pub idx: u8,
    pub tno: u8,
    pub is_cdrom: bool,
    pub repcount: u8,
}

impl PositionInfo {
    /// Position inconnue (plateau ouvert, arrêt)
    pub fn unknown(status: u8) -> Self {
        Self {
            status,
            fad: 0xFF_FFFF,
            rel_fad: 0xFF_FFFF,
            ctrl_adr: 0xFF,
            idx: 0xFF,
            tno: 0xFF,
            is_cdrom: true,
            repcount: 0x7F,
        }
    }
}

/// Anneau de trames CD-DA
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CddaBuffer {
    frames: Vec<[u16; 2]>,
    rp: usize,
    wp: usize,
    count: usize,
}

impl CddaBuffer {
    pub fn new() -> Self {
        Self {
            frames: vec![[0; 2]; CDDA_CAPACITY],
            rp: 0,
            wp: 0,
            count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_full(&self) -> bool {
        self.count >= CDDA_CAPACITY
    }

    pub fn clear(&mut self) {
        self.rp = 0;
        self.wp = 0;
        self.count = 0;
    }

    pub fn push(&mut self, frame: [u16; 2]) {
        self.frames[self.wp] = frame;
        self.wp = (self.wp + 1) % CDDA_CAPACITY;
        self.count += 1;
    }

    pub fn pop(&mut self) -> Option<[u16; 2]> {
        if self.count == 0 {
            return None;
        }

        let frame = self.frames[self.rp];
        self.rp = (self.rp + 1) % CDDA_CAPACITY;
        self.count -= 1;
        Some(frame)
    }

    pub fn sanitize(&mut self) {
        self.frames.resize(CDDA_CAPACITY, [0; 2]);
        self.rp %= CDDA_CAPACITY;
        self.wp %= CDDA_CAPACITY;
        self.count = self.count.min(CDDA_CAPACITY);
    }
}

impl Default for CddaBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// État du lecteur et de la tête de lecture
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Drive {
    pub phase: DrivePhase,
    pub counter: i64,
    pub periodic_counter: i64,
    pub seek_index_phase: i32,
    pub cur_sector: u32,

    pub play_repeat_counter: u8,
    pub cur_play_repeat: u8,
    pub cur_play_start: u32,
    pub cur_play_end: u32,
    /// Bits HIRQ à lever en fin de lecture ; les bits 30-31 comptent le délai
    pub play_end_irq_type: u32,

    pub play_cmd_start: u32,
    pub play_cmd_end: u32,
    pub play_cmd_rep_cnt: u8,

    pub cdda: CddaBuffer,

    pub sec_pre_buf: Vec<u8>,
    /// >0 : secteur en attente ; <0 : pause avec secteur retenu
    pub sec_pre_buf_in: i32,

    pub toc_buffer: Vec<u8>,
    pub pos: PositionInfo,

    pub subcode_q: Vec<u8>,
    pub subcode_rw: Vec<u8>,

    pub subq: [u8; 12],
    pub subq_safe: [u8; 12],
    pub subq_safe_valid: bool,
}

impl Drive {
    pub fn new() -> Self {
        Self {
            phase: DrivePhase::Resetting,
            counter: i64::MAX,
            periodic_counter: i64::MAX,
            seek_index_phase: 0,
            cur_sector: 0,
            play_repeat_counter: 0,
            cur_play_repeat: 0,
            cur_play_start: 0,
            cur_play_end: 0,
            play_end_irq_type: 0,
            play_cmd_start: 0,
            play_cmd_end: 0,
            play_cmd_rep_cnt: 0,
            cdda: CddaBuffer::new(),
            sec_pre_buf: vec![0; RAW_SECTOR_SIZE + SUBCHANNEL_SIZE],
            sec_pre_buf_in: 0,
            toc_buffer: vec![0xFF; TOC_BUFFER_SIZE],
            pos: PositionInfo::unknown(status::BUSY),
            subcode_q: vec![0; 10],
            subcode_rw: vec![0; 24],
            subq: [0; 12],
            subq_safe: [0; 12],
            subq_safe_valid: false,
        }
    }

    fn playing_data(&self) -> bool {
        self.subq_safe[0] & 0x40 != 0
    }

    /// Durée d'un secteur à la vitesse courante
    fn sector_period(&self) -> i64 {
        fixed_cycles(DRIVE_CLOCK / if self.playing_data() { 150 } else { 75 })
    }

    pub fn sanitize(&mut self) {
        self.cdda.sanitize();
        self.sec_pre_buf.resize(RAW_SECTOR_SIZE + SUBCHANNEL_SIZE, 0);
        self.toc_buffer.resize(TOC_BUFFER_SIZE, 0xFF);
        self.subcode_q.resize(10, 0);
        self.subcode_rw.resize(24, 0);
    }
}

impl Default for Drive {
    fn default() -> Self {
        Self::new()
    }
}

/// Temps de recherche (cycles lecteur) pour un déplacement de `delta` secteurs
pub fn seek_time(delta: i64) -> i64 {
    let mut t = 6 * DRIVE_CLOCK / 150;
    t += delta.abs() * if delta < 0 { 28 } else { 26 };
    if delta < 0 || delta >= 150 {
        t += DRIVE_CLOCK / 150;
    }
    t
}

impl Cdb {
    /// Avance le lecteur de `clocks` cycles (virgule fixe)
    pub(super) fn drive_run(&mut self, clocks: i64) {
        self.drive.counter = self.drive.counter.saturating_sub(clocks);
        self.drive.periodic_counter = self.drive.periodic_counter.saturating_sub(clocks);

        while self.drive.counter <= 0 {
            match self.drive.phase {
                DrivePhase::Ejected => {
                    self.drive.toc_buffer.fill(0xFF);
                    self.auth_disc_type = 0;
                    self.fs.file_info_valid = false;
                    self.fs.root_dir_valid = false;
                    self.drive.pos = PositionInfo::unknown(status::OPEN);
                    self.trigger_irq(Hirq::DCHG);

                    self.drive.phase = DrivePhase::EjectedSettle;
                    self.drive.counter = fixed_cycles(4000);
                }
                DrivePhase::EjectedSettle => {
                    self.trigger_irq(Hirq::EFLS);
                    self.drive.phase = DrivePhase::EjectedWaiting;
                    self.drive.counter = fixed_cycles(1);
                }
                DrivePhase::EjectedWaiting => {
                    if self.disc_present() {
                        self.drive.pos.status = status::BUSY;
                        self.drive.phase = DrivePhase::Startup;
                        self.drive.counter = fixed_cycles(DRIVE_CLOCK);
                    } else {
                        self.drive.counter = fixed_cycles(1000);
                    }
                }
                DrivePhase::Startup => {
                    if !self.disc_present() {
                        self.drive.phase = DrivePhase::Ejected;
                        self.drive.counter = fixed_cycles(1000);
                        continue;
                    }

                    self.translate_toc();
                    self.clear_pending_sec();
                    self.drive.play_end_irq_type = 0;
                    self.drive.cur_play_end = POS_FAD;
                    self.drive.cur_play_repeat = 0;
                    self.start_seek(POS_FAD | FAD_LBA_OFFSET, false);
                }
                DrivePhase::Stopped => {
                    self.drive.pos.status = status::STANDBY;
                    self.drive.counter += fixed_cycles(2000);
                }
                DrivePhase::SeekStart => {
                    let delta = self.drive.pos.fad as i64 - self.drive.cur_sector as i64;

                    self.drive.pos.status = status::SEEK;
                    self.drive.phase = DrivePhase::Seeking;
                    self.drive.counter += fixed_cycles(seek_time(delta));
                    self.drive.cur_sector = self.drive.pos.fad;
                    self.drive.subq_safe_valid = false;
                }
                DrivePhase::Seeking => self.drive_seek_step(),
                DrivePhase::Playing => self.drive_play_step(),
                DrivePhase::Resetting => {
                    self.drive.counter = i64::MAX;
                }
            }
        }

        if self.drive.periodic_counter <= 0 {
            self.drive_periodic();
        }
    }

    fn drive_seek_step(&mut self) {
        let Some(disc) = self.disc.clone() else {
            self.drive.phase = DrivePhase::Ejected;
            self.drive.counter = fixed_cycles(1000);
            return;
        };

        let old_safe_valid = self.drive.subq_safe_valid;
        let mut pw = [0u8; SUBCHANNEL_SIZE];
        disc.read_raw_pw(self.drive.cur_sector as i32 - FAD_LBA_OFFSET as i32, &mut pw);
        self.decode_subq(&pw);

        let step = fixed_cycles(DRIVE_CLOCK / 150);

        if !self.drive.subq_safe_valid {
            self.drive.cur_sector += 1;
            self.drive.counter += step;
            return;
        }

        if !old_safe_valid {
            self.drive.cur_sector = self.drive.pos.fad;
        }

        let mut index_ok = true;

        if self.drive.cur_play_start & POS_FAD == 0 {
            let (start_track, start_index) = self.track_index_target(self.drive.cur_play_start);
            let sq_idx = bcd_to_u8(self.drive.subq_safe[2]) as u32;
            let sq_tno = subq_track(self.drive.subq_safe[1]) as u32;

            if sq_idx < start_index && sq_tno <= start_track {
                index_ok = false;
                self.drive.counter += step;
                if self.drive.seek_index_phase == 2 {
                    self.drive.cur_sector += 4;
                } else {
                    self.drive.cur_sector += 128;
                    self.drive.seek_index_phase = 1;
                }
            } else if self.drive.seek_index_phase == 1 {
                index_ok = false;
                self.drive.cur_sector = self.drive.cur_sector.saturating_sub(124);
                self.drive.counter += step;
                self.drive.seek_index_phase = 2;
            }
        }

        if index_ok {
            self.drive.phase = DrivePhase::Playing;
            self.drive.counter += self.drive.sector_period();
        }
    }

    fn drive_play_step(&mut self) {
        if self.drive.sec_pre_buf_in > 0 {
            if self.drive.playing_data() {
                self.drive.pos.is_cdrom = true;

                if self.pipeline.free_count() > 0 {
                    if let Ok(id) = self.pipeline.allocate(false) {
                        self.pipeline.data_mut(id)[..RAW_SECTOR_SIZE]
                            .copy_from_slice(&self.drive.sec_pre_buf[..RAW_SECTOR_SIZE]);
                        self.drive.sec_pre_buf_in = 0;

                        let entry = self.pipeline.cd_device_conn();
                        self.last_buf_dest = self.pipeline.route(entry, id);
                        self.trigger_irq(Hirq::CSCT);
                        if self.pipeline.free_count() == 0 {
                            self.trigger_irq(Hirq::BFUL);
                        }
                    }
                }
            } else {
                self.drive.pos.is_cdrom = false;

                if self.drive.cdda.is_empty() {
                    for _ in 0..CDDA_PREFILL {
                        self.drive.cdda.push([0, 0]);
                    }
                }

                for frame in self.drive.sec_pre_buf[..RAW_SECTOR_SIZE].chunks_exact(4) {
                    if self.drive.cdda.is_full() {
                        break;
                    }
                    let left = u16::from_le_bytes([frame[0], frame[1]]);
                    let right = u16::from_le_bytes([frame[2], frame[3]]);
                    self.drive.cdda.push([left, right]);
                }

                self.drive.sec_pre_buf_in = 0;
            }

            if self.drive.sec_pre_buf_in == 0 {
                self.drive.pos.status = status::PLAY;
            }
        }

        self.drive.periodic_counter = PERIODIC_PLAYING;

        if self.drive.sec_pre_buf_in != 0 {
            self.drive.pos.status = status::PAUSE;

            if self.drive.sec_pre_buf_in > 0 {
                debug!("[CDB] Pré-tampon de secteur plein");
            }
        } else if let Some(disc) = self.disc.clone() {
            let lba = self.drive.cur_sector as i32 - FAD_LBA_OFFSET as i32;
            disc.read_raw_sector(lba, &mut self.drive.sec_pre_buf);
            self.drive.sec_pre_buf_in = 1;
            self.drive.pos.fad = self.drive.cur_sector;

            let mut pw = [0u8; SUBCHANNEL_SIZE];
            pw.copy_from_slice(&self.drive.sec_pre_buf[RAW_SECTOR_SIZE..RAW_SECTOR_SIZE + SUBCHANNEL_SIZE]);
            if self.decode_subq(&pw) {
                let q = self.drive.subq;
                self.drive.pos.rel_fad =
                    (bcd_to_u8(q[3]) as u32 * 60 + bcd_to_u8(q[4]) as u32) * 75 + bcd_to_u8(q[5]) as u32;
                self.drive.pos.tno = subq_track(q[1]);
                self.drive.pos.idx = bcd_to_u8(q[2]);
            }
            self.drive.cur_sector += 1;
        }

        self.drive.counter += self.drive.sector_period();
    }

    /// Fin de lecture, répétition, rapport périodique et sous-code Q
    fn drive_periodic(&mut self) {
        self.drive.periodic_counter = PERIODIC_RELOAD;

        if self.drive.sec_pre_buf_in != 0 && self.drive.phase == DrivePhase::Playing {
            if self.play_end_reached() {
                self.drive.sec_pre_buf_in = 0;

                if self.drive.play_repeat_counter >= self.drive.cur_play_repeat {
                    self.drive.cur_sector = self.drive.pos.fad;

                    if self.drive.play_end_irq_type != 0 {
                        self.drive.pos.status = status::BUSY;
                        self.drive.play_end_irq_type = self.drive.play_end_irq_type.wrapping_add(1 << 30);

                        if (self.drive.play_end_irq_type >> 30) >= 3 {
                            // Pas d'IRQ après une répétition sans secteur valide depuis
                            if self.drive.play_repeat_counter & 0x80 == 0 {
                                let bits = Hirq::from_bits_truncate(self.drive.play_end_irq_type as u16);
                                self.trigger_irq(bits);
                            }
                            self.drive.play_end_irq_type = 0;
                        }
                    }

                    if self.drive.play_end_irq_type == 0 {
                        self.drive.pos.status = status::PAUSE;
                    }
                } else {
                    if self.drive.play_repeat_counter < 0xE {
                        self.drive.play_repeat_counter += 1;
                    }
                    self.drive.play_repeat_counter |= 0x80;
                    self.start_seek(self.drive.play_cmd_start, false);
                }
            } else {
                self.drive.play_repeat_counter &= !0x80;
            }
        }

        self.drive.periodic_counter = PERIODIC_RELOAD;

        if self.results_read {
            self.make_report(false, status::PERIODIC);
        }

        let pos = self.drive.pos;
        let q = &mut self.drive.subcode_q;
        q[0] = pos.ctrl_adr;
        q[1] = pos.tno;
        q[2] = pos.idx;
        q[3..6].copy_from_slice(&pos.rel_fad.to_be_bytes()[1..4]);
        q[6] = 0;
        q[7..10].copy_from_slice(&pos.fad.to_be_bytes()[1..4]);

        self.trigger_irq(Hirq::SCDQ);
    }

    fn play_end_reached(&self) -> bool {
        let pos = &self.drive.pos;
        let mut end_met = pos.tno == 0xAA;
        let end = self.drive.cur_play_end;

        if end != 0 {
            if end & POS_FAD != 0 {
                end_met |= pos.fad >= (end & 0x7F_FFFF);
            } else {
                let (end_track, end_index) = self.track_index_target(end);
                let tno = pos.tno as u32;
                end_met |= tno > end_track || (tno == end_track && pos.idx as u32 > end_index);
            }
        }

        let start = self.drive.cur_play_start;
        if start & POS_FAD != 0 {
            end_met |= pos.fad < (start & 0x7F_FFFF);
        } else {
            let (start_track, _) = self.track_index_target(start);
            end_met |= (pos.tno as u32) < start_track;
        }

        end_met
    }

    /// Piste et index bornés d'une position piste/index
    fn track_index_target(&self, pos: u32) -> (u32, u32) {
        let first = self.toc.first_track as u32;
        let last = self.toc.last_track as u32;
        let track = ((pos >> 8) & 0xFF).max(first).min(last);
        let index = (pos & 0xFF).clamp(1, 99);
        (track, index)
    }

    /// Lance une recherche vers une FAD (bit 23) ou une piste/index
    pub(super) fn start_seek(&mut self, target: u32, no_pickup_change: bool) {
        if !self.disc_present() {
            warn!("[CDB] [BUG] Recherche demandée sans disque ou plateau ouvert");
            return;
        }

        self.drive.cur_play_start = target;

        if no_pickup_change {
            if self.drive.phase == DrivePhase::Playing {
                return;
            }
        } else if target & POS_FAD != 0 {
            let leadout_fad = FAD_LBA_OFFSET + self.toc.leadout().lba;
            let fad = (target & 0x7F_FFFF).clamp(FAD_LBA_OFFSET, leadout_fad);

            let mut tt = 1;
            for track in 1..=100 {
                let t = self.toc.track(track);
                if !t.valid {
                    continue;
                }
                if fad < FAD_LBA_OFFSET + t.lba {
                    break;
                }
                tt = track;
            }

            let t = self.toc.track(tt);
            let pos = &mut self.drive.pos;
            pos.tno = if tt == 100 { 0xAA } else { tt as u8 };
            pos.idx = 1;
            pos.fad = fad;
            pos.rel_fad = fad.saturating_sub(FAD_LBA_OFFSET + t.lba);
            pos.ctrl_adr = (t.control << 4) | t.adr;
        } else {
            let (track, index) = self.track_index_target(target);
            let t = self.toc.track(track as usize);
            let pos = &mut self.drive.pos;
            pos.tno = track as u8;
            pos.idx = index as u8;
            pos.fad = FAD_LBA_OFFSET + t.lba;
            pos.rel_fad = 0;
            pos.ctrl_adr = (t.control << 4) | t.adr;
        }

        self.drive.pos.status = status::BUSY;
        self.drive.pos.is_cdrom = false;
        self.drive.pos.repcount = self.drive.play_repeat_counter & 0xF;
        self.drive.phase = DrivePhase::SeekStart;

        self.drive.periodic_counter = PERIODIC_RELOAD;
        self.drive.counter = fixed_cycles(256_000);
        self.drive.seek_index_phase = 0;
    }

    /// Traduit la table des matières dans le format transféré à l'hôte
    pub(super) fn translate_toc(&mut self) {
        let toc = &self.toc;
        let td = &mut self.drive.toc_buffer;
        td.resize(TOC_BUFFER_SIZE, 0xFF);

        for i in 1..100 {
            let t = toc.track(i);
            let entry = &mut td[(i - 1) * 4..i * 4];

            if t.valid {
                let fad = t.lba + FAD_LBA_OFFSET;
                entry[0] = (t.control << 4) | t.adr;
                entry[1..4].copy_from_slice(&fad.to_be_bytes()[1..4]);
            } else {
                entry.fill(0xFF);
            }
        }

        let first = toc.track(toc.first_track as usize);
        td[396..400].copy_from_slice(&[(first.control << 4) | first.adr, toc.first_track, toc.disc_type, 0]);

        let last = toc.track(toc.last_track as usize);
        td[400..404].copy_from_slice(&[(last.control << 4) | last.adr, toc.last_track, 0, 0]);

        let leadout = toc.leadout();
        let fad = leadout.lba + FAD_LBA_OFFSET;
        td[404] = (leadout.control << 4) | leadout.adr;
        td[405..408].copy_from_slice(&fad.to_be_bytes()[1..4]);
    }

    /// Décode le sous-code Q ; retourne `true` si le CRC est valide
    pub(super) fn decode_subq(&mut self, pw: &[u8]) -> bool {
        let mut q = [0u8; 12];

        for (i, byte) in pw.iter().enumerate().take(SUBCHANNEL_SIZE) {
            q[i >> 3] |= ((byte & 0x40) >> 6) << (7 - (i & 7));
        }

        if q[0] & 0xF != 1 {
            return false;
        }

        self.drive.subq = q;

        if super::disc::subq_check_checksum(&q) {
            self.drive.subq_safe = q;
            self.drive.subq_safe_valid = true;
            return true;
        }

        false
    }

    /// Abandonne le secteur en attente et vide l'anneau CD-DA
    pub(super) fn clear_pending_sec(&mut self) {
        self.drive.play_end_irq_type = 0;
        self.drive.sec_pre_buf_in = 0;
        self.drive.cdda.clear();
    }

    /// Première piste de données : FAD de début
    pub(super) fn first_data_track_fad(&self) -> Option<u32> {
        (self.toc.first_track..=self.toc.last_track)
            .map(|n| self.toc.track(n as usize))
            .find(|t| t.control & CTRL_DATA != 0)
            .map(|t| FAD_LBA_OFFSET + t.lba)
    }
}

/// Numéro de piste du sous-code Q (0xA0+ non BCD)
fn subq_track(raw: u8) -> u8 {
    if raw >= 0xA0 {
        raw
    } else {
        bcd_to_u8(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seek_time_direction() {
        let base = 6 * DRIVE_CLOCK / 150;

        assert_eq!(seek_time(10), base + 260);
        assert_eq!(seek_time(-10), base + 280 + DRIVE_CLOCK / 150);
        assert_eq!(seek_time(150), base + 150 * 26 + DRIVE_CLOCK / 150);
    }

    #[test]
    fn test_cdda_ring_capacity() {
        let mut ring = CddaBuffer::new();

        for i in 0..CDDA_CAPACITY as u16 {
            ring.push([i, i]);
        }
        assert!(ring.is_full());
        assert_eq!(ring.pop(), Some([0, 0]));
        assert_eq!(ring.len(), CDDA_CAPACITY - 1);

        ring.clear();
        assert_eq!(ring.pop(), None);
    }
}
