//! Coroutine du système de fichiers ISO9660
//!
//! Deux opérations consomment les secteurs d'une partition au fil de la
//! lecture : l'authentification (recherche du descripteur de volume
//! primaire et de l'enregistrement du répertoire racine) et la lecture d'un
//! répertoire dans une fenêtre de 254 entrées. Chaque attente d'un tampon
//! est un point de reprise ; un abandon est possible à chacun d'eux.

use log::debug;
use serde::{Deserialize, Serialize};

use super::pipeline::PartitionId;
use super::sector::{user_data_offset, USER_DATA_SIZE};
use super::Cdb;
use super::drive::POS_FAD;

/// Nombre d'entrées de la table d'informations fichiers
pub const FILE_INFO_COUNT: usize = 256;

/// Attribut « répertoire »
pub const FATTR_DIR: u8 = 0x02;

/// Informations d'un fichier telles que transférées à l'hôte (12 octets)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub fad: u32,
    pub size: u32,
    pub unit_size: u8,
    pub gap_size: u8,
    pub fnum: u8,
    pub attr: u8,
}

impl FileInfo {
    pub fn to_bytes(&self) -> [u8; 12] {
        let mut out = [0u8; 12];
        out[0..4].copy_from_slice(&self.fad.to_be_bytes());
        out[4..8].copy_from_slice(&self.size.to_be_bytes());
        out[8] = self.unit_size;
        out[9] = self.gap_size;
        out[10] = self.fnum;
        out[11] = self.attr;
        out
    }

    pub fn is_dir(&self) -> bool {
        self.attr & FATTR_DIR != 0
    }

    /// Décode un enregistrement de répertoire ISO9660 (attributs XA compris)
    pub fn from_record(rr: &[u8]) -> Self {
        let be32 = |i: usize| u32::from_be_bytes([rr[i], rr[i + 1], rr[i + 2], rr[i + 3]]);

        let rec_len = rr[0] as usize;
        let fi_len = rr[32] as usize;

        let mut info = Self {
            fad: 150u32.wrapping_add(be32(6)),
            size: be32(14),
            unit_size: rr[26],
            gap_size: rr[27],
            fnum: 0,
            attr: rr[25] & FATTR_DIR,
        };

        let su_offs = 33 + (fi_len | 1);
        if rec_len >= su_offs + 14 && rec_len <= 256 && su_offs + 8 < rr.len() {
            if rr[su_offs + 6] == b'X' && rr[su_offs + 7] == b'A' {
                info.attr |= rr[su_offs + 4] & 0xF8;
                info.fnum = rr[su_offs + 8];
            }
        }

        info
    }
}

/// Point de reprise de la coroutine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilesysPhase {
    Idle,
    AuthScan,
    RecordStart,
    RecordLength,
    RecordBody,
}

/// État du système de fichiers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filesys {
    pub active: bool,
    pub do_auth: bool,
    pub abort: bool,
    pub pnum: PartitionId,

    pub file_info: Vec<FileInfo>,
    pub file_info_valid: bool,
    pub root_dir: FileInfo,
    pub root_dir_valid: bool,

    /// Entrées valides dans la fenêtre (0..=254)
    pub file_info_valid_count: u8,
    /// Premier identifiant de fichier de la fenêtre (>= 2)
    pub file_info_offs: u32,
    pub file_info_on_disc_count: u32,

    pub phase: FilesysPhase,

    pbuf: Vec<u8>,
    pbuf_offs: usize,
    pbuf_read_i: usize,

    total_counter: u32,
    pub total_max: u32,

    record: Vec<u8>,
    record_counter: u32,

    finfo_offs: usize,
}

impl Filesys {
    pub fn new() -> Self {
        Self {
            active: false,
            do_auth: false,
            abort: false,
            pnum: PartitionId(0),
            file_info: vec![FileInfo::default(); FILE_INFO_COUNT],
            file_info_valid: false,
            root_dir: FileInfo::default(),
            root_dir_valid: false,
            file_info_valid_count: 0,
            file_info_offs: 0,
            file_info_on_disc_count: 0,
            phase: FilesysPhase::Idle,
            pbuf: vec![0; USER_DATA_SIZE],
            pbuf_offs: 0,
            pbuf_read_i: 0,
            total_counter: 0,
            total_max: 0,
            record: vec![0; 256],
            record_counter: 0,
            finfo_offs: 0,
        }
    }

    /// Réinitialisation logicielle ; le répertoire racine est conservé
    pub fn reset(&mut self) {
        let root_dir = self.root_dir;
        let root_dir_valid = self.root_dir_valid;
        *self = Self::new();
        self.root_dir = root_dir;
        self.root_dir_valid = root_dir_valid;
    }

    /// Mot big-endian de la table d'informations fichiers
    pub fn file_info_word(&self, word: usize) -> u16 {
        let byte = word * 2;
        match self.file_info.get(byte / 12) {
            Some(info) => {
                let b = info.to_bytes();
                let i = byte % 12;
                u16::from_be_bytes([b[i], b[i + 1]])
            }
            None => 0,
        }
    }

    /// Index dans la table pour un identifiant de fichier
    pub fn info_index(&self, fileid: u32) -> usize {
        if fileid < 2 {
            fileid as usize
        } else {
            (2 + fileid).wrapping_sub(self.file_info_offs) as usize
        }
    }

    /// L'identifiant est hors de la fenêtre courante
    pub fn outside_window(&self, fileid: u32) -> bool {
        fileid >= 2
            && (fileid < self.file_info_offs
                || fileid >= self.file_info_offs + self.file_info_valid_count as u32)
    }

    pub fn info(&self, fileid: u32) -> FileInfo {
        self.file_info.get(self.info_index(fileid)).copied().unwrap_or_default()
    }

    pub fn sanitize(&mut self) {
        self.file_info.resize(FILE_INFO_COUNT, FileInfo::default());
        self.pbuf.resize(USER_DATA_SIZE, 0);
        self.record.resize(256, 0);
        self.pbuf_offs %= USER_DATA_SIZE;
        self.finfo_offs = self.finfo_offs.min(FILE_INFO_COUNT);
        self.pbuf_read_i = self.pbuf_read_i.min(255);
        if self.phase == FilesysPhase::RecordBody && self.record.first() == Some(&0) {
            self.phase = FilesysPhase::RecordStart;
        }
        if self.pnum.0 as usize >= super::pipeline::PARTITION_COUNT {
            self.pnum = PartitionId(0);
        }
    }
}

impl Default for Filesys {
    fn default() -> Self {
        Self::new()
    }
}

impl Cdb {
    /// Fait progresser la coroutine ; retourne `true` quand une opération
    /// se termine (ou est abandonnée) et qu'EFLS doit être levé
    pub(super) fn filesys_run(&mut self) -> bool {
        if self.fs.abort {
            if self.fs.active {
                debug!("[CDB] FLS Abort: {} {}", self.fs.active, self.fs.do_auth);
            }
            self.filesys_finish();
            return true;
        }

        loop {
            match self.fs.phase {
                FilesysPhase::Idle => {
                    if !self.fs.active {
                        return false;
                    }

                    if self.fs.do_auth {
                        self.fs.root_dir_valid = false;
                        self.auth_disc_type = 0x04;
                        self.fs.phase = FilesysPhase::AuthScan;
                    } else {
                        self.fs.file_info_valid = false;
                        self.fs.total_counter = 0;
                        self.fs.pbuf_offs = 0;
                        self.fs.file_info_valid_count = 0;
                        self.fs.record_counter = 0;
                        self.fs.finfo_offs = 0;
                        self.fs.phase = FilesysPhase::RecordStart;
                    }
                }
                FilesysPhase::AuthScan => {
                    if !self.filesys_grab_buffer() {
                        return false;
                    }

                    let pbuf = &self.fs.pbuf;
                    if &pbuf[1..6] != b"CD001" || pbuf[0] == 0xFF {
                        return self.filesys_complete_auth();
                    }
                    if pbuf[0] == 0x01 {
                        self.fs.root_dir = FileInfo::from_record(&pbuf[156..]);
                        self.fs.root_dir_valid = true;
                        return self.filesys_complete_auth();
                    }
                }
                FilesysPhase::RecordStart => {
                    if self.fs.total_counter >= self.fs.total_max {
                        self.fs.file_info_on_disc_count = self.fs.record_counter;
                        self.fs.file_info_valid = true;
                        return self.filesys_complete();
                    }

                    self.fs.record.fill(0);
                    self.fs.phase = FilesysPhase::RecordLength;
                }
                FilesysPhase::RecordLength => {
                    let Some(len) = self.filesys_read_byte() else {
                        return false;
                    };

                    self.fs.record[0] = len;
                    if len == 0 {
                        self.fs.phase = FilesysPhase::RecordStart;
                    } else {
                        self.fs.pbuf_read_i = 0;
                        self.fs.phase = FilesysPhase::RecordBody;
                    }
                }
                FilesysPhase::RecordBody => {
                    let len = (self.fs.record[0] as usize).saturating_sub(1);

                    while self.fs.pbuf_read_i < len {
                        let Some(byte) = self.filesys_read_byte() else {
                            return false;
                        };
                        self.fs.record[1 + self.fs.pbuf_read_i] = byte;
                        self.fs.pbuf_read_i += 1;
                    }

                    self.filesys_store_record();
                    self.fs.phase = FilesysPhase::RecordStart;
                }
            }
        }
    }

    /// Range l'enregistrement courant dans la fenêtre d'entrées
    fn filesys_store_record(&mut self) {
        let fs = &mut self.fs;

        if fs.finfo_offs >= FILE_INFO_COUNT {
            return;
        }

        if fs.record_counter < 2 || fs.record_counter >= fs.file_info_offs {
            fs.file_info[fs.finfo_offs] = FileInfo::from_record(&fs.record);
            fs.finfo_offs += 1;

            if fs.record_counter >= 2 {
                fs.file_info_valid_count = fs.file_info_valid_count.wrapping_add(1);
            }
        }
        fs.record_counter += 1;
    }

    /// Lit un octet du flux de secteurs ; `None` si aucun tampon n'est prêt
    fn filesys_read_byte(&mut self) -> Option<u8> {
        if self.fs.pbuf_offs == 0 && !self.filesys_grab_buffer() {
            return None;
        }

        let byte = self.fs.pbuf[self.fs.pbuf_offs];
        self.fs.pbuf_offs = (self.fs.pbuf_offs + 1) % USER_DATA_SIZE;
        self.fs.total_counter = self.fs.total_counter.wrapping_add(1);
        Some(byte)
    }

    /// Prend le premier secteur de la partition et copie ses données utilisateur
    fn filesys_grab_buffer(&mut self) -> bool {
        let pnum = self.fs.pnum;
        let Some(id) = self.pipeline.first_buffer(pnum) else {
            return false;
        };

        if self.pipeline.unlink(pnum, id).is_err() {
            return false;
        }

        let data = self.pipeline.data(id);
        let offs = user_data_offset(data);
        self.fs.pbuf.copy_from_slice(&data[offs..offs + USER_DATA_SIZE]);

        if let Err(e) = self.pipeline.free(id) {
            log::warn!("[CDB] FLS: {}", e);
        }
        true
    }

    fn filesys_complete_auth(&mut self) -> bool {
        self.pipeline.set_cd_device_conn(None);
        self.filesys_complete()
    }

    fn filesys_complete(&mut self) -> bool {
        self.pipeline.clear(self.fs.pnum);
        self.filesys_finish();
        true
    }

    /// Fin commune (achèvement ou abandon) : met la lecture en pause
    fn filesys_finish(&mut self) {
        self.fs.active = false;
        self.fs.do_auth = false;
        self.fs.abort = false;
        self.fs.phase = FilesysPhase::Idle;

        self.drive.play_end_irq_type = 0;
        self.drive.cur_play_start = POS_FAD;
        self.drive.cur_play_end = POS_FAD;
        self.drive.cur_play_repeat = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Unit;

    fn record(extent: u32, size: u32, flags: u8, name: &[u8]) -> Vec<u8> {
        let len = 33 + name.len() + (name.len() + 1) % 2;
        let mut rr = vec![0u8; len];
        rr[0] = len as u8;
        rr[2..6].copy_from_slice(&extent.to_le_bytes());
        rr[6..10].copy_from_slice(&extent.to_be_bytes());
        rr[10..14].copy_from_slice(&size.to_le_bytes());
        rr[14..18].copy_from_slice(&size.to_be_bytes());
        rr[25] = flags;
        rr[32] = name.len() as u8;
        rr[33..33 + name.len()].copy_from_slice(name);
        rr
    }

    #[test]
    fn test_record_decoding() {
        let rr = record(20, 2048, 0x02, b"\x00");
        let info = FileInfo::from_record(&rr);

        assert_eq!(info.fad, 170);
        assert_eq!(info.size, 2048);
        assert!(info.is_dir());
        assert_eq!(info.fnum, 0);
    }

    #[test]
    fn test_record_xa_attributes() {
        let mut rr = record(30, 4096, 0x00, b"A.STR;1");
        let su_offs = rr.len();
        rr.resize(su_offs + 14, 0);
        rr[0] = rr.len() as u8;
        rr[su_offs + 4] = 0x28;
        rr[su_offs + 6] = b'X';
        rr[su_offs + 7] = b'A';
        rr[su_offs + 8] = 0x05;

        let info = FileInfo::from_record(&rr);
        assert_eq!(info.attr, 0x28);
        assert_eq!(info.fnum, 0x05);
    }

    #[test]
    fn test_file_info_words() {
        let mut fs = Filesys::new();
        fs.file_info[1] = FileInfo { fad: 0x0001_0203, size: 0x0A0B_0C0D, unit_size: 1, gap_size: 2, fnum: 3, attr: 4 };

        assert_eq!(fs.file_info_word(6), 0x0001);
        assert_eq!(fs.file_info_word(7), 0x0203);
        assert_eq!(fs.file_info_word(11), 0x0304);
        assert_eq!(fs.file_info_word(6 * FILE_INFO_COUNT), 0);
    }

    /// Un enregistrement de longueur nulle en cours de lecture est réparé
    #[test]
    fn test_zero_length_record_is_repaired() {
        let mut cdb = Cdb::default();
        cdb.fs.active = true;
        cdb.fs.phase = FilesysPhase::RecordBody;
        cdb.fs.record[0] = 0;
        let bytes = cdb.save_state().unwrap();

        let mut target = Cdb::default();
        target.load_state(&bytes).unwrap();
        assert_eq!(target.fs.phase, FilesysPhase::RecordStart);

        // Rien à lire : l'opération se termine au lieu de paniquer
        assert!(target.filesys_run());
        target.update(100);
    }
}
