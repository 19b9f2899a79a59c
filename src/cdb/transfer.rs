//! Transfert de données hôte ↔ tampons via le registre 0
//!
//! Le transfert lit (ou écrit) des mots de 16 bits big-endian dans une
//! liste de sources. Une FIFO de six mots amortit les lectures ; les
//! décalages et longueurs dépendent de la longueur de secteur choisie et
//! sont réévalués à chaque changement de tampon.

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use super::pipeline::{BufferId, FilterId, FILTER_COUNT};
use super::registers::SectorLength;
use super::sector::{header_fad, header_mode};
use super::Cdb;

/// Profondeur de la FIFO de transfert (en mots)
pub const FIFO_SIZE: usize = 6;

/// Origine des mots d'un transfert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferSource {
    Buffer(BufferId),
    Toc,
    SubcodeQ,
    SubcodeRw,
    FileInfo,
}

/// État du transfert en cours
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataTransfer {
    pub active: bool,
    pub writing: bool,
    /// Les tampons sont rendus au pool à la fin d'une lecture
    pub need_buf_free: bool,

    pub cur_buf_index: usize,
    /// Position courante dans la source, en mots
    pub in_buf_offs: usize,
    /// Mots restant dans la source courante
    pub in_buf_counter: usize,
    pub total_counter: u32,

    /// Filtre d'entrée des secteurs écrits par l'hôte
    pub fnum: FilterId,

    fifo: [u16; FIFO_SIZE],
    fifo_rp: usize,
    fifo_wp: usize,
    fifo_in: usize,

    pub sources: Vec<TransferSource>,
}

impl DataTransfer {
    pub fn new() -> Self {
        Self {
            active: false,
            writing: false,
            need_buf_free: false,
            cur_buf_index: 0,
            in_buf_offs: 0,
            in_buf_counter: 0,
            total_counter: 0,
            fnum: FilterId(0),
            fifo: [0; FIFO_SIZE],
            fifo_rp: 0,
            fifo_wp: 0,
            fifo_in: 0,
            sources: Vec::new(),
        }
    }

    /// Prépare une lecture ; décalage et longueur sont fixés par l'appelant
    pub fn begin_read(&mut self, sources: Vec<TransferSource>, need_buf_free: bool) {
        self.sources = sources;
        self.cur_buf_index = 0;
        self.total_counter = 0;
        self.reset_fifo();
        self.writing = false;
        self.need_buf_free = need_buf_free;
    }

    pub fn begin_write(&mut self, fnum: FilterId, buffers: Vec<BufferId>) {
        self.sources = buffers.into_iter().map(TransferSource::Buffer).collect();
        self.cur_buf_index = 0;
        self.total_counter = 0;
        self.reset_fifo();
        self.writing = true;
        self.need_buf_free = false;
        self.fnum = fnum;
    }

    pub fn reset_fifo(&mut self) {
        self.fifo_rp = 0;
        self.fifo_wp = 0;
        self.fifo_in = 0;
    }

    pub fn fifo_len(&self) -> usize {
        self.fifo_in
    }

    pub fn buf_count(&self) -> usize {
        self.sources.len()
    }

    /// Tampons de la liste, dans l'ordre du transfert
    pub fn buffers(&self) -> impl Iterator<Item = BufferId> + '_ {
        self.sources.iter().filter_map(|s| match s {
            TransferSource::Buffer(id) => Some(*id),
            _ => None,
        })
    }

    pub fn current_source(&self) -> Option<TransferSource> {
        self.sources.get(self.cur_buf_index).copied()
    }

    fn fifo_push(&mut self, word: u16) {
        self.fifo[self.fifo_wp] = word;
        self.fifo_wp = (self.fifo_wp + 1) % FIFO_SIZE;
        self.fifo_in += 1;
    }

    fn fifo_pop(&mut self) -> u16 {
        let word = self.fifo[self.fifo_rp];
        self.fifo_rp = (self.fifo_rp + 1) % FIFO_SIZE;
        self.fifo_in = self.fifo_in.saturating_sub(1);
        word
    }

    /// Ramène les index à des valeurs utilisables après chargement
    pub fn sanitize(&mut self, buffer_count: usize) {
        self.fifo_rp %= FIFO_SIZE;
        self.fifo_wp %= FIFO_SIZE;
        self.fifo_in = self.fifo_in.min(FIFO_SIZE);
        self.fnum = FilterId(self.fnum.0 % FILTER_COUNT as u8);

        let bad_buffer = self.buffers().any(|id| id.0 as usize >= buffer_count);
        if bad_buffer || self.sources.len() > buffer_count {
            warn!("[CDB] Liste de transfert invalide dans la sauvegarde, transfert annulé");
            *self = Self::new();
        }
    }
}

impl Default for DataTransfer {
    fn default() -> Self {
        Self::new()
    }
}

/// Mot big-endian à l'index `word` ; zéro hors limites
pub(super) fn be_word(bytes: &[u8], word: usize) -> u16 {
    let i = word * 2;
    match bytes.get(i..i + 2) {
        Some(b) => u16::from_be_bytes([b[0], b[1]]),
        None => 0,
    }
}

impl Cdb {
    /// Fixe décalage et longueur pour la source courante
    ///
    /// La longueur de secteur peut changer en cours de transfert ; elle est
    /// prise en compte à la frontière du tampon suivant.
    pub(super) fn transfer_set_offsets(&mut self) {
        if self.transfer.writing {
            let (offs, count) = match self.put_sec_len {
                SectorLength::Bytes2048 => (12, 1024),
                SectorLength::Bytes2336 => (8, 1168),
                SectorLength::Bytes2340 => (6, 1170),
                SectorLength::Bytes2352 => (0, 1176),
            };
            self.transfer.in_buf_offs = offs;
            self.transfer.in_buf_counter = count;
            return;
        }

        let Some(TransferSource::Buffer(id)) = self.transfer.current_source() else {
            return;
        };
        let data = self.pipeline.data(id);

        let (offs, count) = match self.get_sec_len {
            SectorLength::Bytes2048 => {
                if header_mode(data) == 0x1 {
                    (8, 1024)
                } else if data[18] & 0x20 != 0 {
                    (12, 1162)
                } else {
                    (12, 1024)
                }
            }
            SectorLength::Bytes2336 => (8, 1168),
            SectorLength::Bytes2340 => (6, 1170),
            SectorLength::Bytes2352 => (0, 1176),
        };

        debug!("[CDB] DT FAD: {:08x} --- {} {}", header_fad(data), offs, count);
        self.transfer.in_buf_offs = offs;
        self.transfer.in_buf_counter = count;
    }

    fn transfer_source_word(&self, source: Option<TransferSource>, word: usize) -> u16 {
        match source {
            Some(TransferSource::Buffer(id)) => be_word(self.pipeline.data(id), word),
            Some(TransferSource::Toc) => be_word(&self.drive.toc_buffer, word),
            Some(TransferSource::SubcodeQ) => be_word(&self.drive.subcode_q, word),
            Some(TransferSource::SubcodeRw) => be_word(&self.drive.subcode_rw, word),
            Some(TransferSource::FileInfo) => self.fs.file_info_word(word),
            None => 0,
        }
    }

    /// Avance d'un mot dans la source et le pousse dans la FIFO
    pub(super) fn transfer_read_into_fifo(&mut self) {
        let word = self.transfer_source_word(self.transfer.current_source(), self.transfer.in_buf_offs);

        let dt = &mut self.transfer;
        dt.fifo_push(word);
        dt.in_buf_offs += 1;
        dt.in_buf_counter = dt.in_buf_counter.saturating_sub(1);
        dt.total_counter = dt.total_counter.wrapping_add(1);

        if dt.in_buf_counter == 0 {
            dt.cur_buf_index += 1;
            if dt.cur_buf_index < dt.buf_count() {
                self.transfer_set_offsets();
            }
        }
    }

    /// Lecture hôte du registre de données
    pub(super) fn transfer_read_word(&mut self) -> u16 {
        if !self.transfer.active || self.transfer.writing {
            return 0;
        }

        if self.transfer.in_buf_counter > 0 {
            self.transfer_read_into_fifo();
        }

        if self.transfer.fifo_len() == 0 {
            warn!("[CDB] DT FIFO underflow.");
        }

        self.transfer.fifo_pop()
    }

    /// Écriture hôte du registre de données
    pub(super) fn transfer_write_word(&mut self, value: u16, mask: u16) {
        if !self.transfer.active || !self.transfer.writing || self.transfer.in_buf_counter == 0 {
            return;
        }

        let dt = &mut self.transfer;
        let merged = (dt.fifo[dt.fifo_wp] & !mask) | (value & mask);
        dt.fifo_push(merged);
        let word = dt.fifo_pop();

        if let Some(TransferSource::Buffer(id)) = dt.current_source() {
            let i = dt.in_buf_offs * 2;
            if let Some(dst) = self.pipeline.data_mut(id).get_mut(i..i + 2) {
                dst.copy_from_slice(&word.to_be_bytes());
            }
        }

        let dt = &mut self.transfer;
        dt.in_buf_offs += 1;
        dt.in_buf_counter -= 1;
        dt.total_counter = dt.total_counter.wrapping_add(1);

        if dt.in_buf_counter == 0 {
            dt.cur_buf_index += 1;
            if dt.cur_buf_index < dt.buf_count() {
                self.transfer_set_offsets();
            }
        }
    }
}
