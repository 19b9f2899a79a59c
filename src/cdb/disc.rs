//! Interface vers le support optique et disque synthétique en mémoire
//!
//! Le bloc CD ne connaît le disque qu'à travers le trait [`Disc`] : lecture
//! de la table des matières et des secteurs bruts avec leur sous-canal P-W.
//! Les formats d'image sont hors du périmètre de ce crate ; [`MemoryDisc`]
//! fabrique des secteurs valides pour les tests et la démonstration.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::sector::{fad_to_bcd_msf, u8_to_bcd, Subheader, FAD_LBA_OFFSET, RAW_SECTOR_SIZE, SUBCHANNEL_SIZE, USER_DATA_SIZE};

/// Bit « piste de données » du champ contrôle
pub const CTRL_DATA: u8 = 0x04;

/// Numéro de piste du lead-out dans le sous-code Q
pub const LEADOUT_TRACK: u8 = 0xAA;

/// Entrée de la table des matières
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TocTrack {
    pub adr: u8,
    pub control: u8,
    pub lba: u32,
    pub valid: bool,
}

/// Table des matières ; l'index 100 est le lead-out
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Toc {
    pub first_track: u8,
    pub last_track: u8,
    pub disc_type: u8,
    pub tracks: Vec<TocTrack>,
}

impl Toc {
    pub const LEADOUT: usize = 100;

    pub fn new() -> Self {
        Self {
            first_track: 1,
            last_track: 1,
            disc_type: 0,
            tracks: vec![TocTrack::default(); Self::LEADOUT + 1],
        }
    }

    pub fn track(&self, index: usize) -> TocTrack {
        self.tracks.get(index).copied().unwrap_or_default()
    }

    pub fn leadout(&self) -> TocTrack {
        self.track(Self::LEADOUT)
    }
}

impl Default for Toc {
    fn default() -> Self {
        Self::new()
    }
}

/// Support lisible par le lecteur
pub trait Disc: Send + Sync + fmt::Debug {
    fn read_toc(&self) -> Toc;

    /// Secteur brut de 2352 octets suivi des 96 octets de sous-canal P-W
    fn read_raw_sector(&self, lba: i32, out: &mut [u8]);

    /// Sous-canal P-W seul (96 octets)
    fn read_raw_pw(&self, lba: i32, out: &mut [u8]);
}

/// CRC-16 CCITT du sous-code Q (complémenté)
pub fn subq_crc16(q: &[u8]) -> u16 {
    let mut crc: u16 = 0;

    for &byte in &q[..10] {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 { (crc << 1) ^ 0x1021 } else { crc << 1 };
        }
    }

    !crc
}

pub fn subq_check_checksum(q: &[u8]) -> bool {
    subq_crc16(q) == u16::from_be_bytes([q[10], q[11]])
}

/// Entrelace les 12 octets de Q dans le bit 6 des 96 octets P-W
pub fn interleave_subq(q: &[u8; 12], pw: &mut [u8]) {
    for (i, out) in pw.iter_mut().enumerate().take(SUBCHANNEL_SIZE) {
        *out = ((q[i >> 3] >> (7 - (i & 7))) & 1) << 6;
    }
}

/// Type de piste d'un disque synthétique
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Mode1,
    Mode2,
}

#[derive(Debug, Clone)]
struct MemoryTrack {
    kind: TrackKind,
    start_lba: u32,
    length: u32,
}

#[derive(Debug, Clone)]
struct SectorPayload {
    subheader: Subheader,
    user: Vec<u8>,
}

/// Disque synthétique : pistes contiguës, contenu utilisateur épars
#[derive(Debug, Clone, Default)]
pub struct MemoryDisc {
    tracks: Vec<MemoryTrack>,
    payloads: BTreeMap<u32, SectorPayload>,
}

impl MemoryDisc {
    pub fn new() -> Self {
        Self::default()
    }

    /// Disque d'une seule piste Mode 1
    pub fn data_disc(sectors: u32) -> Self {
        let mut disc = Self::new();
        disc.add_track(TrackKind::Mode1, sectors);
        disc
    }

    /// Ajoute une piste à la suite des précédentes ; retourne son numéro
    pub fn add_track(&mut self, kind: TrackKind, length: u32) -> u8 {
        let start_lba = self.total_sectors();
        self.tracks.push(MemoryTrack { kind, start_lba, length });
        self.tracks.len() as u8
    }

    pub fn total_sectors(&self) -> u32 {
        self.tracks.last().map_or(0, |t| t.start_lba + t.length)
    }

    /// Écrit les données utilisateur d'un secteur (complétées à 2048 octets)
    pub fn write_user_data(&mut self, lba: u32, data: &[u8]) {
        self.write_mode2(lba, Subheader::default(), data);
    }

    /// Écrit un secteur avec sous-en-tête (ignoré pour une piste Mode 1)
    pub fn write_mode2(&mut self, lba: u32, subheader: Subheader, data: &[u8]) {
        let mut user = vec![0u8; USER_DATA_SIZE];
        let n = data.len().min(USER_DATA_SIZE);
        user[..n].copy_from_slice(&data[..n]);
        self.payloads.insert(lba, SectorPayload { subheader, user });
    }

    fn track_at(&self, lba: u32) -> Option<(usize, &MemoryTrack)> {
        self.tracks
            .iter()
            .enumerate()
            .find(|(_, t)| lba >= t.start_lba && lba < t.start_lba + t.length)
    }

    fn build_subq(&self, lba: i32) -> [u8; 12] {
        let mut q = [0u8; 12];
        let abs_fad = (lba.max(-(FAD_LBA_OFFSET as i32)) + FAD_LBA_OFFSET as i32) as u32;

        let (control, tno, rel) = match u32::try_from(lba).ok().and_then(|l| self.track_at(l)) {
            Some((i, t)) => {
                let control = if t.kind == TrackKind::Audio { 0 } else { CTRL_DATA };
                (control, u8_to_bcd(i as u8 + 1), lba as u32 - t.start_lba)
            }
            None => {
                let control = self.tracks.last().map_or(0, |t| if t.kind == TrackKind::Audio { 0 } else { CTRL_DATA });
                let rel = (lba.max(0) as u32).saturating_sub(self.total_sectors());
                (control, LEADOUT_TRACK, rel)
            }
        };

        q[0] = (control << 4) | 0x01;
        q[1] = tno;
        q[2] = 0x01;
        q[3..6].copy_from_slice(&fad_to_bcd_msf(rel));
        q[6] = 0;
        q[7..10].copy_from_slice(&fad_to_bcd_msf(abs_fad));

        let crc = subq_crc16(&q);
        q[10..12].copy_from_slice(&crc.to_be_bytes());
        q
    }

    fn build_sector(&self, lba: i32, out: &mut [u8]) {
        out[..RAW_SECTOR_SIZE].fill(0);

        let Some((_, track)) = u32::try_from(lba).ok().and_then(|l| self.track_at(l)) else {
            return;
        };

        if track.kind == TrackKind::Audio {
            for (i, frame) in out[..RAW_SECTOR_SIZE].chunks_exact_mut(4).enumerate() {
                let left = (lba as u16).wrapping_add(i as u16);
                let right = !left;
                frame[0..2].copy_from_slice(&left.to_le_bytes());
                frame[2..4].copy_from_slice(&right.to_le_bytes());
            }
            return;
        }

        out[0] = 0x00;
        out[1..11].fill(0xFF);
        out[11] = 0x00;
        out[12..15].copy_from_slice(&fad_to_bcd_msf(lba as u32 + FAD_LBA_OFFSET));

        let payload = self.payloads.get(&(lba as u32));

        match track.kind {
            TrackKind::Mode1 => {
                out[15] = 0x01;
                if let Some(p) = payload {
                    out[16..16 + USER_DATA_SIZE].copy_from_slice(&p.user);
                }
            }
            TrackKind::Mode2 => {
                out[15] = 0x02;
                let sh = payload.map(|p| p.subheader).unwrap_or_default();
                let bytes = [sh.file, sh.channel, sh.submode, sh.coding_info];
                out[16..20].copy_from_slice(&bytes);
                out[20..24].copy_from_slice(&bytes);
                if let Some(p) = payload {
                    out[24..24 + USER_DATA_SIZE].copy_from_slice(&p.user);
                }
            }
            TrackKind::Audio => {}
        }
    }
}

impl Disc for MemoryDisc {
    fn read_toc(&self) -> Toc {
        let mut toc = Toc::new();

        for (i, t) in self.tracks.iter().enumerate().take(99) {
            toc.tracks[i + 1] = TocTrack {
                adr: 1,
                control: if t.kind == TrackKind::Audio { 0 } else { CTRL_DATA },
                lba: t.start_lba,
                valid: true,
            };
        }

        toc.first_track = 1;
        toc.last_track = self.tracks.len().clamp(1, 99) as u8;
        toc.disc_type = if self.tracks.iter().any(|t| t.kind == TrackKind::Mode2) { 0x20 } else { 0x00 };
        toc.tracks[Toc::LEADOUT] = TocTrack {
            adr: 1,
            control: toc.track(toc.last_track as usize).control,
            lba: self.total_sectors(),
            valid: true,
        };

        toc
    }

    fn read_raw_sector(&self, lba: i32, out: &mut [u8]) {
        self.build_sector(lba, out);
        self.read_raw_pw(lba, &mut out[RAW_SECTOR_SIZE..RAW_SECTOR_SIZE + SUBCHANNEL_SIZE]);
    }

    fn read_raw_pw(&self, lba: i32, out: &mut [u8]) {
        interleave_subq(&self.build_subq(lba), out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdb::sector::header_fad;

    #[test]
    fn test_subq_checksum_roundtrip() {
        let disc = MemoryDisc::data_disc(100);
        let q = disc.build_subq(10);

        assert!(subq_check_checksum(&q));
        assert_eq!(q[1], 0x01);

        let mut corrupted = q;
        corrupted[4] ^= 0x01;
        assert!(!subq_check_checksum(&corrupted));
    }

    #[test]
    fn test_toc_layout() {
        let mut disc = MemoryDisc::new();
        disc.add_track(TrackKind::Mode1, 300);
        disc.add_track(TrackKind::Audio, 750);

        let toc = disc.read_toc();
        assert_eq!(toc.last_track, 2);
        assert_eq!(toc.track(2).lba, 300);
        assert_eq!(toc.track(2).control, 0);
        assert_eq!(toc.leadout().lba, 1050);
    }

    #[test]
    fn test_mode1_sector_header() {
        let mut disc = MemoryDisc::data_disc(50);
        disc.write_user_data(16, b"\x01CD001");

        let mut buf = vec![0u8; RAW_SECTOR_SIZE + SUBCHANNEL_SIZE];
        disc.read_raw_sector(16, &mut buf);

        assert_eq!(header_fad(&buf), 166);
        assert_eq!(buf[15], 1);
        assert_eq!(&buf[16..22], b"\x01CD001");
    }
}
