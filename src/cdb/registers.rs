//! Registres, codes de statut et codes de commande du bloc CD

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Bits du registre d'interruptions hôte (HIRQ)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct Hirq: u16 {
        /// Commande acceptée
        const CMOK = 0x0001;
        /// Transfert de données prêt
        const DRDY = 0x0002;
        /// Lecture d'un secteur terminée
        const CSCT = 0x0004;
        /// Tampons pleins
        const BFUL = 0x0008;
        /// Fin de lecture
        const PEND = 0x0010;
        /// Changement de disque
        const DCHG = 0x0020;
        /// Fin d'opération de sélecteur
        const ESEL = 0x0040;
        /// Fin d'E/S hôte
        const EHST = 0x0080;
        /// Fin de copie / déplacement
        const ECPY = 0x0100;
        /// Fin d'opération du système de fichiers
        const EFLS = 0x0200;
        /// Sous-code Q mis à jour
        const SCDQ = 0x0400;
        const MPED = 0x0800;
        const MPCM = 0x1000;
        const MPST = 0x2000;
    }
}

/// Statuts de base rapportés dans l'octet haut de `results[0]`
pub mod status {
    pub const BUSY: u8 = 0x00;
    pub const PAUSE: u8 = 0x01;
    pub const STANDBY: u8 = 0x02;
    pub const PLAY: u8 = 0x03;
    pub const SEEK: u8 = 0x04;
    pub const SCAN: u8 = 0x05;
    pub const OPEN: u8 = 0x06;
    pub const NODISC: u8 = 0x07;
    pub const RETRY: u8 = 0x08;
    pub const ERROR: u8 = 0x09;
    pub const FATAL: u8 = 0x0A;

    pub const PERIODIC: u8 = 0x20;
    pub const DTREQ: u8 = 0x40;
    pub const WAIT: u8 = 0x80;

    /// Requête invalide (identifiant hors limites, paramètres incohérents)
    pub const REJECTED: u8 = 0xFF;
}

/// Décalages (en mots) des registres exposés au bus
pub mod reg {
    pub const DATA: u32 = 0x0;
    pub const HIRQ: u32 = 0x2;
    pub const HIRQ_MASK: u32 = 0x3;
    pub const CR1: u32 = 0x6;
    pub const CR2: u32 = 0x7;
    pub const CR3: u32 = 0x8;
    pub const CR4: u32 = 0x9;
}

/// Commandes reconnues par le bloc CD
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    GetCdStatus,
    GetHwInfo,
    GetToc,
    GetSessionInfo,
    Init,
    Open,
    EndDataTransfer,
    Play,
    Seek,
    Scan,
    GetSubcode,
    SetCdDeviceConn,
    GetCdDeviceConn,
    GetLastBufferDest,
    SetFilterRange,
    GetFilterRange,
    SetFilterSubheader,
    GetFilterSubheader,
    SetFilterMode,
    GetFilterMode,
    SetFilterConn,
    GetFilterConn,
    ResetSelector,
    GetBufferSize,
    GetSectorNumber,
    CalcActualSize,
    GetActualSize,
    GetSectorInfo,
    ExecFadSearch,
    GetFadSearch,
    SetSectorLength,
    GetSectorData,
    DeleteSectorData,
    GetDeleteSectorData,
    PutSectorData,
    CopySectorData,
    MoveSectorData,
    GetCopyError,
    ChangeDir,
    ReadDir,
    GetFsScope,
    GetFileInfo,
    ReadFile,
    AbortFile,
    AuthDevice,
    GetAuth,
}

impl Command {
    pub fn from_code(code: u8) -> Option<Self> {
        use Command::*;

        Some(match code {
            0x00 => GetCdStatus,
            0x01 => GetHwInfo,
            0x02 => GetToc,
            0x03 => GetSessionInfo,
            0x04 => Init,
            0x05 => Open,
            0x06 => EndDataTransfer,
            0x10 => Play,
            0x11 => Seek,
            0x12 => Scan,
            0x20 => GetSubcode,
            0x30 => SetCdDeviceConn,
            0x31 => GetCdDeviceConn,
            0x32 => GetLastBufferDest,
            0x40 => SetFilterRange,
            0x41 => GetFilterRange,
            0x42 => SetFilterSubheader,
            0x43 => GetFilterSubheader,
            0x44 => SetFilterMode,
            0x45 => GetFilterMode,
            0x46 => SetFilterConn,
            0x47 => GetFilterConn,
            0x48 => ResetSelector,
            0x50 => GetBufferSize,
            0x51 => GetSectorNumber,
            0x52 => CalcActualSize,
            0x53 => GetActualSize,
            0x54 => GetSectorInfo,
            0x55 => ExecFadSearch,
            0x56 => GetFadSearch,
            0x60 => SetSectorLength,
            0x61 => GetSectorData,
            0x62 => DeleteSectorData,
            0x63 => GetDeleteSectorData,
            0x64 => PutSectorData,
            0x65 => CopySectorData,
            0x66 => MoveSectorData,
            0x67 => GetCopyError,
            0x70 => ChangeDir,
            0x71 => ReadDir,
            0x72 => GetFsScope,
            0x73 => GetFileInfo,
            0x74 => ReadFile,
            0x75 => AbortFile,
            0xE0 => AuthDevice,
            0xE1 => GetAuth,
            _ => return None,
        })
    }

    pub fn code(self) -> u8 {
        use Command::*;

        match self {
            GetCdStatus => 0x00,
            GetHwInfo => 0x01,
            GetToc => 0x02,
            GetSessionInfo => 0x03,
            Init => 0x04,
            Open => 0x05,
            EndDataTransfer => 0x06,
            Play => 0x10,
            Seek => 0x11,
            Scan => 0x12,
            GetSubcode => 0x20,
            SetCdDeviceConn => 0x30,
            GetCdDeviceConn => 0x31,
            GetLastBufferDest => 0x32,
            SetFilterRange => 0x40,
            GetFilterRange => 0x41,
            SetFilterSubheader => 0x42,
            GetFilterSubheader => 0x43,
            SetFilterMode => 0x44,
            GetFilterMode => 0x45,
            SetFilterConn => 0x46,
            GetFilterConn => 0x47,
            ResetSelector => 0x48,
            GetBufferSize => 0x50,
            GetSectorNumber => 0x51,
            CalcActualSize => 0x52,
            GetActualSize => 0x53,
            GetSectorInfo => 0x54,
            ExecFadSearch => 0x55,
            GetFadSearch => 0x56,
            SetSectorLength => 0x60,
            GetSectorData => 0x61,
            DeleteSectorData => 0x62,
            GetDeleteSectorData => 0x63,
            PutSectorData => 0x64,
            CopySectorData => 0x65,
            MoveSectorData => 0x66,
            GetCopyError => 0x67,
            ChangeDir => 0x70,
            ReadDir => 0x71,
            GetFsScope => 0x72,
            GetFileInfo => 0x73,
            ReadFile => 0x74,
            AbortFile => 0x75,
            AuthDevice => 0xE0,
            GetAuth => 0xE1,
        }
    }
}

/// Longueur de secteur utilisée par les transferts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SectorLength {
    #[default]
    Bytes2048,
    Bytes2336,
    Bytes2340,
    Bytes2352,
}

impl SectorLength {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Bytes2048),
            1 => Some(Self::Bytes2336),
            2 => Some(Self::Bytes2340),
            3 => Some(Self::Bytes2352),
            _ => None,
        }
    }
}

/// Mots de commande à écrire dans CR1..CR4
pub fn command_words(cmd: Command, cr1_low: u8, cr2: u16, cr3: u16, cr4: u16) -> [u16; 4] {
    [((cmd.code() as u16) << 8) | cr1_low as u16, cr2, cr3, cr4]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_codes_are_consistent() {
        for code in 0..=0xFFu8 {
            if let Some(cmd) = Command::from_code(code) {
                assert_eq!(cmd.code(), code);
            }
        }
        assert_eq!(Command::from_code(0x13), None);
    }
}
