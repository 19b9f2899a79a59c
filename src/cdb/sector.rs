//! Aides de décodage des secteurs bruts (2352 octets)

/// Taille d'un secteur brut
pub const RAW_SECTOR_SIZE: usize = 2352;

/// Taille du sous-canal P-W entrelacé
pub const SUBCHANNEL_SIZE: usize = 96;

/// Taille des données utilisateur (Mode 1 / Mode 2 Form 1)
pub const USER_DATA_SIZE: usize = 2048;

/// Décalage entre adresse de trame (FAD) et LBA
pub const FAD_LBA_OFFSET: u32 = 150;

pub fn bcd_to_u8(bcd: u8) -> u8 {
    (bcd >> 4) * 10 + (bcd & 0x0F)
}

pub fn u8_to_bcd(value: u8) -> u8 {
    ((value / 10) << 4) | (value % 10)
}

/// Minutes/secondes/trames vers adresse absolue
pub fn msf_to_fad(m: u8, s: u8, f: u8) -> u32 {
    (m as u32 * 60 + s as u32) * 75 + f as u32
}

/// Adresse absolue vers minutes/secondes/trames en BCD
pub fn fad_to_bcd_msf(fad: u32) -> [u8; 3] {
    let m = fad / (60 * 75);
    let s = (fad / 75) % 60;
    let f = fad % 75;
    [u8_to_bcd(m as u8), u8_to_bcd(s as u8), u8_to_bcd(f as u8)]
}

/// FAD inscrite dans l'en-tête du secteur
pub fn header_fad(data: &[u8]) -> u32 {
    msf_to_fad(bcd_to_u8(data[12]), bcd_to_u8(data[13]), bcd_to_u8(data[14]))
}

/// Octet de mode de l'en-tête
pub fn header_mode(data: &[u8]) -> u8 {
    data[15]
}

/// Sous-en-tête Mode 2
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Subheader {
    pub file: u8,
    pub channel: u8,
    pub submode: u8,
    pub coding_info: u8,
}

impl Subheader {
    pub const SUBMODE_FORM2: u8 = 0x20;

    /// Sous-en-tête du secteur, nul hors Mode 2
    pub fn of(data: &[u8]) -> Self {
        if header_mode(data) == 0x2 {
            Self {
                file: data[16],
                channel: data[17],
                submode: data[18],
                coding_info: data[19],
            }
        } else {
            Self::default()
        }
    }
}

/// Décalage des données utilisateur dans le secteur brut
pub fn user_data_offset(data: &[u8]) -> usize {
    if header_mode(data) == 0x2 {
        24
    } else {
        16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bcd_conversions() {
        assert_eq!(bcd_to_u8(0x59), 59);
        assert_eq!(u8_to_bcd(74), 0x74);
        assert_eq!(fad_to_bcd_msf(150), [0x00, 0x02, 0x00]);
    }

    #[test]
    fn test_header_fad() {
        let mut data = vec![0u8; RAW_SECTOR_SIZE];
        data[12..15].copy_from_slice(&fad_to_bcd_msf(4500 + 37));
        data[15] = 1;

        assert_eq!(header_fad(&data), 4537);
        assert_eq!(Subheader::of(&data), Subheader::default());
    }
}
