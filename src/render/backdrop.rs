//! Moteur de tracé minimal : couleur de fond et registre d'affichage
//!
//! Les plans de défilement sont hors du noyau ; ce moteur garde une image
//! des registres, de la CRAM et de la VRAM écrites par l'hôte et trace
//! chaque ligne avec la couleur de fond.

use log::trace;

use super::LineRenderer;

const VRAM_BASE: u32 = 0x00_0000;
const VRAM_WORDS: usize = 0x4_0000;
const CRAM_BASE: u32 = 0x10_0000;
const CRAM_WORDS: usize = 0x800;
const REGS_BASE: u32 = 0x18_0000;
const REGS_WORDS: usize = 0x100;

/// Registre TVMD (mot 0) : bit 15 = affichage actif, bits 0-2 = résolution horizontale
const TVMD: usize = 0x00;
/// Registre BKTAU/BKTAL (mots 0x56 et 0x57) : adresse de la couleur de fond en VRAM
const BKTAU: usize = 0x56;
const BKTAL: usize = 0x57;

/// Bit du masque d'activation des plans qui correspond au fond
pub const LAYER_BACKDROP: u64 = 1 << 6;

/// Couleur 15 bits BGR vers 0x00RRGGBB
pub fn rgb555_to_rgb888(c: u16) -> u32 {
    let r = (c & 0x1F) as u32;
    let g = ((c >> 5) & 0x1F) as u32;
    let b = ((c >> 10) & 0x1F) as u32;
    let expand = |v: u32| (v << 3) | (v >> 2);
    (expand(r) << 16) | (expand(g) << 8) | expand(b)
}

#[derive(Debug, Clone)]
pub struct BackdropRenderer {
    vram: Vec<u16>,
    cram: Vec<u16>,
    regs: Vec<u16>,
    layer_enable_mask: u64,
}

impl BackdropRenderer {
    pub fn new() -> Self {
        Self {
            vram: vec![0; VRAM_WORDS],
            cram: vec![0; CRAM_WORDS],
            regs: vec![0; REGS_WORDS],
            layer_enable_mask: !0,
        }
    }

    fn word_mut(&mut self, addr: u32) -> Option<&mut u16> {
        let addr = addr & 0x1F_FFFF;
        let (mem, base) = if addr >= REGS_BASE {
            (&mut self.regs, REGS_BASE)
        } else if addr >= CRAM_BASE {
            (&mut self.cram, CRAM_BASE)
        } else {
            (&mut self.vram, VRAM_BASE)
        };

        mem.get_mut(((addr - base) >> 1) as usize)
    }

    pub fn register(&self, index: usize) -> u16 {
        self.regs.get(index).copied().unwrap_or(0)
    }

    /// Largeur de ligne selon HRESO
    pub fn line_width(&self) -> usize {
        match self.register(TVMD) & 0x7 {
            0 | 2 | 4 => 320,
            1 | 3 | 5 => 352,
            6 => 640,
            _ => 704,
        }
    }

    fn backdrop_color(&self) -> u32 {
        let addr = ((((self.register(BKTAU) & 0x7) as u32) << 16) | self.register(BKTAL) as u32) as usize;
        rgb555_to_rgb888(self.vram.get(addr % VRAM_WORDS).copied().unwrap_or(0))
    }
}

impl Default for BackdropRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl LineRenderer for BackdropRenderer {
    fn write8(&mut self, addr: u32, value: u16) {
        let shift = if addr & 1 == 0 { 8 } else { 0 };
        if let Some(w) = self.word_mut(addr & !1) {
            *w = (*w & !(0xFF << shift)) | ((value & 0xFF) << shift);
        }
    }

    fn write16(&mut self, addr: u32, value: u16) {
        if let Some(w) = self.word_mut(addr & !1) {
            *w = value;
        }
    }

    fn draw_line(&mut self, vdp2_line: u16, _field: bool, out: &mut [u32]) -> usize {
        let width = self.line_width().min(out.len());
        let display_on = self.register(TVMD) & 0x8000 != 0;

        let color = if display_on && self.layer_enable_mask & LAYER_BACKDROP != 0 {
            self.backdrop_color()
        } else {
            0
        };

        trace!("[VDP2REND] Ligne {} : fond 0x{:06x}", vdp2_line, color);
        out[..width].fill(color);
        width
    }

    fn reset(&mut self, powering_up: bool) {
        self.regs.fill(0);
        if powering_up {
            self.vram.fill(0);
            self.cram.fill(0);
        }
    }

    fn set_layer_enable_mask(&mut self, mask: u64) {
        self.layer_enable_mask = mask;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rgb555_expansion() {
        assert_eq!(rgb555_to_rgb888(0x001F), 0xFF_00_00);
        assert_eq!(rgb555_to_rgb888(0x7C00), 0x00_00_FF);
        assert_eq!(rgb555_to_rgb888(0), 0);
    }

    #[test]
    fn test_byte_writes_merge_big_endian() {
        let mut r = BackdropRenderer::new();
        r.write8(REGS_BASE, 0x80);
        r.write8(REGS_BASE + 1, 0x01);
        assert_eq!(r.register(TVMD), 0x8001);
        assert_eq!(r.line_width(), 352);
    }

    #[test]
    fn test_backdrop_line() {
        let mut r = BackdropRenderer::new();
        r.write16(VRAM_BASE + 0x100, 0x001F);
        r.write16(REGS_BASE + (BKTAL as u32) * 2, 0x80);
        r.write16(REGS_BASE, 0x8000);

        let mut line = vec![0u32; 704];
        assert_eq!(r.draw_line(10, false, &mut line), 320);
        assert!(line[..320].iter().all(|&p| p == 0xFF_00_00));
        assert_eq!(line[320], 0);

        r.set_layer_enable_mask(0);
        r.draw_line(10, false, &mut line);
        assert_eq!(line[0], 0);
    }
}
