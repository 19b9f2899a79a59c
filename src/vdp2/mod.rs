//! Minuterie de lignes du VDP2
//!
//! Unité planifiable qui avance ligne par ligne et transmet au thread de
//! rendu les lignes visibles ainsi que les écritures de registres et de
//! mémoire vidéo, dans l'ordre où l'émulation les produit.

use log::{trace, warn};
use serde::{Deserialize, Serialize};

use crate::config::{RenderConfig, TimingConfig};
use crate::render::RenderHandoff;
use crate::scheduler::{Timestamp, Unit};

/// État sérialisable de la minuterie
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vdp2State {
    pub line: u32,
    pub last_ts: Timestamp,
    pub next_line_ts: Timestamp,
    pub frame_done: bool,
    pub frame_count: u64,
}

#[derive(Debug)]
pub struct Vdp2 {
    handoff: RenderHandoff,
    cycles_per_line: Timestamp,
    total_lines: u32,
    visible_lines: u32,
    state: Vdp2State,
}

impl Vdp2 {
    pub fn new(handoff: RenderHandoff, timing: &TimingConfig, render: &RenderConfig) -> Self {
        Self {
            handoff,
            cycles_per_line: timing.cycles_per_line.max(1) as Timestamp,
            total_lines: timing.total_lines.max(1),
            visible_lines: render.visible_lines,
            state: Vdp2State {
                line: 0,
                last_ts: 0,
                next_line_ts: 0,
                frame_done: false,
                frame_count: 0,
            },
        }
    }

    pub fn reset(&mut self, powering_up: bool) {
        self.handoff.reset(powering_up);
        self.state.line = 0;
        self.state.next_line_ts = self.state.last_ts;
        self.state.frame_done = false;
    }

    pub fn write8(&mut self, addr: u32, value: u8) {
        self.handoff.write8(addr, value as u16);
    }

    pub fn write16(&mut self, addr: u32, value: u16) {
        self.handoff.write16(addr, value);
    }

    pub fn set_layer_enable_mask(&mut self, mask: u64) {
        self.handoff.set_layer_enable_mask(mask);
    }

    /// Consomme l'indicateur de fin d'image
    pub fn take_frame_done(&mut self) -> bool {
        std::mem::take(&mut self.state.frame_done)
    }

    /// Termine l'image courante côté rendu
    pub fn end_frame(&mut self) {
        self.handoff.end_frame();
        self.state.frame_count += 1;
    }

    pub fn line(&self) -> u32 {
        self.state.line
    }

    pub fn frame_count(&self) -> u64 {
        self.state.frame_count
    }

    pub fn handoff(&self) -> &RenderHandoff {
        &self.handoff
    }

    pub fn state(&self) -> Vdp2State {
        self.state
    }

    /// Restaure l'état après avoir vidé la file de rendu
    pub fn set_state(&mut self, state: Vdp2State) {
        self.handoff.wait_idle();
        self.state = state;
        self.state.line %= self.total_lines;
        if self.state.next_line_ts < self.state.last_ts {
            self.state.next_line_ts = self.state.last_ts;
        }
    }

    fn step_line(&mut self) {
        let line = self.state.line;

        if line == 0 {
            self.handoff.start_frame();
        }

        if line < self.visible_lines {
            self.handoff.draw_line(line as u16, line, false);
        }

        // Dernière ligne visible : début du VBlank
        if line + 1 == self.visible_lines {
            trace!("[VDP2] VBlank, image {}", self.state.frame_count);
            self.state.frame_done = true;
        }

        self.state.line = (line + 1) % self.total_lines;
    }
}

impl Unit for Vdp2 {
    fn update(&mut self, timestamp: Timestamp) -> Timestamp {
        if timestamp < self.state.last_ts {
            warn!(
                "[VDP2] Timestamp en arrière: {} < {}, mise à jour ignorée",
                timestamp, self.state.last_ts
            );
            return self.state.next_line_ts.max(self.state.last_ts + 1);
        }
        self.state.last_ts = timestamp;

        while self.state.next_line_ts <= timestamp {
            self.step_line();
            self.state.next_line_ts = self.state.next_line_ts.saturating_add(self.cycles_per_line);
        }

        self.state.next_line_ts
    }

    fn reset_ts(&mut self) {
        self.state.next_line_ts -= self.state.last_ts;
        self.state.last_ts = 0;
    }
}
