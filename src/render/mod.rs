//! Transmission du rendu VDP2 vers un thread de rendu
//!
//! Le thread d'émulation produit des commandes (écritures de registres,
//! tracé de lignes) dans une file bornée ; un thread de rendu les consomme
//! dans l'ordre. Un compteur de lignes en attente permet à `end_frame`
//! d'attendre la fin du tracé sans vider toute la file.

mod backdrop;
mod worker;

pub use backdrop::BackdropRenderer;

use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{bounded, Sender};
use log::{debug, warn};
use parking_lot::Mutex;
use thiserror::Error;

use crate::config::RenderConfig;

/// Lignes avant la fin de l'image où le rendu passe en attente active
pub const BUSY_WAIT_MARGIN: u32 = 48;

/// Largeur laissée aux lignes non tracées
pub const BLANK_LINE_WIDTH: usize = 4;

/// Commande envoyée au thread de rendu
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderCommand {
    Write8 { addr: u32, value: u16 },
    Write16 { addr: u32, value: u16 },
    DrawLine { vdp2_line: u16, out_line: u16, field: bool },
    Reset { powering_up: bool },
    SetEnableMask(u64),
    SetBusyWait(bool),
    Exit,
}

/// Moteur de tracé exécuté par le thread de rendu
///
/// Le calcul des pixels est hors du noyau : seul le contrat de cette
/// interface est fixé ici.
pub trait LineRenderer: Send + 'static {
    fn write8(&mut self, addr: u32, value: u16);
    fn write16(&mut self, addr: u32, value: u16);

    /// Trace une ligne dans `out` ; retourne la largeur utile
    fn draw_line(&mut self, vdp2_line: u16, field: bool, out: &mut [u32]) -> usize;

    fn reset(&mut self, powering_up: bool);
    fn set_layer_enable_mask(&mut self, mask: u64);
}

/// Image produite par le thread de rendu
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    pub width: usize,
    pub height: usize,
    pub pixels: Vec<u32>,
    pub line_widths: Vec<usize>,
}

impl FrameBuffer {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            pixels: vec![0; width * height],
            line_widths: vec![0; height],
        }
    }

    pub fn line(&self, line: usize) -> &[u32] {
        let start = (line * self.width).min(self.pixels.len());
        let end = (start + self.width).min(self.pixels.len());
        &self.pixels[start..end]
    }

    pub fn line_mut(&mut self, line: usize) -> &mut [u32] {
        let start = (line * self.width).min(self.pixels.len());
        let end = (start + self.width).min(self.pixels.len());
        &mut self.pixels[start..end]
    }

    pub fn clear(&mut self) {
        self.pixels.fill(0);
        self.line_widths.fill(0);
    }
}

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("Impossible de lancer le thread de rendu: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Compteurs partagés entre producteur et thread de rendu
#[derive(Debug, Default)]
pub(crate) struct HandoffCounters {
    /// Lignes demandées et pas encore tracées
    pub draw_counter: AtomicI32,
    /// Commandes envoyées et pas encore traitées
    pub queued: AtomicUsize,
}

/// Statistiques côté producteur
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderStats {
    pub frames_rendered: u64,
    pub lines_queued: u64,
    /// Lignes complétées en noir par `end_frame`
    pub lines_blanked: u64,
}

/// Côté producteur de la transmission de rendu
pub struct RenderHandoff {
    tx: Sender<RenderCommand>,
    counters: Arc<HandoffCounters>,
    frame: Arc<Mutex<FrameBuffer>>,
    worker: Option<JoinHandle<()>>,

    visible_lines: u32,
    next_out_line: u32,
    stats: RenderStats,
}

impl RenderHandoff {
    /// Lance le thread de rendu avec le moteur fourni
    pub fn new<R: LineRenderer>(renderer: R, config: &RenderConfig) -> Result<Self, RenderError> {
        let (tx, rx) = bounded(config.queue_capacity.max(1));
        let counters = Arc::new(HandoffCounters::default());
        let frame = Arc::new(Mutex::new(FrameBuffer::new(config.line_width, config.visible_lines as usize)));

        let worker = {
            let counters = Arc::clone(&counters);
            let frame = Arc::clone(&frame);

            thread::Builder::new()
                .name("vdp2-render".into())
                .spawn(move || worker::run(rx, renderer, frame, counters))?
        };

        debug!(
            "[VDP2REND] Thread de rendu lancé (file de {} commandes, {} lignes visibles)",
            config.queue_capacity, config.visible_lines
        );

        Ok(Self {
            tx,
            counters,
            frame,
            worker: Some(worker),
            visible_lines: config.visible_lines,
            next_out_line: 0,
            stats: RenderStats::default(),
        })
    }

    /// Bloque tant que la file est pleine
    fn send(&self, cmd: RenderCommand) {
        self.counters.queued.fetch_add(1, Ordering::Release);

        if self.tx.send(cmd).is_err() {
            warn!("[VDP2REND] Thread de rendu arrêté, commande {:?} perdue", cmd);
            self.counters.queued.fetch_sub(1, Ordering::Release);
        }
    }

    pub fn write8(&self, addr: u32, value: u16) {
        self.send(RenderCommand::Write8 { addr, value });
    }

    pub fn write16(&self, addr: u32, value: u16) {
        self.send(RenderCommand::Write16 { addr, value });
    }

    pub fn reset(&self, powering_up: bool) {
        self.send(RenderCommand::Reset { powering_up });
    }

    pub fn set_layer_enable_mask(&self, mask: u64) {
        self.send(RenderCommand::SetEnableMask(mask));
    }

    pub fn start_frame(&mut self) {
        self.next_out_line = 0;
    }

    /// Demande le tracé d'une ligne ; les lignes hors zone visible sont ignorées
    pub fn draw_line(&mut self, vdp2_line: u16, crt_line: u32, field: bool) {
        if crt_line >= self.visible_lines {
            return;
        }

        self.counters.draw_counter.fetch_add(1, Ordering::Release);
        self.send(RenderCommand::DrawLine {
            vdp2_line,
            out_line: crt_line as u16,
            field,
        });
        self.stats.lines_queued += 1;

        if crt_line == self.visible_lines.saturating_sub(BUSY_WAIT_MARGIN) {
            self.send(RenderCommand::SetBusyWait(true));
        }

        self.next_out_line = crt_line + 1;
    }

    /// Attend le tracé de toutes les lignes demandées et complète l'image
    pub fn end_frame(&mut self) {
        while self.counters.draw_counter.load(Ordering::Acquire) != 0 {
            if self.worker_stopped() {
                warn!("[VDP2REND] Thread de rendu arrêté, lignes en attente abandonnées");
                self.counters.draw_counter.store(0, Ordering::Release);
                break;
            }
            std::hint::spin_loop();
        }

        self.send(RenderCommand::SetBusyWait(false));

        if self.next_out_line < self.visible_lines {
            let mut frame = self.frame.lock();

            for line in self.next_out_line..self.visible_lines {
                let row = frame.line_mut(line as usize);
                let n = row.len().min(BLANK_LINE_WIDTH);
                row[..n].fill(0);
                if let Some(w) = frame.line_widths.get_mut(line as usize) {
                    *w = BLANK_LINE_WIDTH;
                }
                self.stats.lines_blanked += 1;
            }

            self.next_out_line = self.visible_lines;
        }

        self.stats.frames_rendered += 1;
    }

    /// Attend que la file soit entièrement vide (avant une sauvegarde d'état)
    pub fn wait_idle(&self) {
        while self.counters.queued.load(Ordering::Acquire) != 0 {
            if self.worker_stopped() {
                warn!("[VDP2REND] Thread de rendu terminé avec des commandes en attente");
                return;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn worker_stopped(&self) -> bool {
        self.worker.as_ref().map_or(true, |w| w.is_finished())
    }

    pub fn draw_counter(&self) -> i32 {
        self.counters.draw_counter.load(Ordering::Acquire)
    }

    pub fn queued(&self) -> usize {
        self.counters.queued.load(Ordering::Acquire)
    }

    pub fn visible_lines(&self) -> u32 {
        self.visible_lines
    }

    pub fn stats(&self) -> &RenderStats {
        &self.stats
    }

    /// Image partagée avec le thread de rendu
    pub fn frame(&self) -> Arc<Mutex<FrameBuffer>> {
        Arc::clone(&self.frame)
    }
}

impl Drop for RenderHandoff {
    fn drop(&mut self) {
        self.send(RenderCommand::Exit);

        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("[VDP2REND] Le thread de rendu a paniqué");
            }
        }
    }
}

impl std::fmt::Debug for RenderHandoff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderHandoff")
            .field("visible_lines", &self.visible_lines)
            .field("next_out_line", &self.next_out_line)
            .field("draw_counter", &self.draw_counter())
            .field("queued", &self.queued())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_buffer_lines_are_bounded() {
        let mut fb = FrameBuffer::new(8, 2);
        fb.line_mut(1).fill(7);

        assert_eq!(fb.line(1), &[7; 8]);
        assert!(fb.line(5).is_empty());
        assert!(fb.line_mut(5).is_empty());
    }
}
