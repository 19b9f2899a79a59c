//! Tests de la transmission du rendu vers le thread dédié

use std::sync::Arc;

use parking_lot::Mutex;
use pixel_saturn_rust::config::RenderConfig;
use pixel_saturn_rust::render::{BackdropRenderer, LineRenderer, RenderHandoff, BLANK_LINE_WIDTH};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Write8(u32, u16),
    Write16(u32, u16),
    Draw(u16),
    Reset(bool),
    Mask(u64),
}

/// Moteur qui journalise tout ce qu'il reçoit
struct Recorder {
    log: Arc<Mutex<Vec<Event>>>,
    width: usize,
}

impl LineRenderer for Recorder {
    fn write8(&mut self, addr: u32, value: u16) {
        self.log.lock().push(Event::Write8(addr, value));
    }

    fn write16(&mut self, addr: u32, value: u16) {
        self.log.lock().push(Event::Write16(addr, value));
    }

    fn draw_line(&mut self, vdp2_line: u16, _field: bool, out: &mut [u32]) -> usize {
        self.log.lock().push(Event::Draw(vdp2_line));
        let n = self.width.min(out.len());
        out[..n].fill(vdp2_line as u32 + 1);
        n
    }

    fn reset(&mut self, powering_up: bool) {
        self.log.lock().push(Event::Reset(powering_up));
    }

    fn set_layer_enable_mask(&mut self, mask: u64) {
        self.log.lock().push(Event::Mask(mask));
    }
}

fn handoff(queue_capacity: usize, visible_lines: u32) -> (RenderHandoff, Arc<Mutex<Vec<Event>>>) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let recorder = Recorder {
        log: Arc::clone(&log),
        width: 16,
    };
    let config = RenderConfig {
        queue_capacity,
        visible_lines,
        line_width: 32,
    };

    (RenderHandoff::new(recorder, &config).unwrap(), log)
}

/// Le thread de rendu voit les commandes dans l'ordre d'émission
#[test]
fn test_commands_arrive_in_order() {
    let (mut h, log) = handoff(64, 8);

    h.reset(true);
    h.write16(0x18_0000, 0x8000);
    h.start_frame();
    h.draw_line(0, 0, false);
    h.write8(0x18_0001, 0x03);
    h.draw_line(1, 1, false);
    h.set_layer_enable_mask(0x40);
    h.end_frame();
    h.wait_idle();

    assert_eq!(
        *log.lock(),
        vec![
            Event::Reset(true),
            Event::Write16(0x18_0000, 0x8000),
            Event::Draw(0),
            Event::Write8(0x18_0001, 0x03),
            Event::Draw(1),
            Event::Mask(0x40),
        ]
    );
    assert_eq!(h.queued(), 0);
}

/// `end_frame` attend les lignes demandées puis noircit le reste
#[test]
fn test_end_frame_blanks_undrawn_lines() {
    let (mut h, _log) = handoff(64, 8);

    h.start_frame();
    for line in 0..3 {
        h.draw_line(line as u16, line, false);
    }
    h.end_frame();

    assert_eq!(h.draw_counter(), 0);
    assert_eq!(h.stats().lines_queued, 3);
    assert_eq!(h.stats().lines_blanked, 5);
    assert_eq!(h.stats().frames_rendered, 1);

    let frame = h.frame();
    let frame = frame.lock();
    assert_eq!(&frame.line_widths[..3], &[16, 16, 16]);
    assert!(frame.line_widths[3..].iter().all(|&w| w == BLANK_LINE_WIDTH));
    assert_eq!(frame.line(2)[0], 3);
    assert_eq!(frame.line(5)[0], 0);
}

/// Les lignes hors de la zone visible ne sont pas transmises
#[test]
fn test_lines_outside_visible_area_are_ignored() {
    let (mut h, log) = handoff(64, 4);

    h.start_frame();
    h.draw_line(10, 4, false);
    h.draw_line(11, 100, false);
    h.end_frame();
    h.wait_idle();

    assert_eq!(h.stats().lines_queued, 0);
    assert!(log.lock().is_empty());
}

/// Une file très courte bloque le producteur sans rien perdre
#[test]
fn test_small_queue_applies_backpressure() {
    let (mut h, log) = handoff(1, 4);

    for i in 0..500u32 {
        h.write16(i * 2, i as u16);
    }
    h.start_frame();
    for line in 0..4 {
        h.draw_line(line as u16, line, false);
    }
    h.end_frame();
    h.wait_idle();

    let log = log.lock();
    assert_eq!(log.len(), 504);
    assert_eq!(log[499], Event::Write16(998, 499));
    assert_eq!(log[503], Event::Draw(3));
}

/// La destruction arrête et rejoint le thread de rendu
#[test]
fn test_drop_joins_worker() {
    let (mut h, log) = handoff(16, 240);

    // Passe en attente active (ligne 192) sans jamais terminer l'image
    h.start_frame();
    for line in 0..200 {
        h.draw_line(line as u16, line, false);
    }
    drop(h);

    // Le moteur appartenait au thread : seul le test garde le journal
    assert_eq!(Arc::strong_count(&log), 1);
    assert_eq!(log.lock().len(), 200);
}

#[test]
fn test_backdrop_through_handoff() {
    let config = RenderConfig {
        queue_capacity: 32,
        visible_lines: 2,
        line_width: 704,
    };
    let mut h = RenderHandoff::new(BackdropRenderer::new(), &config).unwrap();

    // Fond rouge lu en VRAM 0x100, affichage actif en 352 pixels
    h.write16(0x100, 0x001F);
    h.write16(0x18_0000 + 0x57 * 2, 0x80);
    h.write16(0x18_0000, 0x8001);

    h.start_frame();
    h.draw_line(0, 0, false);
    h.draw_line(1, 1, false);
    h.end_frame();

    let frame = h.frame();
    let frame = frame.lock();
    assert_eq!(frame.line_widths, vec![352, 352]);
    assert!(frame.line(1)[..352].iter().all(|&p| p == 0xFF_00_00));
    assert_eq!(frame.line(1)[352], 0);
    assert_eq!(h.stats().lines_blanked, 0);
}
