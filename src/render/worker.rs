//! Boucle du thread de rendu

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError, TryRecvError};
use log::debug;
use parking_lot::Mutex;

use super::{FrameBuffer, HandoffCounters, LineRenderer, RenderCommand};

/// Attente passive maximale entre deux vérifications de la file
const IDLE_WAIT: Duration = Duration::from_millis(1);

/// Prochaine commande ; `None` quand le producteur a disparu
fn next_command(rx: &Receiver<RenderCommand>, busy_wait: bool) -> Option<RenderCommand> {
    if busy_wait {
        loop {
            match rx.try_recv() {
                Ok(cmd) => return Some(cmd),
                Err(TryRecvError::Empty) => std::hint::spin_loop(),
                Err(TryRecvError::Disconnected) => return None,
            }
        }
    }

    loop {
        match rx.recv_timeout(IDLE_WAIT) {
            Ok(cmd) => return Some(cmd),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return None,
        }
    }
}

pub(super) fn run<R: LineRenderer>(
    rx: Receiver<RenderCommand>,
    mut renderer: R,
    frame: Arc<Mutex<FrameBuffer>>,
    counters: Arc<HandoffCounters>,
) {
    let mut busy_wait = false;

    while let Some(cmd) = next_command(&rx, busy_wait) {
        let running = match cmd {
            RenderCommand::Write8 { addr, value } => {
                renderer.write8(addr, value);
                true
            }
            RenderCommand::Write16 { addr, value } => {
                renderer.write16(addr, value);
                true
            }
            RenderCommand::DrawLine { vdp2_line, out_line, field } => {
                {
                    let mut frame = frame.lock();
                    let width = renderer.draw_line(vdp2_line, field, frame.line_mut(out_line as usize));
                    if let Some(w) = frame.line_widths.get_mut(out_line as usize) {
                        *w = width;
                    }
                }
                counters.draw_counter.fetch_sub(1, Ordering::Release);
                true
            }
            RenderCommand::Reset { powering_up } => {
                renderer.reset(powering_up);
                true
            }
            RenderCommand::SetEnableMask(mask) => {
                renderer.set_layer_enable_mask(mask);
                true
            }
            RenderCommand::SetBusyWait(enabled) => {
                busy_wait = enabled;
                true
            }
            RenderCommand::Exit => false,
        };

        counters.queued.fetch_sub(1, Ordering::Release);

        if !running {
            break;
        }
    }

    debug!("[VDP2REND] Thread de rendu terminé");
}
