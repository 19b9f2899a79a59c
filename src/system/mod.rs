//! Console : file d'événements, unités et accès bus
//!
//! `Saturn` possède la file d'événements et les unités. Les accès bus
//! mettent d'abord l'unité concernée à jour jusqu'au timestamp de l'accès,
//! appliquent l'accès puis replanifient l'unité.

use std::sync::Arc;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::cdb::{Cdb, Disc, StateError};
use crate::config::EmulatorConfig;
use crate::render::{BackdropRenderer, LineRenderer, RenderError, RenderHandoff};
use crate::scheduler::{EventQueue, EventSnapshot, Timestamp, Unit, UnitDispatch, UnitId, DISABLED_TS};
use crate::vdp2::{Vdp2, Vdp2State};

/// Version du format de sauvegarde de la console
pub const SATURN_STATE_VERSION: u32 = 1;

/// Unités planifiables, séparées de la file pour les emprunts disjoints
#[derive(Debug)]
struct Units {
    cdb: Cdb,
    vdp2: Vdp2,
}

impl UnitDispatch for Units {
    fn dispatch(&mut self, unit: UnitId, timestamp: Timestamp) -> Timestamp {
        match unit {
            UnitId::Cdb => self.cdb.update(timestamp),
            UnitId::Vdp2 => self.vdp2.update(timestamp),
        }
    }
}

impl Units {
    fn reset_ts(&mut self) {
        self.cdb.reset_ts();
        self.vdp2.reset_ts();
    }
}

#[derive(Serialize, Deserialize)]
struct SaturnState {
    timestamp: Timestamp,
    events: EventSnapshot,
    cdb: Vec<u8>,
    vdp2: Vdp2State,
}

#[derive(Debug)]
pub struct Saturn {
    events: EventQueue,
    units: Units,
    timestamp: Timestamp,
    config: EmulatorConfig,
}

impl Saturn {
    pub fn new<R: LineRenderer>(config: EmulatorConfig, renderer: R) -> Result<Self, RenderError> {
        let handoff = RenderHandoff::new(renderer, &config.render)?;
        let vdp2 = Vdp2::new(handoff, &config.timing, &config.render);
        let cdb = Cdb::new(config.cdb.buffer_count, config.timing.cd_clock_ratio());

        info!(
            "Console initialisée: horloge {} Hz, ratio CD 0x{:08x}, {} tampons",
            config.timing.master_clock_hz,
            config.timing.cd_clock_ratio(),
            config.cdb.buffer_count
        );

        Ok(Self {
            events: EventQueue::new(),
            units: Units { cdb, vdp2 },
            timestamp: 0,
            config,
        })
    }

    /// Console avec le moteur de tracé de fond intégré
    pub fn with_backdrop(config: EmulatorConfig) -> Result<Self, RenderError> {
        Self::new(config, BackdropRenderer::new())
    }

    /// Réinitialisation matérielle de toutes les unités
    pub fn reset(&mut self, powering_up: bool) {
        self.events.force_updates(self.timestamp, &mut self.units);

        self.units.cdb.reset();
        self.units.vdp2.reset(powering_up);

        for unit in UnitId::ALL {
            self.events.schedule(unit, self.timestamp);
        }
    }

    pub fn set_disc(&mut self, tray_open: bool, disc: Option<Arc<dyn Disc>>) {
        self.sync(UnitId::Cdb, self.timestamp);
        self.units.cdb.set_disc(tray_open, disc);
        self.events.schedule(UnitId::Cdb, self.timestamp + 1);
    }

    fn sync(&mut self, unit: UnitId, timestamp: Timestamp) -> Timestamp {
        let nt = self.units.dispatch(unit, timestamp);
        self.events.schedule(unit, nt);
        nt
    }

    /// Lecture d'un registre du bloc CD (offset en mots)
    pub fn cdb_read(&mut self, offset: u32, timestamp: Timestamp) -> u16 {
        self.sync(UnitId::Cdb, timestamp);
        self.units.cdb.read(offset)
    }

    /// Écriture d'un registre du bloc CD
    pub fn cdb_write(&mut self, offset: u32, value: u16, mask: u16, timestamp: Timestamp) {
        self.sync(UnitId::Cdb, timestamp);

        if self.units.cdb.write(offset, value, mask) {
            self.events.schedule(UnitId::Cdb, timestamp + 1);
        }
    }

    pub fn cdb_irq_asserted(&self) -> bool {
        self.units.cdb.irq_asserted()
    }

    pub fn vdp2_write8(&mut self, addr: u32, value: u8, timestamp: Timestamp) {
        self.sync(UnitId::Vdp2, timestamp);
        self.units.vdp2.write8(addr, value);
    }

    pub fn vdp2_write16(&mut self, addr: u32, value: u16, timestamp: Timestamp) {
        self.sync(UnitId::Vdp2, timestamp);
        self.units.vdp2.write16(addr, value);
    }

    /// Traite les événements jusqu'à `timestamp` inclus
    pub fn run_until(&mut self, timestamp: Timestamp) -> usize {
        let calls = self.events.advance_to(timestamp, &mut self.units);
        self.timestamp = self.timestamp.max(timestamp);
        calls
    }

    /// Émule jusqu'à la fin de l'image courante
    ///
    /// Retourne `false` si aucune image n'a été terminée dans la limite de
    /// deux durées d'image.
    pub fn run_frame(&mut self) -> bool {
        let limit = self
            .timestamp
            .saturating_add((self.config.timing.cycles_per_frame() * 2).min(Timestamp::MAX as i64) as Timestamp);
        let mut done = false;

        while self.timestamp < limit {
            let next = self.events.next_event_time();
            if next == DISABLED_TS {
                warn!("Aucune unité armée, image abandonnée");
                break;
            }

            self.run_until(next.min(limit));

            if self.units.vdp2.take_frame_done() {
                done = true;
                break;
            }
        }

        if done {
            self.units.vdp2.end_frame();

            let interval = self.config.emulation.rebase_interval as u64;
            if interval > 0 && self.units.vdp2.frame_count() % interval == 0 {
                self.rebase();
            }
        }

        done
    }

    /// Ramène le timestamp global à zéro
    pub fn rebase(&mut self) {
        let ts = self.timestamp;
        self.events.force_updates(ts, &mut self.units);
        self.events.rebase(ts);
        self.units.reset_ts();
        self.timestamp = 0;

        debug!("Rebasage des timestamps de {}", ts);
    }

    pub fn save_state(&mut self) -> Result<Vec<u8>, StateError> {
        self.units.vdp2.handoff().wait_idle();

        let state = SaturnState {
            timestamp: self.timestamp,
            events: self.events.snapshot(),
            cdb: self.units.cdb.save_state()?,
            vdp2: self.units.vdp2.state(),
        };

        Ok(bincode::serialize(&(SATURN_STATE_VERSION, state))?)
    }

    pub fn load_state(&mut self, bytes: &[u8]) -> Result<(), StateError> {
        let (version, state): (u32, SaturnState) = bincode::deserialize(bytes)?;
        if version != SATURN_STATE_VERSION {
            return Err(StateError::Version(version));
        }

        self.units.cdb.load_state(&state.cdb)?;
        self.units.vdp2.set_state(state.vdp2);
        self.timestamp = state.timestamp;

        if !self.events.restore(&state.events) {
            for unit in UnitId::ALL {
                self.events.schedule(unit, self.timestamp);
            }
        }

        Ok(())
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn events(&self) -> &EventQueue {
        &self.events
    }

    pub fn cdb(&self) -> &Cdb {
        &self.units.cdb
    }

    pub fn cdb_mut(&mut self) -> &mut Cdb {
        &mut self.units.cdb
    }

    pub fn vdp2(&self) -> &Vdp2 {
        &self.units.vdp2
    }

    pub fn config(&self) -> &EmulatorConfig {
        &self.config
    }
}
