//! Pixel Saturn Rust - Noyau de synchronisation SEGA Saturn
//!
//! Cette bibliothèque fournit le noyau à événements discrets d'un émulateur
//! Saturn et ses consommateurs : le bloc CD (commandes, lecteur, tampons
//! et filtres), la minuterie de lignes du VDP2 et la transmission du rendu
//! vers un thread dédié.

pub mod scheduler;
pub mod cdb;
pub mod render;
pub mod vdp2;
pub mod system;
pub mod config;

pub use scheduler::{EventQueue, Timestamp, Unit, UnitDispatch, UnitId, DISABLED_TS};
pub use cdb::Cdb;
pub use render::{BackdropRenderer, LineRenderer, RenderCommand, RenderHandoff};
pub use vdp2::Vdp2;
pub use system::Saturn;
pub use config::*;

/// Version de l'émulateur
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Horloge maître NTSC (SH-2) en Hz
pub const NTSC_MASTER_CLOCK: u32 = 28_636_360;

/// Horloge maître PAL en Hz
pub const PAL_MASTER_CLOCK: u32 = 28_437_500;
