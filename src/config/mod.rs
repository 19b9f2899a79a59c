//! Configuration de l'émulateur

use serde::{Deserialize, Serialize};
use anyhow::{Context, Result};
use std::fs;

use crate::cdb::drive::DRIVE_CLOCK;
use crate::cdb::pipeline::DEFAULT_BUFFER_COUNT;
use crate::scheduler::clock_ratio;

/// Configuration principale de l'émulateur
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmulatorConfig {
    pub timing: TimingConfig,
    pub cdb: CdbConfig,
    pub render: RenderConfig,
    pub emulation: EmulationConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Horloge maître (SH-2) en Hz
    pub master_clock_hz: u32,
    /// Horloge du lecteur CD en Hz
    pub cd_clock_hz: u32,
    pub cycles_per_line: u32,
    pub total_lines: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CdbConfig {
    /// Nombre de tampons de secteur
    pub buffer_count: usize,
    /// Disque synthétique chargé au démarrage (nombre de secteurs, 0 = plateau vide)
    pub demo_disc_sectors: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Capacité de la file de commandes de rendu
    pub queue_capacity: usize,
    pub visible_lines: u32,
    /// Largeur maximale d'une ligne de l'image produite
    pub line_width: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmulationConfig {
    /// Images émulées par le binaire de démonstration
    pub frames: u32,
    /// Rebasage des timestamps toutes les N images
    pub rebase_interval: u32,
    /// Niveau de log `debug` par défaut dans le binaire de démonstration
    pub debug_mode: bool,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            master_clock_hz: crate::NTSC_MASTER_CLOCK,
            cd_clock_hz: DRIVE_CLOCK as u32,
            cycles_per_line: 1820,
            total_lines: 263,
        }
    }
}

impl Default for CdbConfig {
    fn default() -> Self {
        Self {
            buffer_count: DEFAULT_BUFFER_COUNT,
            demo_disc_sectors: 0,
        }
    }
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 0x8000,
            visible_lines: 240,
            line_width: 704,
        }
    }
}

impl Default for EmulationConfig {
    fn default() -> Self {
        Self {
            frames: 60,
            rebase_interval: 1,
            debug_mode: false,
        }
    }
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            timing: TimingConfig::default(),
            cdb: CdbConfig::default(),
            render: RenderConfig::default(),
            emulation: EmulationConfig::default(),
        }
    }
}

impl TimingConfig {
    /// Ratio 32.32 horloge CD / horloge maître
    pub fn cd_clock_ratio(&self) -> u32 {
        clock_ratio(self.cd_clock_hz, self.master_clock_hz)
    }

    pub fn cycles_per_frame(&self) -> i64 {
        self.cycles_per_line as i64 * self.total_lines as i64
    }
}

impl EmulationConfig {
    /// Filtre de log par défaut, quand RUST_LOG n'est pas défini
    pub fn default_log_filter(&self) -> &'static str {
        if self.debug_mode {
            "debug"
        } else {
            "info"
        }
    }
}

impl EmulatorConfig {
    pub fn load_from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Lecture de la configuration {}", path))?;
        let config: EmulatorConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_file(&self, path: &str) -> Result<()> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    pub fn load_or_default(path: &str) -> Self {
        Self::load_from_file(path).unwrap_or_default()
    }

    /// Rejette les valeurs qui rendraient le noyau inutilisable
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.timing.master_clock_hz > 0, "Horloge maître nulle");
        anyhow::ensure!(self.timing.cd_clock_hz > 0, "Horloge CD nulle");
        anyhow::ensure!(self.timing.cycles_per_line > 0, "Durée de ligne nulle");
        anyhow::ensure!(
            self.render.visible_lines > 0 && self.render.visible_lines <= self.timing.total_lines,
            "Lignes visibles ({}) hors de [1, {}]",
            self.render.visible_lines,
            self.timing.total_lines
        );
        anyhow::ensure!(
            (1..=u16::MAX as usize).contains(&self.cdb.buffer_count),
            "Nombre de tampons invalide: {}",
            self.cdb.buffer_count
        );
        Ok(())
    }
}
