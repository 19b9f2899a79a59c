use std::sync::Arc;

use anyhow::Context;
use log::{info, warn};
use pixel_saturn_rust::cdb::{reg, registers::command_words, Command, Hirq, MemoryDisc};
use pixel_saturn_rust::*;

/// Soumet une commande et émule jusqu'à l'arrivée de CMOK
fn run_command(saturn: &mut Saturn, words: [u16; 4]) -> anyhow::Result<[u16; 4]> {
    let ts = saturn.timestamp();
    saturn.cdb_write(reg::HIRQ, !Hirq::CMOK.bits(), 0xFFFF, ts);
    for (i, w) in words.iter().enumerate() {
        saturn.cdb_write(reg::CR1 + i as u32, *w, 0xFFFF, ts);
    }

    for _ in 0..64 {
        let ts = saturn.timestamp() + 2000;
        saturn.run_until(ts);
        if saturn.cdb_read(reg::HIRQ, ts) & Hirq::CMOK.bits() != 0 {
            let ts = saturn.timestamp();
            return Ok([0, 1, 2, 3].map(|i| saturn.cdb_read(reg::CR1 + i, ts)));
        }
    }

    anyhow::bail!("Pas de CMOK pour la commande {:04x}", words[0])
}

fn main() -> anyhow::Result<()> {
    println!("🎮 SEGA Saturn timing kernel v{}", VERSION);
    println!("================================");

    let config_path = std::env::args().nth(1);
    let mut config = match &config_path {
        Some(path) => EmulatorConfig::load_from_file(path).with_context(|| format!("Configuration {}", path))?,
        None => EmulatorConfig::default(),
    };

    // RUST_LOG reste prioritaire
    let filter = config.emulation.default_log_filter();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    if config.cdb.demo_disc_sectors == 0 {
        config.cdb.demo_disc_sectors = 4500;
    }

    let frames = config.emulation.frames;
    let sectors = config.cdb.demo_disc_sectors;
    let mut saturn = Saturn::with_backdrop(config)?;

    println!("Insertion d'un disque synthétique de {} secteurs...", sectors);
    saturn.set_disc(false, Some(Arc::new(MemoryDisc::data_disc(sectors))));

    println!("Émulation de {} images...", frames);
    let mut completed = 0;
    for frame in 0..frames {
        if !saturn.run_frame() {
            warn!("Image {} incomplète", frame);
            continue;
        }
        completed += 1;
    }
    println!("  Images terminées: {}/{}", completed, frames);

    let results = saturn.cdb().results();
    println!(
        "  Résultats CDB après démarrage: {:04x} {:04x} {:04x} {:04x}",
        results[0], results[1], results[2], results[3]
    );

    println!("Lecture du statut du lecteur...");
    let status = run_command(&mut saturn, command_words(Command::GetCdStatus, 0, 0, 0, 0))?;
    println!("  Statut: 0x{:02x}, FAD 0x{:06x}", status[0] >> 8, ((status[2] as u32 & 0xFF) << 16) | status[3] as u32);

    let bufsize = run_command(&mut saturn, command_words(Command::GetBufferSize, 0, 0, 0, 0))?;
    println!("  Tampons libres: {}/{}", bufsize[1], bufsize[3]);

    let state = saturn.save_state()?;
    info!("Sauvegarde d'état: {} octets", state.len());
    println!("  Sauvegarde d'état: {} octets ✓", state.len());

    let stats = saturn.vdp2().handoff().stats().clone();
    println!("✅ Émulation terminée");
    println!("   - Images rendues: {}", stats.frames_rendered);
    println!("   - Lignes transmises: {}", stats.lines_queued);

    Ok(())
}
