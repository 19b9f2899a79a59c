//! Outils partagés par les tests d'intégration du bloc CD
#![allow(dead_code)]

use std::sync::Arc;

use pixel_saturn_rust::cdb::{reg, Cdb, DrivePhase, Hirq, MemoryDisc};
use pixel_saturn_rust::cdb::registers::status;
use pixel_saturn_rust::scheduler::{Timestamp, Unit};

/// Boucle d'émulation minimale autour d'un bloc CD seul
pub struct CdbHarness {
    pub cdb: Cdb,
    pub ts: Timestamp,
    next: Timestamp,
}

impl CdbHarness {
    pub fn new(disc: Option<MemoryDisc>) -> Self {
        let mut cdb = Cdb::default();
        if let Some(disc) = disc {
            cdb.set_disc(false, Some(Arc::new(disc)));
        }
        let next = cdb.update(0).max(1);

        Self { cdb, ts: 0, next }
    }

    /// Bloc CD démarré, disque éventuel en pause sur la première piste
    pub fn booted(disc: Option<MemoryDisc>) -> Self {
        let with_disc = disc.is_some();
        let mut h = Self::new(disc);

        assert!(h.wait_irq(Hirq::CMOK, 20_000_000), "pas de CMOK à la mise sous tension");
        assert_eq!(h.read_results(), [0x0043, 0x4442, 0x4c4f, 0x434b]);

        if with_disc {
            let ready = h.wait_for(80_000_000, |c| {
                c.drive_phase() == DrivePhase::Playing && c.position().status == status::PAUSE
            });
            assert!(ready, "le disque n'a pas démarré");
        }
        h
    }

    /// Même position dans le temps, autre bloc CD (état restauré)
    pub fn fork(&self, cdb: Cdb) -> Self {
        Self {
            cdb,
            ts: self.ts,
            next: self.next,
        }
    }

    fn step(&mut self) {
        self.ts = self.next;
        self.next = self.cdb.update(self.ts).max(self.ts + 1);
    }

    pub fn run_until(&mut self, target: Timestamp) {
        while self.next <= target {
            self.step();
        }
        if self.ts < target {
            self.ts = target;
            self.next = self.cdb.update(target).max(target + 1);
        }
    }

    /// Une seule mise à jour à `target`, sans étapes intermédiaires
    pub fn jump_to(&mut self, target: Timestamp) {
        self.ts = target;
        self.next = self.cdb.update(target).max(target + 1);
    }

    /// Émule jusqu'à ce que `cond` soit vraie ; `false` après `limit` cycles
    pub fn wait_for(&mut self, limit: Timestamp, cond: impl Fn(&Cdb) -> bool) -> bool {
        let end = self.ts.saturating_add(limit);

        while !cond(&self.cdb) {
            if self.next > end {
                self.run_until(end);
                return cond(&self.cdb);
            }
            self.step();
        }
        true
    }

    pub fn wait_irq(&mut self, bits: Hirq, limit: Timestamp) -> bool {
        self.wait_for(limit, |c| c.hirq().contains(bits))
    }

    pub fn clear_hirq(&mut self) {
        self.cdb.write(reg::HIRQ, 0, 0xFFFF);
    }

    pub fn read_results(&mut self) -> [u16; 4] {
        [reg::CR1, reg::CR2, reg::CR3, reg::CR4].map(|r| self.cdb.read(r))
    }

    /// Écrit CR1..CR4 ; la dernière écriture soumet la commande
    pub fn submit(&mut self, words: [u16; 4]) {
        self.cdb.write(reg::HIRQ, !Hirq::CMOK.bits(), 0xFFFF);

        for (i, w) in words.iter().enumerate() {
            if self.cdb.write(reg::CR1 + i as u32, *w, 0xFFFF) {
                self.next = self.next.min(self.ts + 1);
            }
        }
    }

    /// Soumet une commande et rend ses résultats à l'arrivée de CMOK
    pub fn command(&mut self, words: [u16; 4]) -> [u16; 4] {
        self.submit(words);
        assert!(self.wait_irq(Hirq::CMOK, 2_000_000), "pas de CMOK pour {:04x}", words[0]);
        self.read_results()
    }

    pub fn read_data(&mut self, words: usize) -> Vec<u16> {
        (0..words).map(|_| self.cdb.read(reg::DATA)).collect()
    }

    pub fn write_data(&mut self, words: &[u16]) {
        for &w in words {
            self.cdb.write(reg::DATA, w, 0xFFFF);
        }
    }
}

/// Statut de base d'un mot de résultat
pub fn status_of(results: [u16; 4]) -> u8 {
    (results[0] >> 8) as u8
}

/// Enregistrement de répertoire ISO9660 minimal
pub fn dir_record(extent: u32, size: u32, flags: u8, name: &[u8]) -> Vec<u8> {
    let len = 33 + name.len() + (name.len() + 1) % 2;
    let mut rr = vec![0u8; len];
    rr[0] = len as u8;
    rr[2..6].copy_from_slice(&extent.to_le_bytes());
    rr[6..10].copy_from_slice(&extent.to_be_bytes());
    rr[10..14].copy_from_slice(&size.to_le_bytes());
    rr[14..18].copy_from_slice(&size.to_be_bytes());
    rr[25] = flags;
    rr[32] = name.len() as u8;
    rr[33..33 + name.len()].copy_from_slice(name);
    rr
}

/// Disque de données avec un système de fichiers ISO9660 minimal
///
/// Racine en LBA 20 : `FILE.BIN` (LBA 30, 4096 octets) et `SUBDIR`
/// (LBA 22) qui contient `INNER.BIN` (LBA 40, 100 octets).
pub fn iso_disc() -> MemoryDisc {
    let mut disc = MemoryDisc::data_disc(64);
    disc.write_user_data(0, b"SEGA SEGASATURN ");

    let mut pvd = vec![0u8; 2048];
    pvd[0] = 0x01;
    pvd[1..6].copy_from_slice(b"CD001");
    pvd[6] = 0x01;
    let root = dir_record(20, 2048, 0x02, &[0]);
    pvd[156..156 + root.len()].copy_from_slice(&root);
    disc.write_user_data(16, &pvd);

    let mut terminator = vec![0u8; 2048];
    terminator[0] = 0xFF;
    terminator[1..6].copy_from_slice(b"CD001");
    disc.write_user_data(17, &terminator);

    let mut root_dir = Vec::new();
    root_dir.extend(dir_record(20, 2048, 0x02, &[0]));
    root_dir.extend(dir_record(20, 2048, 0x02, &[1]));
    root_dir.extend(dir_record(30, 4096, 0x00, b"FILE.BIN;1"));
    root_dir.extend(dir_record(22, 2048, 0x02, b"SUBDIR"));
    disc.write_user_data(20, &root_dir);

    let mut sub_dir = Vec::new();
    sub_dir.extend(dir_record(22, 2048, 0x02, &[0]));
    sub_dir.extend(dir_record(20, 2048, 0x02, &[1]));
    sub_dir.extend(dir_record(40, 100, 0x00, b"INNER.BIN;1"));
    disc.write_user_data(22, &sub_dir);

    disc
}
