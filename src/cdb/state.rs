//! Sauvegarde d'état du bloc CD
//!
//! L'état est sérialisé avec bincode. Le disque et le ratio d'horloge ne
//! font pas partie de la sauvegarde : ils sont repris de l'instance qui
//! charge. Les index et chaînages relus sont ensuite validés.

use log::warn;
use thiserror::Error;

use super::pipeline::BufferId;
use super::Cdb;

/// Version du format de sauvegarde
pub const STATE_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum StateError {
    #[error("Sauvegarde illisible: {0}")]
    Codec(#[from] bincode::Error),

    #[error("Version de sauvegarde non supportée: {0} (attendue {STATE_VERSION})")]
    Version(u32),

    #[error("Pool de tampons incompatible: {saved} sauvegardés, {expected} configurés")]
    BufferCount { saved: usize, expected: usize },
}

impl Cdb {
    pub fn save_state(&self) -> Result<Vec<u8>, StateError> {
        Ok(bincode::serialize(&(STATE_VERSION, self))?)
    }

    /// Restaure un état ; l'instance courante reste intacte en cas d'erreur
    pub fn load_state(&mut self, bytes: &[u8]) -> Result<(), StateError> {
        let (version, mut loaded): (u32, Cdb) = bincode::deserialize(bytes)?;

        if version != STATE_VERSION {
            return Err(StateError::Version(version));
        }

        let saved = loaded.pipeline.buffer_count();
        let expected = self.pipeline.buffer_count();
        if saved != expected {
            return Err(StateError::BufferCount { saved, expected });
        }

        loaded.disc = self.disc.clone();
        loaded.clock_ratio = self.clock_ratio;
        loaded.sanitize();

        *self = loaded;
        Ok(())
    }

    /// Ramène les index relus à des valeurs sûres
    pub(super) fn sanitize(&mut self) {
        if self.pipeline.sanitize() {
            warn!("[CDB] Chaînage des tampons corrompu, transfert en cours annulé");
            self.transfer = Default::default();
        }

        self.transfer.sanitize(self.pipeline.buffer_count());

        // Seul un transfert actif détient des tampons détachés
        let orphan = {
            let held: Vec<BufferId> = if self.transfer.active {
                self.transfer.buffers().collect()
            } else {
                Vec::new()
            };
            self.pipeline.detached().find(|id| !held.contains(id))
        };
        if let Some(id) = orphan {
            warn!(
                "[CDB] Tampon 0x{:02x} détaché hors transfert dans la sauvegarde, pool réinitialisé",
                id.0
            );
            self.pipeline.reset_buffers();
            self.transfer = Default::default();
        }

        self.drive.sanitize();
        self.fs.sanitize();

        if self.clock_ratio == 0 {
            self.clock_ratio = 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdb::pipeline::FilterId;

    #[test]
    fn test_rejects_foreign_version() {
        let cdb = Cdb::default();
        let bytes = bincode::serialize(&(STATE_VERSION + 1, &cdb)).unwrap();

        let mut target = Cdb::default();
        assert!(matches!(target.load_state(&bytes), Err(StateError::Version(v)) if v == STATE_VERSION + 1));
    }

    #[test]
    fn test_rejects_truncated_stream() {
        let bytes = Cdb::default().save_state().unwrap();

        let mut target = Cdb::default();
        assert!(matches!(target.load_state(&bytes[..bytes.len() / 2]), Err(StateError::Codec(_))));
    }

    #[test]
    fn test_rejects_other_pool_size() {
        let bytes = Cdb::new(64, 1 << 30).save_state().unwrap();

        let mut target = Cdb::default();
        assert!(matches!(
            target.load_state(&bytes),
            Err(StateError::BufferCount { saved: 64, .. })
        ));
    }

    /// Un tampon détaché sans transfert actif est rendu au pool
    #[test]
    fn test_orphan_detached_buffer_is_recovered() {
        let mut cdb = Cdb::default();
        cdb.pipeline.allocate(false).unwrap();
        assert!(!cdb.transfer.active);
        let bytes = cdb.save_state().unwrap();

        let mut target = Cdb::default();
        target.load_state(&bytes).unwrap();

        assert_eq!(target.pipeline.free_count(), 200);
        assert_eq!(target.pipeline.in_flight(), 0);
        assert!(target.pipeline.check_conservation());
    }

    /// Les tampons détenus par un transfert actif restent en vol
    #[test]
    fn test_transfer_buffers_survive_load() {
        let mut cdb = Cdb::default();
        let ids: Vec<_> = (0..2).map(|_| cdb.pipeline.allocate(true).unwrap()).collect();
        cdb.transfer.begin_write(FilterId(0), ids);
        cdb.transfer.active = true;
        let bytes = cdb.save_state().unwrap();

        let mut target = Cdb::default();
        target.load_state(&bytes).unwrap();

        assert!(target.transfer.active);
        assert_eq!(target.pipeline.in_flight(), 2);
        assert_eq!(target.pipeline.free_count(), 198);
    }
}
