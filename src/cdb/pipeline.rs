//! Pool de tampons de secteurs, partitions et graphe de filtres
//!
//! Les tampons vivent dans une arène et sont chaînés par index. À tout
//! instant un tampon est soit dans la liste libre, soit dans exactement une
//! partition, soit détaché (alloué et en cours d'utilisation par un
//! transfert). `free_count + Σ partition.count + in_flight == buffer_count`.

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::filter::Filter;
use super::sector::RAW_SECTOR_SIZE;

/// Taille du pool de référence
pub const DEFAULT_BUFFER_COUNT: usize = 0xC8;

/// Nombre de partitions
pub const PARTITION_COUNT: usize = 0x18;

/// Nombre de filtres
pub const FILTER_COUNT: usize = 0x18;

/// Valeur brute signifiant « aucune connexion » dans les registres
pub const NO_CONNECTION: u8 = 0xFF;

/// Index d'un tampon dans l'arène
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BufferId(pub u16);

/// Numéro de partition (0..0x17)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionId(pub u8);

/// Numéro de filtre (0..0x17)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FilterId(pub u8);

impl PartitionId {
    pub fn new(raw: u8) -> Option<Self> {
        ((raw as usize) < PARTITION_COUNT).then_some(Self(raw))
    }

    pub fn all() -> impl Iterator<Item = PartitionId> {
        (0..PARTITION_COUNT as u8).map(PartitionId)
    }
}

impl FilterId {
    pub fn new(raw: u8) -> Option<Self> {
        ((raw as usize) < FILTER_COUNT).then_some(Self(raw))
    }

    pub fn all() -> impl Iterator<Item = FilterId> {
        (0..FILTER_COUNT as u8).map(FilterId)
    }
}

/// Encodage registre d'une connexion optionnelle
pub fn conn_raw<T: Into<u8>>(conn: Option<T>) -> u8 {
    conn.map_or(NO_CONNECTION, Into::into)
}

impl From<PartitionId> for u8 {
    fn from(id: PartitionId) -> u8 {
        id.0
    }
}

impl From<FilterId> for u8 {
    fn from(id: FilterId) -> u8 {
        id.0
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error("Aucun tampon libre")]
    NoFreeBuffer,

    #[error("Tampon {0:?} hors du pool")]
    BufferOutOfRange(BufferId),

    #[error("Tampon {0:?} déjà chaîné (libre ou dans une partition)")]
    BufferLinked(BufferId),

    #[error("Tampon {0:?} absent de la partition {1:?}")]
    NotInPartition(BufferId, PartitionId),
}

/// Propriétaire courant d'un tampon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Owner {
    Free,
    Partition(PartitionId),
    Detached,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct SectorBuffer {
    data: Vec<u8>,
    prev: Option<BufferId>,
    next: Option<BufferId>,
    owner: Owner,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
struct Partition {
    first: Option<BufferId>,
    last: Option<BufferId>,
    count: usize,
}

/// Pipeline de routage des secteurs du bloc CD
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pipeline {
    buffers: Vec<SectorBuffer>,
    first_free: Option<BufferId>,
    free_count: usize,
    partitions: Vec<Partition>,
    filters: Vec<Filter>,
    cd_device_conn: Option<FilterId>,
}

impl Pipeline {
    /// Crée un pipeline de `buffer_count` tampons, tous libres
    pub fn new(buffer_count: usize) -> Self {
        let buffer_count = buffer_count.clamp(1, u16::MAX as usize);
        let mut pipeline = Self {
            buffers: vec![
                SectorBuffer {
                    data: vec![0; RAW_SECTOR_SIZE],
                    prev: None,
                    next: None,
                    owner: Owner::Free,
                };
                buffer_count
            ],
            first_free: None,
            free_count: 0,
            partitions: vec![Partition::default(); PARTITION_COUNT],
            filters: FilterId::all().map(Filter::new).collect(),
            cd_device_conn: None,
        };
        pipeline.reset_buffers();
        pipeline
    }

    /// Remet tous les tampons dans la liste libre et vide les partitions
    pub fn reset_buffers(&mut self) {
        let n = self.buffers.len();

        for (i, buf) in self.buffers.iter_mut().enumerate() {
            buf.prev = i.checked_sub(1).map(|p| BufferId(p as u16));
            buf.next = (i + 1 < n).then(|| BufferId((i + 1) as u16));
            buf.owner = Owner::Free;
        }

        self.first_free = Some(BufferId(0));
        self.free_count = n;

        for p in &mut self.partitions {
            *p = Partition::default();
        }
    }

    /// Réinitialisation logicielle : filtres au repos, tampons libérés
    pub fn reset(&mut self) {
        self.cd_device_conn = None;

        for (i, f) in self.filters.iter_mut().enumerate() {
            *f = Filter::new(FilterId(i as u8));
        }

        self.reset_buffers();
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn free_count(&self) -> usize {
        self.free_count
    }

    pub fn partition_count(&self, partition: PartitionId) -> usize {
        self.partitions[partition.0 as usize].count
    }

    /// Tampons alloués mais rattachés à aucune liste
    pub fn in_flight(&self) -> usize {
        self.buffers.iter().filter(|b| b.owner == Owner::Detached).count()
    }

    /// Identifiants des tampons hors de toute liste
    pub fn detached(&self) -> impl Iterator<Item = BufferId> + '_ {
        self.buffers
            .iter()
            .enumerate()
            .filter(|(_, b)| b.owner == Owner::Detached)
            .map(|(i, _)| BufferId(i as u16))
    }

    pub fn owner(&self, id: BufferId) -> Option<Owner> {
        self.buffers.get(id.0 as usize).map(|b| b.owner)
    }

    /// Vérifie l'équation de conservation du pool
    pub fn check_conservation(&self) -> bool {
        let linked: usize = self.partitions.iter().map(|p| p.count).sum();
        self.free_count + linked + self.in_flight() == self.buffers.len()
    }

    /// Retire un tampon de la liste libre
    pub fn allocate(&mut self, zero_fill: bool) -> Result<BufferId, PipelineError> {
        let id = self.first_free.ok_or(PipelineError::NoFreeBuffer)?;
        let (prev, next) = {
            let buf = &self.buffers[id.0 as usize];
            (buf.prev, buf.next)
        };

        match prev {
            None => self.first_free = next,
            Some(p) => self.buffers[p.0 as usize].next = next,
        }
        if let Some(n) = next {
            self.buffers[n.0 as usize].prev = prev;
        }

        self.free_count -= 1;

        let buf = &mut self.buffers[id.0 as usize];
        if zero_fill {
            buf.data.fill(0);
        }
        buf.prev = None;
        buf.next = None;
        buf.owner = Owner::Detached;

        Ok(id)
    }

    /// Rend un tampon détaché à la tête de la liste libre
    ///
    /// Les données ne sont pas effacées : un transfert peut encore les lire.
    pub fn free(&mut self, id: BufferId) -> Result<(), PipelineError> {
        self.expect_detached(id)?;

        let old_first = self.first_free;
        {
            let buf = &mut self.buffers[id.0 as usize];
            buf.prev = None;
            buf.next = old_first;
            buf.owner = Owner::Free;
        }
        if let Some(f) = old_first {
            self.buffers[f.0 as usize].prev = Some(id);
        }

        self.first_free = Some(id);
        self.free_count += 1;
        Ok(())
    }

    /// Ajoute un tampon détaché en queue de partition
    pub fn link(&mut self, partition: PartitionId, id: BufferId) -> Result<(), PipelineError> {
        self.expect_detached(id)?;

        let p = &mut self.partitions[partition.0 as usize];
        let last = p.last;

        match last {
            None => p.first = Some(id),
            Some(l) => self.buffers[l.0 as usize].next = Some(id),
        }
        p.last = Some(id);
        p.count += 1;

        let buf = &mut self.buffers[id.0 as usize];
        buf.prev = last;
        buf.next = None;
        buf.owner = Owner::Partition(partition);
        Ok(())
    }

    /// Retire un tampon de sa partition ; il devient détaché
    pub fn unlink(&mut self, partition: PartitionId, id: BufferId) -> Result<(), PipelineError> {
        let buf = self
            .buffers
            .get(id.0 as usize)
            .ok_or(PipelineError::BufferOutOfRange(id))?;

        if buf.owner != Owner::Partition(partition) {
            return Err(PipelineError::NotInPartition(id, partition));
        }

        let (prev, next) = (buf.prev, buf.next);
        let p = &mut self.partitions[partition.0 as usize];
        p.count -= 1;

        match prev {
            None => p.first = next,
            Some(pv) => self.buffers[pv.0 as usize].next = next,
        }
        match next {
            None => p.last = prev,
            Some(nx) => self.buffers[nx.0 as usize].prev = prev,
        }

        let buf = &mut self.buffers[id.0 as usize];
        buf.prev = None;
        buf.next = None;
        buf.owner = Owner::Detached;
        Ok(())
    }

    /// Libère tous les tampons d'une partition
    pub fn clear(&mut self, partition: PartitionId) {
        while let Some(first) = self.partitions[partition.0 as usize].first {
            if self.unlink(partition, first).and_then(|_| self.free(first)).is_err() {
                warn!("[CDB] Chaînage incohérent dans la partition {:?}, tampons réinitialisés", partition);
                self.reset_buffers();
                return;
            }
        }
    }

    /// `index`-ième tampon d'une partition
    pub fn buffer_at(&self, partition: PartitionId, index: usize) -> Option<BufferId> {
        self.iter_partition(partition).nth(index)
    }

    pub fn first_buffer(&self, partition: PartitionId) -> Option<BufferId> {
        self.partitions[partition.0 as usize].first
    }

    pub fn last_buffer(&self, partition: PartitionId) -> Option<BufferId> {
        self.partitions[partition.0 as usize].last
    }

    /// Successeur d'un tampon dans sa liste
    pub fn next_of(&self, id: BufferId) -> Option<BufferId> {
        self.buffers.get(id.0 as usize).and_then(|b| b.next)
    }

    pub fn iter_partition(&self, partition: PartitionId) -> impl Iterator<Item = BufferId> + '_ {
        let limit = self.partitions[partition.0 as usize].count;
        std::iter::successors(self.partitions[partition.0 as usize].first, move |id| self.next_of(*id)).take(limit)
    }

    pub fn data(&self, id: BufferId) -> &[u8] {
        &self.buffers[id.0 as usize].data
    }

    pub fn data_mut(&mut self, id: BufferId) -> &mut [u8] {
        &mut self.buffers[id.0 as usize].data
    }

    /// Fait parcourir le graphe de filtres à un tampon détaché
    ///
    /// Retourne le filtre qui l'a accepté ; `None` si le tampon a été
    /// rejeté et libéré. Le parcours est borné par le nombre de filtres et
    /// un cycle provoque un rejet.
    pub fn route(&mut self, entry: Option<FilterId>, id: BufferId) -> Option<FilterId> {
        let mut cur = entry;
        let mut visited = 0u32;

        for _ in 0..FILTER_COUNT {
            let Some(fid) = cur else {
                break;
            };

            if visited & (1 << fid.0) != 0 {
                warn!("[CDB] Cycle dans le graphe de filtres au filtre {:?}, secteur rejeté", fid);
                break;
            }
            visited |= 1 << fid.0;

            let (matched, true_conn, false_conn) = {
                let filter = &self.filters[fid.0 as usize];
                (filter.matches(&self.buffers[id.0 as usize].data), filter.true_conn, filter.false_conn)
            };

            if matched {
                match true_conn {
                    Some(partition) => {
                        return match self.link(partition, id) {
                            Ok(()) => Some(fid),
                            Err(e) => {
                                warn!("[CDB] Routage impossible: {}", e);
                                None
                            }
                        };
                    }
                    None => break,
                }
            }

            cur = false_conn;
        }

        debug!("[CDB] Secteur rejeté par le filtre d'entrée {:?}", entry);
        if let Err(e) = self.free(id) {
            warn!("[CDB] Rejet impossible: {}", e);
        }
        None
    }

    pub fn filter(&self, id: FilterId) -> &Filter {
        &self.filters[id.0 as usize]
    }

    pub fn filter_mut(&mut self, id: FilterId) -> &mut Filter {
        &mut self.filters[id.0 as usize]
    }

    pub fn cd_device_conn(&self) -> Option<FilterId> {
        self.cd_device_conn
    }

    /// Connecte le lecteur à un filtre ; ce filtre perd ses autres entrées
    pub fn set_cd_device_conn(&mut self, target: Option<FilterId>) {
        if target.is_some() {
            for f in &mut self.filters {
                if f.false_conn == target {
                    f.false_conn = None;
                }
            }
        }

        self.cd_device_conn = target;
    }

    pub fn set_range(&mut self, id: FilterId, fad: u32, range: u32) {
        let f = &mut self.filters[id.0 as usize];
        f.fad = fad;
        f.range = range;
    }

    pub fn set_true_conn(&mut self, id: FilterId, partition: Option<PartitionId>) {
        self.filters[id.0 as usize].true_conn = partition;
    }

    pub fn set_false_conn(&mut self, id: FilterId, next: Option<FilterId>) {
        self.disconnect_input(next);
        self.filters[id.0 as usize].false_conn = next;
    }

    /// Détache toutes les entrées d'un filtre (lecteur et autres filtres)
    pub fn disconnect_input(&mut self, target: Option<FilterId>) {
        let Some(target) = target else {
            return;
        };

        if self.cd_device_conn == Some(target) {
            warn!("[CDB] Entrée du filtre 0x{:02x} déconnectée du lecteur par effet de bord", target.0);
            self.cd_device_conn = None;
        }

        for (i, f) in self.filters.iter_mut().enumerate() {
            if f.false_conn == Some(target) {
                warn!(
                    "[CDB] Entrée du filtre 0x{:02x} déconnectée de la sortie du filtre 0x{:02x} par effet de bord",
                    target.0, i
                );
                f.false_conn = None;
            }
        }
    }

    /// Contrôle la cohérence après chargement d'une sauvegarde
    ///
    /// Retourne `true` si le chaînage a dû être réinitialisé.
    pub fn sanitize(&mut self) -> bool {
        if self.filters.len() != FILTER_COUNT {
            warn!("[CDB] Table de filtres invalide dans la sauvegarde");
            self.filters = FilterId::all().map(Filter::new).collect();
        }

        for f in &mut self.filters {
            if f.true_conn.is_some_and(|p| p.0 as usize >= PARTITION_COUNT) {
                f.true_conn = None;
            }
            if f.false_conn.is_some_and(|n| n.0 as usize >= FILTER_COUNT) {
                f.false_conn = None;
            }
        }

        if self.cd_device_conn.is_some_and(|c| c.0 as usize >= FILTER_COUNT) {
            self.cd_device_conn = None;
        }

        if self.buffers.is_empty() {
            warn!("[CDB] Pool de tampons vide dans la sauvegarde, recréé");
            self.buffers = Self::new(DEFAULT_BUFFER_COUNT).buffers;
        }

        for buf in &mut self.buffers {
            buf.data.resize(RAW_SECTOR_SIZE, 0);
        }

        if self.linkage_is_valid() {
            return false;
        }

        warn!("[CDB] Chaînage des tampons invalide dans la sauvegarde, pool réinitialisé");
        self.partitions = vec![Partition::default(); PARTITION_COUNT];
        self.reset_buffers();
        true
    }

    fn expect_detached(&self, id: BufferId) -> Result<(), PipelineError> {
        match self.buffers.get(id.0 as usize) {
            None => Err(PipelineError::BufferOutOfRange(id)),
            Some(buf) if buf.owner != Owner::Detached => Err(PipelineError::BufferLinked(id)),
            Some(_) => Ok(()),
        }
    }

    fn linkage_is_valid(&self) -> bool {
        let n = self.buffers.len();
        let in_range = |id: Option<BufferId>| id.map_or(true, |b| (b.0 as usize) < n);

        if self.partitions.len() != PARTITION_COUNT {
            return false;
        }

        if !in_range(self.first_free)
            || self.partitions.iter().any(|p| !in_range(p.first) || !in_range(p.last))
            || self.buffers.iter().any(|b| !in_range(b.prev) || !in_range(b.next))
        {
            return false;
        }

        let mut seen = vec![false; n];
        let free_ok = self.walk(self.first_free, Owner::Free, self.free_count, None, &mut seen);
        let parts_ok = self.partitions.iter().enumerate().all(|(i, p)| {
            let owner = Owner::Partition(PartitionId(i as u8));
            self.walk(p.first, owner, p.count, Some(p.last), &mut seen)
        });

        free_ok
            && parts_ok
            && self
                .buffers
                .iter()
                .zip(&seen)
                .all(|(b, &s)| s != (b.owner == Owner::Detached))
    }

    /// Parcourt une liste en vérifiant liens arrière, propriétaire et longueur
    fn walk(
        &self,
        first: Option<BufferId>,
        owner: Owner,
        count: usize,
        last: Option<Option<BufferId>>,
        seen: &mut [bool],
    ) -> bool {
        let mut prev = None;
        let mut cur = first;
        let mut len = 0;

        while let Some(id) = cur {
            let i = id.0 as usize;
            let buf = &self.buffers[i];

            if seen[i] || buf.owner != owner || buf.prev != prev || len >= count {
                return false;
            }

            seen[i] = true;
            len += 1;
            prev = cur;
            cur = buf.next;
        }

        len == count && last.map_or(true, |l| l == prev)
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_COUNT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdb::filter::FilterMode;
    use crate::cdb::sector::fad_to_bcd_msf;

    #[test]
    fn test_allocate_until_empty() {
        let mut pipeline = Pipeline::new(4);

        for _ in 0..4 {
            assert!(pipeline.allocate(false).is_ok());
        }

        assert_eq!(pipeline.allocate(false), Err(PipelineError::NoFreeBuffer));
        assert_eq!(pipeline.in_flight(), 4);
        assert!(pipeline.check_conservation());
    }

    /// Pool par défaut : 200 allocations, la 201e échoue
    #[test]
    fn test_default_pool_exhaustion() {
        let mut pipeline = Pipeline::default();
        assert_eq!(pipeline.buffer_count(), 200);

        for _ in 0..200 {
            assert!(pipeline.allocate(true).is_ok());
        }

        assert_eq!(pipeline.allocate(true), Err(PipelineError::NoFreeBuffer));
        assert_eq!(pipeline.free_count(), 0);
        assert_eq!(pipeline.detached().count(), 200);
    }

    #[test]
    fn test_link_unlink_middle() {
        let mut pipeline = Pipeline::new(8);
        let p = PartitionId(3);
        let ids: Vec<_> = (0..3).map(|_| pipeline.allocate(false).unwrap()).collect();
        for &id in &ids {
            pipeline.link(p, id).unwrap();
        }

        pipeline.unlink(p, ids[1]).unwrap();

        assert_eq!(pipeline.partition_count(p), 2);
        assert_eq!(pipeline.iter_partition(p).collect::<Vec<_>>(), vec![ids[0], ids[2]]);
        assert_eq!(pipeline.last_buffer(p), Some(ids[2]));
        assert_eq!(pipeline.link(p, ids[0]), Err(PipelineError::BufferLinked(ids[0])));
    }

    #[test]
    fn test_free_requires_detached() {
        let mut pipeline = Pipeline::new(2);
        let id = pipeline.allocate(false).unwrap();
        pipeline.link(PartitionId(0), id).unwrap();

        assert_eq!(pipeline.free(id), Err(PipelineError::BufferLinked(id)));
        assert_eq!(
            pipeline.unlink(PartitionId(1), id),
            Err(PipelineError::NotInPartition(id, PartitionId(1)))
        );
    }

    #[test]
    fn test_route_false_chain() {
        let mut pipeline = Pipeline::new(4);
        let id = pipeline.allocate(true).unwrap();
        pipeline.data_mut(id)[12..15].copy_from_slice(&fad_to_bcd_msf(500));

        pipeline.filter_mut(FilterId(0)).mode = FilterMode::FAD_RANGE;
        pipeline.set_range(FilterId(0), 0, 100);
        pipeline.set_false_conn(FilterId(0), Some(FilterId(5)));

        assert_eq!(pipeline.route(Some(FilterId(0)), id), Some(FilterId(5)));
        assert_eq!(pipeline.partition_count(PartitionId(5)), 1);
    }

    #[test]
    fn test_sanitize_detects_out_of_range_link() {
        let mut pipeline = Pipeline::new(4);
        let id = pipeline.allocate(false).unwrap();
        pipeline.link(PartitionId(2), id).unwrap();
        pipeline.partitions[2].last = Some(BufferId(77));

        assert!(pipeline.sanitize());
        assert_eq!(pipeline.free_count(), 4);
        assert_eq!(pipeline.partition_count(PartitionId(2)), 0);
    }
}
