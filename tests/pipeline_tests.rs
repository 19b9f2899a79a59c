//! Tests du pipeline de tampons, partitions et filtres

use pixel_saturn_rust::cdb::pipeline::{Owner, FILTER_COUNT, PARTITION_COUNT};
use pixel_saturn_rust::cdb::sector::fad_to_bcd_msf;
use pixel_saturn_rust::cdb::{BufferId, FilterId, FilterMode, PartitionId, Pipeline};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn sector_at(pipeline: &mut Pipeline, fad: u32) -> BufferId {
    let id = pipeline.allocate(true).unwrap();
    pipeline.data_mut(id)[12..15].copy_from_slice(&fad_to_bcd_msf(fad));
    pipeline.data_mut(id)[15] = 1;
    id
}

/// Les tampons restent comptés une et une seule fois quoi qu'il arrive
#[test]
fn test_random_operations_conserve_buffers() {
    let mut rng = StdRng::seed_from_u64(0x5A7E);
    let mut pipeline = Pipeline::new(32);
    let mut detached: Vec<BufferId> = Vec::new();

    for _ in 0..5000 {
        match rng.gen_range(0..6) {
            0 => {
                if let Ok(id) = pipeline.allocate(rng.gen_bool(0.5)) {
                    detached.push(id);
                }
            }
            1 => {
                if let Some(id) = detached.pop() {
                    pipeline.free(id).unwrap();
                }
            }
            2 => {
                if let Some(id) = detached.pop() {
                    let p = PartitionId(rng.gen_range(0..PARTITION_COUNT as u8));
                    pipeline.link(p, id).unwrap();
                }
            }
            3 => {
                let p = PartitionId(rng.gen_range(0..PARTITION_COUNT as u8));
                let count = pipeline.partition_count(p);
                if count > 0 {
                    let id = pipeline.buffer_at(p, rng.gen_range(0..count)).unwrap();
                    pipeline.unlink(p, id).unwrap();
                    detached.push(id);
                }
            }
            4 => {
                pipeline.clear(PartitionId(rng.gen_range(0..PARTITION_COUNT as u8)));
            }
            _ => {
                if let Some(id) = detached.pop() {
                    let entry = FilterId(rng.gen_range(0..FILTER_COUNT as u8));
                    pipeline.route(Some(entry), id);
                }
            }
        }

        assert!(pipeline.check_conservation());
        assert_eq!(pipeline.in_flight(), detached.len());
    }
}

/// Les partitions conservent l'ordre d'arrivée
#[test]
fn test_partition_is_fifo() {
    let mut pipeline = Pipeline::new(8);
    let p = PartitionId(4);

    let ids: Vec<_> = (0..5).map(|i| sector_at(&mut pipeline, 150 + i)).collect();
    for &id in &ids {
        pipeline.link(p, id).unwrap();
    }

    assert_eq!(pipeline.iter_partition(p).collect::<Vec<_>>(), ids);
    assert_eq!(pipeline.first_buffer(p), Some(ids[0]));
    assert_eq!(pipeline.buffer_at(p, 3), Some(ids[3]));
    assert_eq!(pipeline.buffer_at(p, 5), None);

    pipeline.clear(p);
    assert_eq!(pipeline.partition_count(p), 0);
    assert_eq!(pipeline.free_count(), 8);
    assert_eq!(pipeline.owner(ids[2]), Some(Owner::Free));
}

/// Un filtre sans sortie « faux » rejette et libère le secteur
#[test]
fn test_rejected_sector_is_freed() {
    let mut pipeline = Pipeline::new(4);
    let id = sector_at(&mut pipeline, 1000);

    pipeline.filter_mut(FilterId(2)).mode = FilterMode::FAD_RANGE;
    pipeline.set_range(FilterId(2), 150, 10);

    assert_eq!(pipeline.route(Some(FilterId(2)), id), None);
    assert_eq!(pipeline.free_count(), 4);
    assert!(pipeline.check_conservation());
}

/// Un cycle dans le graphe de filtres termine le parcours
#[test]
fn test_routing_cycle_is_discarded() {
    let mut pipeline = Pipeline::new(4);

    for f in [FilterId(0), FilterId(1)] {
        pipeline.filter_mut(f).mode = FilterMode::FAD_RANGE;
        pipeline.set_range(f, 0, 1);
    }
    pipeline.set_false_conn(FilterId(0), Some(FilterId(1)));
    pipeline.set_false_conn(FilterId(1), Some(FilterId(0)));
    assert_eq!(pipeline.filter(FilterId(0)).false_conn, Some(FilterId(1)));

    let id = sector_at(&mut pipeline, 300);
    assert_eq!(pipeline.route(Some(FilterId(0)), id), None);
    assert_eq!(pipeline.free_count(), 4);
}

/// Brancher le lecteur sur un filtre détache ses autres entrées
#[test]
fn test_single_input_per_filter() {
    let mut pipeline = Pipeline::new(4);
    pipeline.set_false_conn(FilterId(3), Some(FilterId(7)));

    pipeline.set_cd_device_conn(Some(FilterId(7)));
    assert_eq!(pipeline.cd_device_conn(), Some(FilterId(7)));
    assert_eq!(pipeline.filter(FilterId(3)).false_conn, None);

    // Et inversement
    pipeline.set_false_conn(FilterId(5), Some(FilterId(7)));
    assert_eq!(pipeline.cd_device_conn(), None);
    assert_eq!(pipeline.filter(FilterId(5)).false_conn, Some(FilterId(7)));
}

#[test]
fn test_subheader_filter_routes_by_file() {
    let mut pipeline = Pipeline::new(4);
    let f = FilterId(6);
    pipeline.filter_mut(f).mode = FilterMode::FILE;
    pipeline.filter_mut(f).file = 3;
    pipeline.set_false_conn(f, Some(FilterId(9)));

    let id = pipeline.allocate(true).unwrap();
    {
        let data = pipeline.data_mut(id);
        data[15] = 2;
        data[16] = 3;
    }
    assert_eq!(pipeline.route(Some(f), id), Some(f));
    assert_eq!(pipeline.partition_count(PartitionId(6)), 1);

    let other = pipeline.allocate(true).unwrap();
    {
        let data = pipeline.data_mut(other);
        data[15] = 2;
        data[16] = 4;
    }
    assert_eq!(pipeline.route(Some(f), other), Some(FilterId(9)));
    assert_eq!(pipeline.partition_count(PartitionId(9)), 1);
}

/// Une partition pleine n'empêche pas la réinitialisation complète
#[test]
fn test_reset_restores_defaults() {
    let mut pipeline = Pipeline::new(3);
    for fad in 150..153 {
        let id = sector_at(&mut pipeline, fad);
        pipeline.link(PartitionId(0), id).unwrap();
    }
    pipeline.set_true_conn(FilterId(0), None);
    pipeline.set_cd_device_conn(Some(FilterId(0)));

    pipeline.reset();

    assert_eq!(pipeline.free_count(), 3);
    assert_eq!(pipeline.cd_device_conn(), None);
    assert_eq!(pipeline.filter(FilterId(0)).true_conn, Some(PartitionId(0)));
    assert!(!pipeline.sanitize());
}
