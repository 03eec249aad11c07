//! Lowres pyramid behaviour through storage

use std::sync::Arc;
use std::time::Duration;

use earth_mapper::compression::Compression;
use earth_mapper::lowres::{Color, LowresConfig, LowresTileManager, Sample};
use earth_mapper::storage::{FileStorage, MapStorage, Storage};

fn map(dir: &std::path::Path) -> MapStorage {
    Storage::new(Arc::new(FileStorage::new(dir, Compression::Gzip))).map("world")
}

fn config() -> LowresConfig {
    LowresConfig {
        tile_size: 16,
        lod_count: 3,
        lod_factor: 2,
        ..Default::default()
    }
}

fn point_sample(x: i32, z: i32) -> Sample {
    let shade = ((x * 7 + z * 3).rem_euclid(256)) as u8;
    Sample::new(x * 100 + z, (x + z).rem_euclid(16) as u8, Color::from_rgba8([shade, 255 - shade, 40, 255]))
}

#[test]
fn uniform_tile_is_a_fixed_point_of_averaging() {
    let dir = tempfile::tempdir().expect("temp dir");
    let map = map(dir.path());
    let manager = LowresTileManager::new(&map, config()).expect("pyramid");

    let red = Sample::new(64, 10, Color::premultiplied(1.0, 0.0, 0.0, 1.0));
    for z in 0..16 {
        for x in 0..16 {
            manager.update(x, z, &red);
        }
    }
    manager.save();

    let lod2 = manager.layer(2).expect("lod 2");
    for z in 0..8 {
        for x in 0..8 {
            assert_eq!(lod2.get(x, z), red, "lod 2 point {},{}", x, z);
        }
    }
    let lod3 = manager.layer(3).expect("lod 3");
    for z in 0..4 {
        for x in 0..4 {
            assert_eq!(lod3.get(x, z), red, "lod 3 point {},{}", x, z);
        }
    }

    // And the same comes back from storage
    let reloaded = LowresTileManager::new(&map, config()).expect("pyramid");
    assert_eq!(reloaded.layer(1).expect("lod 1").get(15, 15), red);
    assert_eq!(reloaded.layer(3).expect("lod 3").get(3, 0), red);
}

#[test]
fn neighbouring_tiles_agree_on_their_shared_edge() {
    let dir = tempfile::tempdir().expect("temp dir");
    let manager = LowresTileManager::new(&map(dir.path()), config()).expect("pyramid");

    for z in 0..48 {
        for x in 0..48 {
            manager.update(x, z, &point_sample(x, z));
        }
    }
    manager.save();

    let lod1 = manager.layer(1).expect("lod 1");
    for i in 0..16 {
        assert_eq!(lod1.tile(0, 0).get(16, i), lod1.tile(1, 0).get(0, i), "right edge {}", i);
        assert_eq!(lod1.tile(0, 0).get(i, 16), lod1.tile(0, 1).get(i, 0), "bottom edge {}", i);
        assert_eq!(lod1.tile(1, 1).get(16, i), lod1.tile(2, 1).get(0, i), "inner edge {}", i);
    }
    assert_eq!(lod1.tile(0, 0).get(16, 16), lod1.tile(1, 1).get(0, 0));

    // Averaged levels carry the seam as well
    let lod2 = manager.layer(2).expect("lod 2");
    for i in 0..16 {
        assert_eq!(lod2.tile(0, 0).get(16, i), lod2.tile(1, 0).get(0, i), "lod 2 edge {}", i);
    }
}

#[test]
fn averaging_uses_the_whole_group() {
    let dir = tempfile::tempdir().expect("temp dir");
    let manager = LowresTileManager::new(&map(dir.path()), config()).expect("pyramid");

    for z in 0..16 {
        for x in 0..16 {
            manager.update(x, z, &point_sample(x, z));
        }
    }
    manager.save();

    let lod1 = manager.layer(1).expect("lod 1");
    let lod2 = manager.layer(2).expect("lod 2");
    for (x, z) in [(0, 0), (3, 5), (7, 7)] {
        let group: Vec<Sample> = [(0, 0), (1, 0), (0, 1), (1, 1)]
            .iter()
            .map(|(dx, dz)| lod1.get(x * 2 + dx, z * 2 + dz))
            .collect();
        let expected = Sample::average(&group);
        let actual = lod2.get(x, z);
        assert_eq!(actual.height, expected.height);
        assert_eq!(actual.block_light, expected.block_light);
        assert_eq!(actual.color.to_rgba8(), expected.color.to_rgba8());
    }
}

#[test]
fn housekeeping_bounds_the_cache_and_writes_everything_back() {
    let dir = tempfile::tempdir().expect("temp dir");
    let map = map(dir.path());
    let bounded = LowresConfig {
        lod_count: 2,
        cache_capacity: 4,
        max_resident_tiles: 2,
        save_interval: Duration::ZERO,
        ..config()
    };
    let manager = LowresTileManager::new(&map, bounded).expect("pyramid");

    // One interior point in each of six tiles
    for tile_x in 0..6 {
        manager.update(tile_x * 16 + 5, 5, &point_sample(tile_x, 0));
    }
    let lod1 = manager.layer(1).expect("lod 1");
    assert!(lod1.resident_tiles() <= 4);

    manager.housekeeping();
    assert!(lod1.resident_tiles() <= 2);
    assert!(manager.layer(2).expect("lod 2").resident_tiles() <= 2);

    let lowres = map.lowres_tiles(1);
    for tile_x in 0..6 {
        assert!(lowres.exists(tile_x, 0).expect("exists"), "tile {} was not written", tile_x);
    }
    assert!(map.lowres_tiles(2).exists(0, 0).expect("exists"));

    let reloaded = LowresTileManager::new(&map, config()).expect("pyramid");
    assert_eq!(reloaded.layer(1).expect("lod 1").get(4 * 16 + 5, 5), point_sample(4, 0));
}

#[test]
fn held_tile_keeps_its_identity_across_eviction() {
    let dir = tempfile::tempdir().expect("temp dir");
    let untrimmed = LowresConfig {
        max_resident_tiles: 0,
        ..config()
    };
    let manager = LowresTileManager::new(&map(dir.path()), untrimmed).expect("pyramid");
    let lod1 = manager.layer(1).expect("lod 1");

    let held = lod1.tile(3, 3);
    manager.housekeeping();
    assert_eq!(lod1.resident_tiles(), 0);

    manager.update(3 * 16 + 1, 3 * 16 + 1, &point_sample(1, 1));
    assert!(Arc::ptr_eq(&held, &lod1.tile(3, 3)));
    assert!(held.is_dirty());
}
