#![cfg(target_os = "linux")]
use std::time::{Duration, Instant};

use tier_watch::{MonitorOptions, PressureMonitor};
use tiered_shm::{
    Level, LocalSegmentOptions, PoolOptions, PooledMemory, StoreConfig, Tier, TieredStore,
    Watermark,
};

#[test]
fn mapping_bursts_move_new_objects_to_the_pool() {
    let mount = tempfile::tempdir().unwrap();
    let mut local = LocalSegmentOptions::new(mount.path(), "password");
    local.capacity = 1 << 12;
    local.max_objects = 16;

    let pool_id = std::process::id();
    let _ = PooledMemory::remove(pool_id);

    let config = StoreConfig {
        local,
        pool: PoolOptions {
            capacity: 1 << 16,
            pool_id,
            max_objects: 64,
        },
    };

    let watermark = Watermark::new(Level::Low);
    let store = TieredStore::open(&config, watermark.clone()).unwrap();
    let mut monitor = PressureMonitor::new(
        watermark,
        MonitorOptions {
            window: Duration::from_secs(1),
            high_threshold: 10,
            low_threshold: 2,
        },
    )
    .unwrap();

    let start = Instant::now();
    store.put(1, b"calm").unwrap();
    assert_eq!(store.get(1).unwrap().tier(), Tier::LocalSegment);

    monitor.record(start, 12);
    assert_eq!(monitor.evaluate(start), Level::High);

    store.put(2, b"busy").unwrap();
    assert_eq!(store.get(2).unwrap().tier(), Tier::PooledMemory);

    assert_eq!(monitor.evaluate(start + Duration::from_secs(2)), Level::Low);
    assert_eq!(store.get(1).unwrap().tier(), Tier::LocalSegment);

    PooledMemory::remove(pool_id).unwrap();
}
