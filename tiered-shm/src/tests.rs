use crate::region::{extent_len, Layout, Record, Region};
use crate::{OpenError, Tier, TierError};

use core::sync::atomic::{AtomicU32, Ordering};

use memfile::MemFile;
use memmap2::MmapRaw;

const DIGEST: [u64; 4] = [1, 2, 3, 4];
/// Byte offset of the lock word in the head page.
const LOCK_WORD: usize = 16;

struct Fixture {
    file: MemFile,
    layout: Layout,
}

impl Fixture {
    fn new(capacity: usize, slots: usize) -> Self {
        let layout = Layout::new(capacity, slots).expect("a valid layout");
        let file =
            MemFile::create_default(env!("CARGO_PKG_NAME")).expect("to create a memory file");
        file.set_len(layout.total_len() as u64).unwrap();
        Fixture { file, layout }
    }

    fn attach(&self) -> Region {
        self.attach_with(self.layout, &DIGEST).unwrap()
    }

    fn attach_with(&self, layout: Layout, digest: &[u64; 4]) -> Result<Region, OpenError> {
        let map = MmapRaw::map_raw(&self.file).unwrap();
        Region::attach(map, layout, Tier::LocalSegment, digest)
    }

    /// Access the lock word through a mapping of our own, as another process would.
    fn with_lock_word<T>(&self, f: impl FnOnce(&AtomicU32) -> T) -> T {
        let map = MmapRaw::map_raw(&self.file).unwrap();
        let word = unsafe { &*(map.as_ptr().add(LOCK_WORD) as *const AtomicU32) };
        f(word)
    }
}

fn sorted_records(region: &Region) -> Vec<Record> {
    let mut records: Vec<_> = region.records().collect();
    records.sort_by_key(|record| record.offset);
    records
}

#[test]
fn layout_places_data_after_the_table() {
    let layout = Layout::new(1024, 4).unwrap();
    assert_eq!(layout.total_len(), Layout::HEAD_SZ + 4 * 32 + 1024);

    // 4096 + 3 * 32 is padded to the next multiple of 64.
    let layout = Layout::new(0, 3).unwrap();
    assert_eq!(layout.total_len(), Layout::HEAD_SZ + 128);

    assert!(matches!(Layout::new(1024, 0), Err(OpenError::BadLayout { .. })));
    assert!(matches!(Layout::new(usize::MAX, 1), Err(OpenError::BadLayout { .. })));
}

#[test]
fn capacity_is_rounded_to_whole_extents() {
    let layout = Layout::new(100, 4).unwrap();
    assert_eq!(layout.capacity(), 104);

    let fixture = Fixture::new(100, 4);
    let region = fixture.attach();

    region.put(1, &[7; 100]).unwrap();
    let view = region.get(1).unwrap();
    assert_eq!(unsafe { view.as_slice() }, &[7u8; 100]);

    let err = region.put(2, &[8; 5]).unwrap_err();
    assert!(matches!(err, TierError::CapacityExceeded { requested: 5, .. }));
}

#[test]
fn extents_are_aligned_and_never_empty() {
    assert_eq!(extent_len(0), Some(8));
    assert_eq!(extent_len(1), Some(8));
    assert_eq!(extent_len(8), Some(8));
    assert_eq!(extent_len(9), Some(16));
    assert_eq!(extent_len(usize::MAX), None);
}

#[test]
fn first_fit_reuses_released_gaps() {
    let fixture = Fixture::new(64, 8);
    let region = fixture.attach();

    region.put(1, &[1; 16]).unwrap();
    region.put(2, &[2; 16]).unwrap();
    region.put(3, &[3; 16]).unwrap();

    let second = region.get(2).unwrap();
    assert_eq!(second.len(), 16);
    region.release(second.as_ptr()).unwrap();

    // Fits exactly into the gap left by object 2.
    region.put(4, &[4; 10]).unwrap();

    let records = sorted_records(&region);
    let offsets: Vec<_> = records.iter().map(|r| (r.id, r.offset)).collect();
    assert_eq!(offsets, [(1, 0), (4, 16), (3, 32)]);

    let fourth = region.get(4).unwrap();
    assert_eq!(unsafe { fourth.as_slice() }, &[4u8; 10]);
}

#[test]
fn capacity_is_contiguous() {
    let fixture = Fixture::new(48, 8);
    let region = fixture.attach();

    region.put(1, &[1; 16]).unwrap();
    region.put(2, &[2; 16]).unwrap();
    region.put(3, &[3; 16]).unwrap();

    let middle = region.get(2).unwrap().as_ptr();
    region.release(middle).unwrap();

    // 16 bytes are free in total, but not 24 in one piece.
    let err = region.put(4, &[4; 24]).unwrap_err();
    assert!(matches!(err, TierError::CapacityExceeded { requested: 24, .. }));

    let stats = region.stats();
    assert_eq!((stats.objects, stats.used, stats.capacity), (2, 32, 48));
}

#[test]
fn record_table_limits_objects() {
    let fixture = Fixture::new(1024, 2);
    let region = fixture.attach();

    region.put(1, b"a").unwrap();
    region.put(2, b"b").unwrap();

    let err = region.put(3, b"c").unwrap_err();
    assert!(matches!(err, TierError::CapacityExceeded { requested: 1, .. }));
}

#[test]
fn empty_objects_have_distinct_addresses() {
    let fixture = Fixture::new(64, 4);
    let region = fixture.attach();

    region.put(1, b"").unwrap();
    region.put(2, b"").unwrap();

    let first = region.get(1).unwrap();
    let second = region.get(2).unwrap();
    assert!(first.is_empty());
    assert_ne!(first.as_ptr(), second.as_ptr());

    region.release(first.as_ptr()).unwrap();
    assert!(region.get(1).is_err());
    assert!(region.get(2).is_ok());
}

#[test]
fn release_validates_the_pointer() {
    let fixture = Fixture::new(64, 4);
    let region = fixture.attach();

    region.put(7, b"payload").unwrap();
    let view = region.get(7).unwrap();
    let ptr = view.as_ptr();

    // Inside the data area but not the start of a record.
    let inner = ptr.wrapping_add(1);
    assert!(matches!(region.release(inner), Err(TierError::InvalidPointer { .. })));

    let outside = b"elsewhere".as_ptr();
    assert!(!region.contains(outside));
    assert!(matches!(region.release(outside), Err(TierError::InvalidPointer { .. })));

    region.release(ptr).unwrap();
    // Double release is detected.
    let err = region.release(ptr).unwrap_err();
    assert!(matches!(err, TierError::InvalidPointer { addr, .. } if addr == ptr as usize));
}

#[test]
fn reattach_sees_records() {
    let fixture = Fixture::new(256, 4);
    let first = fixture.attach();
    first.put(42, b"shared").unwrap();

    let second = fixture.attach();
    let view = second.get(42).unwrap();
    assert_eq!(unsafe { view.as_slice() }, b"shared");

    // Released through one mapping, gone for the other.
    second.release(view.as_ptr()).unwrap();
    assert!(matches!(first.get(42), Err(TierError::NotFound { id: 42, .. })));
}

#[test]
fn reattach_checks_layout_and_digest() {
    let fixture = Fixture::new(256, 4);
    let _formatted = fixture.attach();

    let other_layout = Layout::new(128, 4).unwrap();
    assert!(matches!(
        fixture.attach_with(other_layout, &DIGEST),
        Err(OpenError::LayoutMismatch)
    ));

    assert!(matches!(
        fixture.attach_with(fixture.layout, &[1, 2, 3, 5]),
        Err(OpenError::AccessDenied)
    ));
}

#[test]
fn mapping_too_small() {
    let fixture = Fixture::new(256, 4);
    let larger = Layout::new(1 << 20, 4).unwrap();
    assert!(matches!(
        fixture.attach_with(larger, &DIGEST),
        Err(OpenError::LayoutMismatch)
    ));
}

#[test]
fn concurrent_puts_do_not_overlap() {
    let fixture = Fixture::new(8 * 1024, 512);
    let region = fixture.attach();

    std::thread::scope(|scope| {
        for thread in 0..4u64 {
            let region = &region;
            scope.spawn(move || {
                for n in 0..100u64 {
                    let id = thread * 1000 + n;
                    let byte = id as u8;
                    region.put(id, &[byte; 13]).unwrap();

                    if n % 2 == 0 {
                        let view = region.get(id).unwrap();
                        assert_eq!(unsafe { view.as_slice() }, &[byte; 13]);
                        region.release(view.as_ptr()).unwrap();
                    }
                }
            });
        }
    });

    let records = sorted_records(&region);
    assert_eq!(records.len(), 200);

    for pair in records.windows(2) {
        assert!(pair[0].offset + extent_len(pair[0].len).unwrap() <= pair[1].offset);
    }

    for record in records {
        let view = region.get(record.id).unwrap();
        assert_eq!(unsafe { view.as_slice() }, &[record.id as u8; 13]);
    }
}

#[test]
fn lock_of_an_exited_process_is_taken_over() {
    // Above the kernel's pid limit, so never a running process.
    const EXITED: u32 = i32::MAX as u32;

    let fixture = Fixture::new(256, 4);
    let region = fixture.attach();
    fixture.with_lock_word(|word| word.store(EXITED, Ordering::Release));

    region.put(1, b"after a crash").unwrap();
    let view = region.get(1).unwrap();
    region.release(view.as_ptr()).unwrap();

    assert_eq!(fixture.with_lock_word(|word| word.load(Ordering::Acquire)), 0);

    // Formatting waits for the same lock.
    let fresh = Fixture::new(256, 4);
    fresh.with_lock_word(|word| word.store(EXITED, Ordering::Release));
    fresh.attach().put(2, b"formatted").unwrap();
}

#[test]
fn lock_of_a_live_process_times_out() {
    let fixture = Fixture::new(256, 4);
    let region = fixture.attach();
    region.put(1, b"kept").unwrap();

    // As if another thread of this process never unlocked.
    fixture.with_lock_word(|word| word.store(std::process::id(), Ordering::Release));

    let err = region.put(2, b"waits").unwrap_err();
    assert!(matches!(err, TierError::Busy { tier: Tier::LocalSegment }));
    let ptr = region.get(1).unwrap().as_ptr();
    assert!(matches!(region.release(ptr), Err(TierError::Busy { .. })));
    assert!(matches!(fixture.attach_with(fixture.layout, &DIGEST), Err(OpenError::Busy)));

    // Lookups do not take the lock.
    assert!(region.get(1).is_ok());

    fixture.with_lock_word(|word| word.store(0, Ordering::Release));
    region.put(2, b"waits").unwrap();
}
