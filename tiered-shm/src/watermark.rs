//! The memory-pressure signal deciding where objects go.
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU8, Ordering};

/// Memory pressure as reported by an external monitor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Level {
    /// Objects go to the local segment.
    #[default]
    Low = 0,
    /// Objects go to the pooled memory.
    High = 1,
}

/// Anything that can tell the current pressure level.
///
/// Called on every store operation, so it must be cheap and never block.
pub trait PressureSource {
    fn current_level(&self) -> Level;
}

/// A shared, lock-free pressure level.
///
/// Clones refer to the same level. The store reads it, a monitor writes it, and neither waits
/// on the other.
#[derive(Clone, Debug, Default)]
pub struct Watermark {
    level: Arc<AtomicU8>,
}

impl Watermark {
    pub fn new(level: Level) -> Self {
        Watermark {
            level: Arc::new(AtomicU8::new(level as u8)),
        }
    }

    pub fn level(&self) -> Level {
        Level::from_raw(self.level.load(Ordering::Acquire))
    }

    /// Publish a new level, returning the one it replaced.
    pub fn set(&self, level: Level) -> Level {
        Level::from_raw(self.level.swap(level as u8, Ordering::AcqRel))
    }
}

impl Level {
    fn from_raw(raw: u8) -> Self {
        // Only values of `Self as u8` are ever stored.
        if raw == Level::Low as u8 {
            Level::Low
        } else {
            Level::High
        }
    }
}

impl PressureSource for Watermark {
    fn current_level(&self) -> Level {
        self.level()
    }
}

impl<T: PressureSource + ?Sized> PressureSource for &'_ T {
    fn current_level(&self) -> Level {
        (**self).current_level()
    }
}

impl<T: PressureSource + ?Sized> PressureSource for Arc<T> {
    fn current_level(&self) -> Level {
        (**self).current_level()
    }
}

impl core::fmt::Display for Level {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Level::Low => f.write_str("low"),
            Level::High => f.write_str("high"),
        }
    }
}

#[test]
fn clones_share_the_level() {
    let watermark = Watermark::default();
    let monitor = watermark.clone();

    assert_eq!(watermark.level(), Level::Low);
    assert_eq!(monitor.set(Level::High), Level::Low);
    assert_eq!(watermark.current_level(), Level::High);
    assert_eq!(Watermark::new(Level::High).level(), Level::High);
}
