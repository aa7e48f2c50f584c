//! A recording allocator for tests.
//!
//! Hands out synthetic, never-dereferenced addresses so multi-megabyte blocks
//! cost nothing, and remembers every call it receives. Also captures `log`
//! output so diagnostics can be asserted on.

use std::{
    cell::RefCell,
    mem,
    ptr::{self, NonNull},
    sync::Once,
};

use log::{Level, LevelFilter, Log, Metadata, Record};

use crate::heap::GeneralAllocator;

const BASE_ADDRESS: usize = 0x1000_0000;

#[derive(Debug)]
pub struct FakeHeap {
    next: usize,
    exhausted: bool,
    mallocs: Vec<usize>,
    frees: Vec<NonNull<u8>>,
}

impl FakeHeap {
    pub const fn new() -> Self {
        Self {
            next: BASE_ADDRESS,
            exhausted: false,
            mallocs: Vec::new(),
            frees: Vec::new(),
        }
    }

    /// A heap on which every allocation fails.
    pub const fn exhausted() -> Self {
        let mut heap = Self::new();
        heap.exhausted = true;
        heap
    }

    /// Sizes passed to `malloc`, in call order.
    pub fn mallocs(&self) -> &[usize] {
        &self.mallocs
    }

    /// Pointers passed to `free`, in call order.
    pub fn frees(&self) -> &[NonNull<u8>] {
        &self.frees
    }
}

unsafe impl GeneralAllocator for FakeHeap {
    fn malloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        self.mallocs.push(size);
        if self.exhausted {
            return None;
        }

        let address = self.next;
        self.next += size.max(1).next_multiple_of(16);
        NonNull::new(ptr::without_provenance_mut(address))
    }

    unsafe fn free(&mut self, ptr: NonNull<u8>) {
        assert!(!self.frees.contains(&ptr), "double free of {ptr:p}");
        self.frees.push(ptr);
    }
}

thread_local! {
    static RECORDS: RefCell<Vec<(Level, String)>> = const { RefCell::new(Vec::new()) };
}

/// Collects log records per thread, so tests running in parallel each see
/// only their own.
struct CaptureLogger;

impl Log for CaptureLogger {
    fn enabled(&self, _metadata: &Metadata<'_>) -> bool {
        true
    }

    fn log(&self, record: &Record<'_>) {
        RECORDS.with_borrow_mut(|records| {
            records.push((record.level(), record.args().to_string()));
        });
    }

    fn flush(&self) {}
}

static LOGGER: CaptureLogger = CaptureLogger;
static LOGGER_INIT: Once = Once::new();

/// Installs the capturing logger and discards anything this thread logged so far.
pub fn capture_logs() {
    LOGGER_INIT.call_once(|| {
        if log::set_logger(&LOGGER).is_ok() {
            log::set_max_level(LevelFilter::Trace);
        }
    });
    RECORDS.with_borrow_mut(Vec::clear);
}

/// Takes the warnings this thread logged since the last call.
pub fn take_warnings() -> Vec<String> {
    RECORDS
        .with_borrow_mut(mem::take)
        .into_iter()
        .filter(|(level, _)| *level == Level::Warn)
        .map(|(_, message)| message)
        .collect()
}
