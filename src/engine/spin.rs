//! Readers–writer spin coordination for snapshot transitions.
//!
//! A single 64-bit word encodes three fields:
//!
//! ```text
//!   bit 63          bits 31..16         bits 15..0
//! [ writer-held ] [ writer latches ] [ reader count ]
//! ```
//!
//! - `rlock` succeeds only while the latch field is zero, so a writer that
//!   has announced itself blocks new readers immediately.
//! - `lock` first adds a latch, then spins until readers drain and no other
//!   writer holds the word, then sets the writer bit.
//! - `unlock` clears the writer bit and drops the latch in one step.
//!
//! Writes (`set`, `delete`) hold the read side; snapshot swaps hold the
//! write side. Writers get priority without starving bulk readers, and at
//! most one snapshot swap is in flight at a time.

use std::sync::atomic::{AtomicU64, Ordering};

const READER_MASK: u64 = 0xFFFF;
const LATCH_UNIT: u64 = 1 << 16;
const LATCH_MASK: u64 = 0xFFFF_0000;
const WRITER_BIT: u64 = 1 << 63;

#[derive(Debug, Default)]
pub(crate) struct SnapSpin {
    word: AtomicU64,
}

impl SnapSpin {
    pub(crate) fn new() -> Self {
        Self {
            word: AtomicU64::new(0),
        }
    }

    /// Acquire the read side. Spins while any writer latch is pending.
    pub(crate) fn rlock(&self) {
        loop {
            let cur = self.word.load(Ordering::Acquire);
            if cur & LATCH_MASK == 0 {
                debug_assert!(cur & READER_MASK < READER_MASK, "reader count overflow");
                if self
                    .word
                    .compare_exchange_weak(cur, cur + 1, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    return;
                }
            }
            std::hint::spin_loop();
            std::thread::yield_now();
        }
    }

    /// Release the read side.
    pub(crate) fn runlock(&self) {
        let prev = self.word.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev & READER_MASK > 0, "runlock without rlock");
    }

    /// Acquire the write side: latch first (blocking new readers), then wait
    /// for readers to drain and any concurrent writer to leave.
    pub(crate) fn lock(&self) {
        self.word.fetch_add(LATCH_UNIT, Ordering::AcqRel);
        loop {
            let cur = self.word.load(Ordering::Acquire);
            if cur & READER_MASK == 0 && cur & WRITER_BIT == 0 {
                if self
                    .word
                    .compare_exchange_weak(
                        cur,
                        cur | WRITER_BIT,
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    return;
                }
            }
            std::hint::spin_loop();
            std::thread::yield_now();
        }
    }

    /// Release the write side: clear the held bit and drop our latch.
    pub(crate) fn unlock(&self) {
        loop {
            let cur = self.word.load(Ordering::Acquire);
            debug_assert!(cur & WRITER_BIT != 0, "unlock without lock");
            let next = (cur & !WRITER_BIT) - LATCH_UNIT;
            if self
                .word
                .compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
            std::hint::spin_loop();
        }
    }
}
