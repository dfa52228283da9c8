// SPDX-FileCopyrightText: 2025 t210 contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Bounded hand-off of gathers from submitters to a channel worker.

use std::fmt;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam::channel::{self, select, Receiver, Sender};
use parking_lot::Mutex;

enum GatherWords {
    Borrowed { ptr: NonNull<u32>, len: usize },
    Owned(Arc<[u32]>),
}

/// A contiguous run of command words.
///
/// Either owns its words or borrows guest memory that the submitter keeps
/// alive until the channel has consumed it.
pub struct Gather {
    words: GatherWords,
}

// SAFETY: owned words are immutable behind an Arc. For borrowed words the
// caller of `from_raw_parts` guarantees the memory outlives the gather and is
// not written while the gather is decoded.
unsafe impl Send for Gather {}

impl Gather {
    /// Borrow `len` words of memory the caller keeps alive.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads of `len` words until the channel has
    /// finished decoding this gather, and the memory must not be written
    /// during that time.
    pub unsafe fn from_raw_parts(ptr: NonNull<u32>, len: usize) -> Self {
        Self {
            words: GatherWords::Borrowed { ptr, len },
        }
    }

    pub fn is_borrowed(&self) -> bool {
        matches!(self.words, GatherWords::Borrowed { .. })
    }
}

impl Deref for Gather {
    type Target = [u32];

    fn deref(&self) -> &[u32] {
        match &self.words {
            // SAFETY: upheld by the contract of `from_raw_parts`.
            GatherWords::Borrowed { ptr, len } => unsafe {
                std::slice::from_raw_parts(ptr.as_ptr(), *len)
            },
            GatherWords::Owned(words) => words,
        }
    }
}

impl From<Vec<u32>> for Gather {
    fn from(words: Vec<u32>) -> Self {
        Self {
            words: GatherWords::Owned(words.into()),
        }
    }
}

impl From<Arc<[u32]>> for Gather {
    fn from(words: Arc<[u32]>) -> Self {
        Self {
            words: GatherWords::Owned(words),
        }
    }
}

impl From<&'static [u32]> for Gather {
    fn from(words: &'static [u32]) -> Self {
        Self {
            words: GatherWords::Borrowed {
                ptr: NonNull::from(words).cast(),
                len: words.len(),
            },
        }
    }
}

impl fmt::Debug for Gather {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gather")
            .field("ptr", &self.as_ptr())
            .field("len", &self.len())
            .field("borrowed", &self.is_borrowed())
            .finish()
    }
}

/// Fixed-capacity FIFO of gathers. `push` blocks while full, `pop` blocks
/// while empty, and `close` releases both.
///
/// Closing drops the only sender of `shutdown`, which disconnects it and
/// wakes every `select!` blocked on either end of the queue.
pub struct GatherQueue {
    tx: Sender<Gather>,
    rx: Receiver<Gather>,
    shutdown: Mutex<Option<Sender<()>>>,
    shutdown_rx: Receiver<()>,
    closed: AtomicBool,
    capacity: usize,
}

impl GatherQueue {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "gather queue capacity must be non-zero");
        let (tx, rx) = channel::bounded(capacity);
        let (shutdown, shutdown_rx) = channel::bounded(0);
        Self {
            tx,
            rx,
            shutdown: Mutex::new(Some(shutdown)),
            shutdown_rx,
            closed: AtomicBool::new(false),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Append a gather, waiting for space if the queue is full.
    ///
    /// Returns `false` and drops the gather if the queue was closed.
    pub fn push(&self, gather: Gather) -> bool {
        if self.is_closed() {
            return false;
        }
        let sent = select! {
            send(self.tx, gather) -> res => res.is_ok(),
            recv(self.shutdown_rx) -> _ => false,
        };
        if sent && self.is_closed() {
            // Raced with `close`; nothing will consume it.
            self.drain();
            return false;
        }
        sent
    }

    /// Take the oldest gather, waiting for one to arrive.
    ///
    /// Returns `None` once the queue is closed, discarding anything left.
    pub fn pop(&self) -> Option<Gather> {
        if self.is_closed() {
            return None;
        }
        let gather = select! {
            recv(self.rx) -> gather => gather.ok(),
            recv(self.shutdown_rx) -> _ => None,
        };
        gather.filter(|_| !self.is_closed())
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        drop(self.shutdown.lock().take());
        self.drain();
    }

    fn drain(&self) {
        let discarded = self.rx.try_iter().count();
        if discarded > 0 {
            log::trace!("gather queue: discarded {} gathers on close", discarded);
        }
    }
}
