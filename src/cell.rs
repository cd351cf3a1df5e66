// SPDX-License-Identifier: Apache-2.0

//! [`Cell`]: one transactionally-accessed shared location.

use crate::clock::GlobalClock;
use crate::dispatcher;
use crate::error::StmError;
use crate::vlock::VersionedLock;
use lazy_static::lazy_static;
use std::any::Any;
use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

lazy_static! {
    /// The global version clock `G`, shared by every cell and transaction in
    /// the process.
    pub(crate) static ref GLOBAL_CLOCK: GlobalClock = GlobalClock::new();
    static ref NEXT_CELL_ID: AtomicU64 = AtomicU64::new(1);
}

fn next_cell_id() -> u64 {
    NEXT_CELL_ID.fetch_add(1, Ordering::Relaxed)
}

type Validator<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;
type ChangeListener<T> = Box<dyn Fn(&T) + Send + Sync>;

struct CellInner<T> {
    id: u64,
    vlock: VersionedLock,
    value: UnsafeCell<T>,
    validators: Mutex<Vec<Validator<T>>>,
    listeners: Mutex<Vec<ChangeListener<T>>>,
}

// SAFETY: `value` is only read while the surrounding `vlock` snapshot
// protocol validates the read, and only written while the caller holds the
// lock bit (see vlock.rs). Both disciplines are enforced entirely within
// this module and `transaction.rs`.
unsafe impl<T: Send> Sync for CellInner<T> {}

/// A shared, transactionally-accessed storage location.
///
/// Cloning a `Cell` is cheap and yields another handle to the same
/// underlying location (it is reference-counted), mirroring how user code is
/// expected to share one cell across threads.
pub struct Cell<T> {
    inner: Arc<CellInner<T>>,
}

impl<T> Clone for Cell<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Cell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cell").field("id", &self.inner.id).finish()
    }
}

impl<T: Default> Default for Cell<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> Cell<T> {
    /// Creates a new cell holding `initial`. Callable inside or outside any
    /// transaction: construction never touches the dispatcher.
    pub fn new(initial: T) -> Self {
        Self {
            inner: Arc::new(CellInner {
                id: next_cell_id(),
                vlock: VersionedLock::new(GLOBAL_CLOCK.snapshot()),
                value: UnsafeCell::new(initial),
                validators: Mutex::new(Vec::new()),
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    /// The cell's process-unique, stable identity. Used by the commit
    /// protocol to order lock acquisition and never changes for the cell's
    /// lifetime.
    #[inline]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    #[inline]
    pub(crate) fn vlock(&self) -> &VersionedLock {
        &self.inner.vlock
    }

    /// # Safety
    /// Caller must hold the cell's lock bit before writing, and must only
    /// read after the lock-free consistent-read protocol has validated the
    /// snapshot.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    unsafe fn value_ptr(&self) -> *mut T {
        self.inner.value.get()
    }

    /// Registers a pre-write validation hook: called synchronously, inside
    /// the user's transaction, before a write to this cell is buffered. If
    /// any registered validator returns `false` the write is rejected with
    /// [`StmError::Validation`] and never buffered.
    pub fn add_validator<F>(&self, validator: F)
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.inner.validators.lock().unwrap().push(Box::new(validator));
    }

    /// Registers a post-commit notification hook: called once per outermost
    /// commit that wrote this cell, after the frame has been popped and
    /// outside any transactional state. Panics from a listener are caught
    /// and discarded.
    pub fn on_changed<F>(&self, listener: F)
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.inner.listeners.lock().unwrap().push(Box::new(listener));
    }

    pub(crate) fn run_validators(&self, new: &T) -> bool {
        self.inner.validators.lock().unwrap().iter().all(|v| v(new))
    }

    pub(crate) fn notify_changed(&self, value: &T) {
        let listeners = self.inner.listeners.lock().unwrap();
        for listener in listeners.iter() {
            let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| listener(value)));
        }
    }
}

impl<T: Clone + Send + 'static> Cell<T> {
    /// Reads the cell's value. Requires a running transaction on the current
    /// thread; otherwise fails with [`StmError::OutsideTransaction`].
    pub fn read(&self) -> Result<T, StmError> {
        dispatcher::with_current(|tx| tx.read(self))
    }

    /// Buffers a write to the cell. Requires a running read-write frame;
    /// fails with [`StmError::ReadOnly`] in a read-only frame and with
    /// [`StmError::Validation`] if a registered validator vetoes the write.
    pub fn write(&self, value: T) -> Result<(), StmError> {
        dispatcher::with_current(|tx| tx.write(self, value))
    }

    /// Reads the current value, applies `f`, and buffers the result as a
    /// write. Equivalent to `self.write(f(self.read()?))`.
    pub fn apply<F>(&self, f: F) -> Result<(), StmError>
    where
        F: FnOnce(T) -> T,
    {
        let current = self.read()?;
        self.write(f(current))
    }

    /// Returns the cell's value as a direct, unsynchronized snapshot,
    /// bypassing the transactional protocol. Only meaningful when no
    /// concurrent writer can be active, e.g. in tests after all worker
    /// threads have joined.
    pub fn peek(&self) -> T {
        // SAFETY: caller's responsibility per the doc comment above; there
        // is no concurrent writer holding the lock at call time.
        unsafe { (*self.value_ptr()).clone() }
    }
}

/// Type-erased handle into a cell read, letting the commit protocol hold a
/// read-set of heterogeneous cell types in one map.
pub(crate) trait ErasedRead: Send {
    fn cell_id(&self) -> u64;
    fn vlock(&self) -> &VersionedLock;
}

impl<T: Clone + Send + 'static> ErasedRead for Cell<T> {
    fn cell_id(&self) -> u64 {
        self.id()
    }

    fn vlock(&self) -> &VersionedLock {
        Cell::vlock(self)
    }
}

/// A buffered write: the concrete value together with the cell it targets,
/// type-erased behind [`ErasedWrite`] so heterogeneous cell types can share
/// one write-set.
pub(crate) struct WriteEntry<T: Clone + Send + 'static> {
    pub(crate) cell: Cell<T>,
    pub(crate) value: T,
}

/// Type-erased handle into a buffered write, letting the commit protocol
/// lock, validate, and publish cells of different `T` uniformly.
pub(crate) trait ErasedWrite: Send {
    fn cell_id(&self) -> u64;
    fn vlock(&self) -> &VersionedLock;
    /// Publishes the buffered value and stamps `version` on the cell's lock.
    /// The lock must already be held by the caller. Validation already
    /// happened when the write was buffered (see `Cell::write`).
    fn publish(&self, version: usize);
    /// Runs this cell's post-commit change listeners with the published
    /// value. Called after the frame has been popped, outside any lock.
    fn notify(&self);
    fn as_any(&self) -> &dyn Any;
}

impl<T: Clone + Send + 'static> ErasedWrite for WriteEntry<T> {
    fn cell_id(&self) -> u64 {
        self.cell.id()
    }

    fn vlock(&self) -> &VersionedLock {
        self.cell.vlock()
    }

    fn publish(&self, version: usize) {
        // SAFETY: the commit protocol holds this cell's lock bit for the
        // duration of the call.
        let slot = unsafe { &mut *self.cell.value_ptr() };
        *slot = self.value.clone();
        self.cell.vlock().unlock_with(version);
    }

    fn notify(&self) {
        self.cell.notify_changed(&self.value);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
