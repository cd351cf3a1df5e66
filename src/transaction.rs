// SPDX-License-Identifier: Apache-2.0

//! Components D and E: the read-only and read-write transaction state
//! machines that live in a thread's dispatcher slot.

use crate::cell::{Cell, ErasedRead, ErasedWrite, WriteEntry, GLOBAL_CLOCK};
use crate::error::StmError;
use crate::vlock::VersionedLock;
use log::trace;
use std::collections::{HashMap, HashSet};

/// Reads `cell` against `read_version` using the lock-free consistent-read
/// protocol shared by read-only transactions and by reads inside a
/// read-write frame once no buffered own-write applies (§4.D).
fn consistent_read<T: Clone + Send + 'static>(cell: &Cell<T>, read_version: usize) -> Result<T, StmError> {
    loop {
        let pre = cell.vlock().snapshot();
        if VersionedLock::is_locked(pre) {
            std::hint::spin_loop();
            continue;
        }
        let value = cell.peek();
        let post = cell.vlock().snapshot();
        if pre != post {
            std::hint::spin_loop();
            continue;
        }
        if VersionedLock::version_of(pre) > read_version {
            return Err(StmError::Conflict);
        }
        return Ok(value);
    }
}

/// A read-only transaction: just a snapshot version and a nesting depth.
/// No read-set is kept; every read is independently validated against
/// `read_version`.
#[derive(Default)]
pub(crate) struct ReadOnlyState {
    read_version: usize,
    depth: usize,
}

impl ReadOnlyState {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn is_running(&self) -> bool {
        self.depth > 0
    }

    pub(crate) fn begin(&mut self) {
        if self.depth == 0 {
            self.read_version = GLOBAL_CLOCK.snapshot();
        }
        self.depth += 1;
    }

    /// Commit and rollback are indistinguishable for a read-only frame.
    /// Returns whether the transaction is still running afterwards.
    pub(crate) fn end(&mut self) -> bool {
        self.depth = self.depth.saturating_sub(1);
        self.depth > 0
    }

    pub(crate) fn read<T: Clone + Send + 'static>(&self, cell: &Cell<T>) -> Result<T, StmError> {
        consistent_read(cell, self.read_version)
    }
}

/// One live nested `begin` in a read-write transaction.
struct Frame {
    read_only: bool,
    reads: HashMap<u64, Box<dyn ErasedRead>>,
    /// `None` for read-only frames; `Some` (possibly empty) otherwise.
    writes: Option<HashMap<u64, Box<dyn ErasedWrite>>>,
}

impl Frame {
    fn read_write() -> Self {
        Self {
            read_only: false,
            reads: HashMap::new(),
            writes: Some(HashMap::new()),
        }
    }

    fn read_only() -> Self {
        Self {
            read_only: true,
            reads: HashMap::new(),
            writes: None,
        }
    }
}

/// A read-write transaction: a stack of frames sharing one `read_version`.
#[derive(Default)]
pub(crate) struct ReadWriteState {
    read_version: usize,
    stack: Vec<Frame>,
}

impl ReadWriteState {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn is_running(&self) -> bool {
        !self.stack.is_empty()
    }

    pub(crate) fn begin(&mut self) -> Result<(), StmError> {
        if let Some(top) = self.stack.last() {
            if top.read_only {
                return Err(StmError::ReadOnly);
            }
        } else {
            self.read_version = GLOBAL_CLOCK.snapshot();
        }
        self.stack.push(Frame::read_write());
        Ok(())
    }

    pub(crate) fn begin_read_only(&mut self) {
        if self.stack.is_empty() {
            self.read_version = GLOBAL_CLOCK.snapshot();
        }
        self.stack.push(Frame::read_only());
    }

    /// Reads `cell`, checking own buffered writes on every ancestor frame
    /// before falling back to the lock-free consistent-read protocol.
    pub(crate) fn read<T: Clone + Send + 'static>(&mut self, cell: &Cell<T>) -> Result<T, StmError> {
        for frame in self.stack.iter().rev() {
            if let Some(writes) = &frame.writes {
                if let Some(entry) = writes.get(&cell.id()) {
                    let entry = entry
                        .as_any()
                        .downcast_ref::<WriteEntry<T>>()
                        .expect("write-set entry type mismatch for cell id");
                    return Ok(entry.value.clone());
                }
            }
        }

        let value = consistent_read(cell, self.read_version)?;
        let top = self.stack.last_mut().expect("read outside a running frame");
        top.reads.entry(cell.id()).or_insert_with(|| Box::new(cell.clone()));
        Ok(value)
    }

    pub(crate) fn write<T: Clone + Send + 'static>(&mut self, cell: &Cell<T>, value: T) -> Result<(), StmError> {
        let top = self.stack.last_mut().expect("write outside a running frame");
        if top.read_only {
            return Err(StmError::ReadOnly);
        }
        if !cell.run_validators(&value) {
            return Err(StmError::Validation);
        }
        top.writes
            .as_mut()
            .expect("read-write frame always carries a write-set")
            .insert(
                cell.id(),
                Box::new(WriteEntry {
                    cell: cell.clone(),
                    value,
                }),
            );
        Ok(())
    }

    /// Pops the top frame unconditionally, discarding its reads and writes.
    /// Returns whether the transaction is still running afterwards.
    pub(crate) fn rollback(&mut self) -> bool {
        self.stack.pop();
        !self.stack.is_empty()
    }

    /// Commits the top frame. For an inner frame this only merges into the
    /// parent and never fails. For the outermost frame this runs the full
    /// commit protocol (§4.E) and, on conflict, leaves the frame in place
    /// for the caller to roll back.
    pub(crate) fn commit(&mut self) -> Result<(), StmError> {
        if self.stack.len() > 1 {
            let child = self.stack.pop().expect("checked non-empty above");
            let parent = self.stack.last_mut().expect("checked len > 1 above");
            for (id, read) in child.reads {
                parent.reads.entry(id).or_insert(read);
            }
            if !child.read_only {
                let parent_writes = parent.writes.as_mut().expect("rw parent always has a write-set");
                for (id, write) in child.writes.expect("rw child always has a write-set") {
                    parent_writes.insert(id, write);
                }
            }
            return Ok(());
        }

        self.commit_outermost()
    }

    fn commit_outermost(&mut self) -> Result<(), StmError> {
        // Pop the frame up front and work only with owned data from here on:
        // nothing below borrows `self.stack`, so there is no conflict with
        // the lock-acquisition and publish steps mutating shared state.
        let frame = self.stack.pop().expect("caller checked len == 1");
        let mut writes: Vec<Box<dyn ErasedWrite>> = frame
            .writes
            .expect("outermost frame is always read-write")
            .into_values()
            .collect();
        writes.sort_by_key(|w| w.cell_id());

        // Step 1: acquire locks in ascending id order (deadlock-free),
        // recording the version each lock carried at the instant it was
        // acquired (not a version sampled in an earlier pass, which could
        // already be stale by the time the lock is taken).
        let pre_versions: Vec<usize> = writes
            .iter()
            .map(|w| VersionedLock::version_of(w.vlock().lock()))
            .collect();

        // Step 2: assign the commit version.
        let write_version = GLOBAL_CLOCK.tick();
        trace!("commit: assigned write_version {}", write_version);

        // Step 3: validate the read set.
        let write_ids: HashSet<u64> = writes.iter().map(|w| w.cell_id()).collect();
        let mut conflict = false;
        for (id, read) in &frame.reads {
            let version = if write_ids.contains(id) {
                VersionedLock::version_of(read.vlock().snapshot())
            } else {
                let word = read.vlock().snapshot();
                if VersionedLock::is_locked(word) {
                    conflict = true;
                    break;
                }
                VersionedLock::version_of(word)
            };
            if version > self.read_version {
                conflict = true;
                break;
            }
        }

        if conflict {
            // Abort: restore the exact version each lock carried when we
            // acquired it.
            for (w, pre) in writes.iter().zip(pre_versions.iter()) {
                w.vlock().unlock_with(*pre);
            }
            return Err(StmError::Conflict);
        }

        // Step 4: publish.
        for w in &writes {
            w.publish(write_version);
        }

        // Step 5: notify, outside any lock and after the frame is gone.
        for w in &writes {
            w.notify();
        }

        Ok(())
    }
}
