// SPDX-License-Identifier: Apache-2.0

//! Component F: the per-thread transaction dispatcher. Each thread owns at
//! most one transaction object, reused across successive top-level
//! transactions once it stops running.

use crate::cell::Cell;
use crate::error::StmError;
use crate::transaction::{ReadOnlyState, ReadWriteState};
use log::debug;
use std::cell::RefCell;

enum TxObject {
    ReadOnly(ReadOnlyState),
    ReadWrite(ReadWriteState),
}

impl TxObject {
    fn is_running(&self) -> bool {
        match self {
            TxObject::ReadOnly(s) => s.is_running(),
            TxObject::ReadWrite(s) => s.is_running(),
        }
    }

    fn begin_rw(&mut self) -> Result<(), StmError> {
        match self {
            TxObject::ReadOnly(_) => Err(StmError::ReadOnly),
            TxObject::ReadWrite(s) => s.begin(),
        }
    }

    fn begin_ro(&mut self) {
        match self {
            TxObject::ReadOnly(s) => s.begin(),
            TxObject::ReadWrite(s) => s.begin_read_only(),
        }
    }

    /// Returns whether the transaction is still running afterwards.
    fn rollback(&mut self) -> bool {
        match self {
            TxObject::ReadOnly(s) => s.end(),
            TxObject::ReadWrite(s) => s.rollback(),
        }
    }

    fn commit(&mut self) -> Result<(), StmError> {
        match self {
            TxObject::ReadOnly(s) => {
                s.end();
                Ok(())
            }
            TxObject::ReadWrite(s) => s.commit(),
        }
    }

    fn read<T: Clone + Send + 'static>(&mut self, cell: &Cell<T>) -> Result<T, StmError> {
        match self {
            TxObject::ReadOnly(s) => s.read(cell),
            TxObject::ReadWrite(s) => s.read(cell),
        }
    }

    fn write<T: Clone + Send + 'static>(&mut self, cell: &Cell<T>, value: T) -> Result<(), StmError> {
        match self {
            TxObject::ReadOnly(_) => Err(StmError::ReadOnly),
            TxObject::ReadWrite(s) => s.write(cell, value),
        }
    }
}

thread_local! {
    static SLOT: RefCell<Option<TxObject>> = const { RefCell::new(None) };
}

/// Used by [`Cell::read`] and [`Cell::write`] to reach the currently running
/// transaction. Fails with [`StmError::OutsideTransaction`] if none is
/// running on this thread.
pub(crate) fn with_current<T, R>(f: impl FnOnce(&mut TxLike<'_, T>) -> Result<R, StmError>) -> Result<R, StmError>
where
    T: Clone + Send + 'static,
{
    SLOT.with(|slot| {
        let mut slot = slot.borrow_mut();
        match slot.as_mut() {
            Some(obj) if obj.is_running() => f(&mut TxLike { obj, _marker: std::marker::PhantomData }),
            _ => Err(StmError::OutsideTransaction),
        }
    })
}

/// A thin, generic-friendly view over the slot's `TxObject`, so `Cell<T>`
/// does not need to know the dispatcher's internal enum.
pub(crate) struct TxLike<'a, T> {
    obj: &'a mut TxObject,
    _marker: std::marker::PhantomData<T>,
}

impl<'a, T: Clone + Send + 'static> TxLike<'a, T> {
    pub(crate) fn read(&mut self, cell: &Cell<T>) -> Result<T, StmError> {
        self.obj.read(cell)
    }

    pub(crate) fn write(&mut self, cell: &Cell<T>, value: T) -> Result<(), StmError> {
        self.obj.write(cell, value)
    }
}

/// Whether a transaction (read-only or read-write) is currently running on
/// this thread.
pub fn is_transaction_running() -> bool {
    SLOT.with(|slot| slot.borrow().as_ref().map(TxObject::is_running).unwrap_or(false))
}

fn ensure_installed(make_fresh: impl FnOnce() -> TxObject) {
    SLOT.with(|slot| {
        let mut slot = slot.borrow_mut();
        let needs_fresh = match slot.as_ref() {
            None => true,
            Some(obj) => !obj.is_running(),
        };
        if needs_fresh {
            *slot = Some(make_fresh());
        }
    });
}

fn with_slot<R>(f: impl FnOnce(&mut TxObject) -> R) -> R {
    SLOT.with(|slot| {
        let mut slot = slot.borrow_mut();
        let obj = slot.as_mut().expect("slot installed by caller");
        f(obj)
    })
}

/// Runs `f` as a read-write transaction. Installs a fresh transaction object
/// if none is running on this thread, otherwise nests on the existing one.
/// Retries on [`StmError::Conflict`] at the outermost level; any other
/// failure, and a conflict re-raised from an inner frame, is propagated
/// unchanged after rolling back.
pub fn run<T>(f: impl Fn() -> Result<T, StmError>) -> Result<T, StmError> {
    ensure_installed(|| TxObject::ReadWrite(ReadWriteState::new()));
    loop {
        with_slot(TxObject::begin_rw)?;
        match f() {
            Ok(value) => match with_slot(TxObject::commit) {
                Ok(()) => return Ok(value),
                Err(StmError::Conflict) => {
                    if with_slot(TxObject::rollback) {
                        return Err(StmError::Conflict);
                    }
                    debug!("commit conflict on outermost frame, retrying");
                    continue;
                }
                Err(other) => return Err(other),
            },
            Err(StmError::Conflict) => {
                if with_slot(TxObject::rollback) {
                    return Err(StmError::Conflict);
                }
                debug!("read conflict on outermost frame, retrying");
                continue;
            }
            Err(other) => {
                with_slot(TxObject::rollback);
                return Err(other);
            }
        }
    }
}

/// Runs `f` as a read-only transaction: no write-set, O(1) per-access
/// validation, and the same retry-on-conflict discipline as [`run`].
pub fn run_read_only<T>(f: impl Fn() -> Result<T, StmError>) -> Result<T, StmError> {
    ensure_installed(|| TxObject::ReadOnly(ReadOnlyState::new()));
    loop {
        with_slot(TxObject::begin_ro);
        match f() {
            Ok(value) => {
                with_slot(TxObject::commit)?;
                return Ok(value);
            }
            Err(StmError::Conflict) => {
                if with_slot(TxObject::rollback) {
                    return Err(StmError::Conflict);
                }
                debug!("read-only conflict on outermost frame, retrying");
                continue;
            }
            Err(other) => {
                with_slot(TxObject::rollback);
                return Err(other);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::Cell;

    #[test]
    fn outside_transaction_fails() {
        let cell = Cell::new(1);
        assert_eq!(cell.read(), Err(StmError::OutsideTransaction));
    }

    #[test]
    fn run_read_write_roundtrip() {
        let cell = Cell::new(1);
        let out = run(|| {
            let v = cell.read()?;
            cell.write(v + 1)?;
            cell.read()
        })
        .unwrap();
        assert_eq!(out, 2);
        assert!(!is_transaction_running());
    }

    #[test]
    fn read_only_rejects_writes() {
        let cell = Cell::new(1);
        let err = run_read_only(|| cell.write(5)).unwrap_err();
        assert_eq!(err, StmError::ReadOnly);
    }

    #[test]
    fn nested_rw_commit_is_visible_to_outer() {
        let cell = Cell::new(1);
        let out = run(|| {
            cell.write(10)?;
            let inner = run(|| cell.write(20));
            inner?;
            cell.read()
        })
        .unwrap();
        assert_eq!(out, 20);
        assert_eq!(cell.peek(), 20);
    }

    #[test]
    fn nested_rw_inner_failure_does_not_poison_outer() {
        let cell = Cell::new(1);
        let out = run(|| {
            cell.write(10)?;
            let inner: Result<(), StmError> = run(|| Err(StmError::Validation));
            assert_eq!(inner, Err(StmError::Validation));
            cell.read()
        })
        .unwrap();
        assert_eq!(out, 10);
        assert_eq!(cell.peek(), 10);
    }
}
