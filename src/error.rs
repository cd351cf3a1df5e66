// SPDX-License-Identifier: Apache-2.0

use thiserror::Error as DeriveError;

/// The closed taxonomy of failures a transaction can raise.
#[derive(Debug, DeriveError, Clone, PartialEq, Eq)]
pub enum StmError {
    /// A version check failed during a read or at commit. Never surfaced to
    /// user code directly: the outermost frame's retry loop catches it and
    /// restarts the transaction. An inner frame re-raises it so the
    /// outermost frame sees it.
    #[error("transactional version conflict")]
    Conflict,

    /// A cell was read, written, committed, or rolled back with no running
    /// transaction on the current thread.
    #[error("operation requires a running transaction")]
    OutsideTransaction,

    /// A write was attempted in a read-only frame, or a read-write `begin`
    /// was issued while the innermost frame on the stack is read-only.
    #[error("write attempted in a read-only transaction")]
    ReadOnly,

    /// A pre-write validation hook vetoed a buffered write.
    #[error("write rejected by validation hook")]
    Validation,

    /// A required argument was absent (e.g. a null closure in source
    /// languages that allow it). Kept for parity with the closed taxonomy;
    /// unreachable from `cellstm`'s safe, statically-typed API.
    #[error("required argument was missing")]
    ArgumentNull,
}
