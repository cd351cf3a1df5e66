// SPDX-License-Identifier: Apache-2.0

//! # cellstm
//!
//! A TL2-style software transactional memory: a global version clock, one
//! versioned lock per [`Cell`], deferred writes, and read-set revalidation
//! at commit time.
//!
//! ```
//! use cellstm::Cell;
//!
//! let balance = Cell::new(100i64);
//!
//! cellstm::run(|| {
//!     let current = balance.read()?;
//!     balance.write(current - 30)
//! })
//! .unwrap();
//!
//! assert_eq!(cellstm::run_read_only(|| balance.read()).unwrap(), 70);
//! ```

mod cell;
mod clock;
mod dispatcher;
mod error;
mod transaction;
mod vlock;

pub use cell::Cell;
pub use dispatcher::{is_transaction_running, run, run_read_only};
pub use error::StmError;
