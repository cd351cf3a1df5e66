// SPDX-License-Identifier: Apache-2.0

use cellstm::{run, Cell};
use proptest::prelude::*;

proptest! {
    /// However a sequence of increments is buffered and committed, the
    /// final value equals the sum of increments: no update is ever lost
    /// within a single thread's sequential transactions.
    #[test]
    fn sequential_increments_never_lose_an_update(increments in prop::collection::vec(-100i64..100, 0..50)) {
        let cell = Cell::new(0i64);
        let mut expected = 0i64;
        for delta in &increments {
            run(|| {
                let v = cell.read()?;
                cell.write(v + delta)
            })
            .unwrap();
            expected += delta;
        }
        prop_assert_eq!(cell.peek(), expected);
    }
}
