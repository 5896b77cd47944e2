//! Recombining shard suites that ended up on the same worker.

use std::sync::Arc;

use tracing::debug;

use super::TestSuite;
use super::module::PreparerOwnership;
use crate::error::{SuiteError, SuiteResult};

/// Returns `true` if both suites are shards of the same module that can
/// share one preparer set.
///
/// Exclusive shards carry copies of the same preparers and merge with each
/// other. Pool shards only merge with shards of the same pool. A pool shard
/// never merges with an exclusive one.
pub fn are_part_of_same_suite(a: &TestSuite, b: &TestSuite) -> bool {
    match (a.direct_module(), b.direct_module()) {
        (Some(x), Some(y)) => {
            x.origin() == y.origin() && same_preparer_owner(x.preparers(), y.preparers())
        }
        _ => false,
    }
}

fn same_preparer_owner(a: &PreparerOwnership, b: &PreparerOwnership) -> bool {
    match (a, b) {
        (PreparerOwnership::Exclusive(_), PreparerOwnership::Exclusive(_)) => true,
        (PreparerOwnership::Shared(x), PreparerOwnership::Shared(y)) => Arc::ptr_eq(x, y),
        _ => false,
    }
}

/// Moves the tests of `b` into `a`.
///
/// `b`'s preparers are dropped: an exclusive copy is identical to `a`'s, and a
/// shared registration is released so the pool teardown still runs once `a`
/// finishes.
///
/// # Errors
///
/// [`SuiteError::InvalidArgument`] if the suites are not shards of the same
/// module.
pub fn merge_splitted_suites(a: &mut TestSuite, mut b: TestSuite) -> SuiteResult<()> {
    if !are_part_of_same_suite(a, &b) {
        return Err(SuiteError::InvalidArgument(
            "cannot merge shards of different modules".into(),
        ));
    }

    let Some(mut from) = b.take_direct_module() else {
        return Err(SuiteError::InvalidArgument("suite has no module to merge".into()));
    };
    let Some(into) = a.direct_module_mut() else {
        return Err(SuiteError::InvalidArgument("suite has no module to merge into".into()));
    };

    if let PreparerOwnership::Shared(shared) = from.preparers() {
        shared.unregister();
    }
    let tests = from.take_tests();
    debug!("{}: merging {} delegates", into.id(), tests.len());
    into.add_tests(tests);
    Ok(())
}
