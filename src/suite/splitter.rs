//! Turns module configurations into runnable, possibly sharded, modules.
//!
//! | Config shardable | Delegate | Dynamic | Result |
//! |------------------|----------|---------|--------|
//! | no | any | any | one module, configuration objects reused |
//! | yes | `None` | any | one module, preparers copied, delegate reused |
//! | yes | `Standard` | no | one module, preparers copied, delegate reused |
//! | yes | `Standard` | yes | one pool poller module per split piece, one shared preparer set set up per device |
//! | yes | `Strict` | any | one module per split piece, each with its own preparer copy |
//!
//! A delegate whose `split` yields fewer than two pieces is treated as not
//! shardable.

use tracing::{debug, info};

use super::module::{ModuleDefinition, ModulePreparers, PreparerOwnership, SharedPreparers};
use super::pool::{PoolPoller, TestPool};
use crate::framework::{ModuleConfig, Shardability, TestDelegate};

/// How one delegate ends up being scheduled.
enum DelegatePlan {
    Whole(TestDelegate),
    Shards(Vec<TestDelegate>),
    Pooled(Vec<TestDelegate>),
}

/// Decides how modules are sharded.
pub struct ModuleSplitter;

impl ModuleSplitter {
    /// Builds the modules of `configs`, in order.
    ///
    /// `shard_count_hint` below 2 disables splitting.
    pub fn split_configuration(
        configs: Vec<ModuleConfig>,
        shard_count_hint: usize,
        dynamic: bool,
    ) -> Vec<ModuleDefinition> {
        let mut modules = Vec::new();
        for config in configs {
            modules.extend(Self::split_module(&config, shard_count_hint, dynamic));
        }
        modules
    }

    fn split_module(
        config: &ModuleConfig,
        shard_count_hint: usize,
        dynamic: bool,
    ) -> Vec<ModuleDefinition> {
        let original = ModulePreparers::from_config(config);

        if !config.shardable {
            debug!("{}: not shardable, reusing configuration", config.id());
            return vec![ModuleDefinition::new(
                config,
                config.tests.clone(),
                PreparerOwnership::Exclusive(original),
            )];
        }

        let mut whole = Vec::new();
        let mut sharded = Vec::new();

        for delegate in &config.tests {
            match Self::plan(delegate, shard_count_hint, dynamic) {
                DelegatePlan::Whole(delegate) => whole.push(delegate),
                DelegatePlan::Shards(pieces) => {
                    info!("{}: split into {} shards", config.id(), pieces.len());
                    for piece in pieces {
                        sharded.push(ModuleDefinition::new(
                            config,
                            vec![piece],
                            PreparerOwnership::Exclusive(original.duplicate()),
                        ));
                    }
                }
                DelegatePlan::Pooled(pieces) => {
                    info!("{}: {} pieces pooled across shards", config.id(), pieces.len());
                    let pollers = pieces.len();
                    let runner = delegate.runner_name().to_string();
                    let pool = TestPool::new(pieces);
                    let shared = SharedPreparers::new(original.duplicate(), pollers);
                    for _ in 0..pollers {
                        sharded.push(ModuleDefinition::new(
                            config,
                            vec![TestDelegate::opaque(PoolPoller::new(
                                pool.clone(),
                                runner.clone(),
                            ))],
                            PreparerOwnership::Shared(shared.clone()),
                        ));
                    }
                }
            }
        }

        let mut modules = Vec::new();
        if !whole.is_empty() || sharded.is_empty() {
            modules.push(ModuleDefinition::new(
                config,
                whole,
                PreparerOwnership::Exclusive(original.duplicate()),
            ));
        }
        modules.extend(sharded);
        modules
    }

    fn plan(delegate: &TestDelegate, shard_count_hint: usize, dynamic: bool) -> DelegatePlan {
        if shard_count_hint < 2 {
            return DelegatePlan::Whole(delegate.clone());
        }

        let pooled = match delegate.shardability() {
            Shardability::None => return DelegatePlan::Whole(delegate.clone()),
            Shardability::Standard if !dynamic => return DelegatePlan::Whole(delegate.clone()),
            Shardability::Standard => true,
            Shardability::Strict => false,
        };

        match delegate.split(shard_count_hint) {
            Some(pieces) if pieces.len() >= 2 => {
                if pooled {
                    DelegatePlan::Pooled(pieces)
                } else {
                    DelegatePlan::Shards(pieces)
                }
            }
            _ => DelegatePlan::Whole(delegate.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::listener::NullListener;
    use crate::suite::module::ModuleRunOptions;
    use crate::testing::{FakePreparer, Journal, RecordingListener, StubTest, fake_context};

    fn config_with(test: StubTest, preparer: FakePreparer) -> ModuleConfig {
        ModuleConfig::new("m")
            .with_test(TestDelegate::filterable(test))
            .with_preparer(preparer.into_arc())
    }

    fn total_cases(modules: &[ModuleDefinition]) -> usize {
        modules.iter().map(|m| m.expected_test_case_count()).sum()
    }

    #[test]
    fn test_not_shardable_reuses_objects() {
        let preparer = FakePreparer::new("p");
        let copies = preparer.copy_counter();
        let config = config_with(
            StubTest::new("S", 4).with_shardability(Shardability::Strict),
            preparer,
        )
        .not_shardable();

        let modules = ModuleSplitter::split_configuration(vec![config.clone()], 4, true);
        assert_eq!(modules.len(), 1);
        assert!(modules[0].tests()[0].same_instance(&config.tests[0]));
        assert_eq!(copies.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unshardable_delegate_copies_preparers() {
        for shardability in [Shardability::None, Shardability::Standard] {
            let preparer = FakePreparer::new("p");
            let copies = preparer.copy_counter();
            let config = config_with(StubTest::new("S", 4).with_shardability(shardability), preparer);

            let modules = ModuleSplitter::split_configuration(vec![config.clone()], 4, false);
            assert_eq!(modules.len(), 1);
            assert!(modules[0].tests()[0].same_instance(&config.tests[0]));
            assert_eq!(copies.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn test_strict_shards_get_own_preparers() {
        let preparer = FakePreparer::new("p");
        let copies = preparer.copy_counter();
        let config = config_with(
            StubTest::new("S", 6).with_shardability(Shardability::Strict),
            preparer,
        );

        let modules = ModuleSplitter::split_configuration(vec![config], 3, false);
        assert_eq!(modules.len(), 3);
        assert_eq!(copies.load(Ordering::SeqCst), 3);
        assert_eq!(total_cases(&modules), 6);
        for module in &modules {
            assert_eq!(module.id(), "m");
            assert!(matches!(module.preparers(), PreparerOwnership::Exclusive(_)));
        }
    }

    #[test]
    fn test_strict_delegate_that_does_not_split() {
        let config = config_with(
            StubTest::new("S", 1).with_shardability(Shardability::Strict),
            FakePreparer::new("p"),
        );
        let modules = ModuleSplitter::split_configuration(vec![config], 3, false);
        assert_eq!(modules.len(), 1);
        assert_eq!(total_cases(&modules), 1);
    }

    #[test]
    fn test_shard_count_one_never_splits() {
        let config = config_with(
            StubTest::new("S", 6).with_shardability(Shardability::Strict),
            FakePreparer::new("p"),
        );
        let modules = ModuleSplitter::split_configuration(vec![config], 1, true);
        assert_eq!(modules.len(), 1);
    }

    #[tokio::test]
    async fn test_dynamic_standard_shares_pool_and_preparers() {
        let journal = Journal::default();
        let preparer = FakePreparer::new("p").with_journal(&journal);
        let copies = preparer.copy_counter();
        let config = config_with(
            StubTest::new("S", 6).with_shardability(Shardability::Standard),
            preparer,
        );

        let mut modules = ModuleSplitter::split_configuration(vec![config], 3, true);
        assert_eq!(modules.len(), 3);
        assert_eq!(copies.load(Ordering::SeqCst), 1);
        assert_eq!(total_cases(&modules), 6);

        let shared: Vec<_> = modules
            .iter()
            .map(|m| match m.preparers() {
                PreparerOwnership::Shared(s) => s.clone(),
                PreparerOwnership::Exclusive(_) => panic!("expected shared preparers"),
            })
            .collect();
        assert!(shared.iter().all(|s| Arc::ptr_eq(s, &shared[0])));

        let ctx = fake_context("s");
        let listener = RecordingListener::default();
        let options = ModuleRunOptions::default();
        for module in &mut modules {
            module.run(&ctx, &listener, &options).await.unwrap();
        }

        assert_eq!(listener.count("ended S#"), 6);
        assert_eq!(
            journal.lock().unwrap().clone(),
            vec!["setup p", "teardown p"]
        );
    }

    #[tokio::test]
    async fn test_modules_keep_order() {
        let configs = vec![
            ModuleConfig::new("a").with_test(TestDelegate::filterable(StubTest::new("A", 1))),
            ModuleConfig::new("b").with_test(TestDelegate::filterable(StubTest::new("B", 1))),
        ];
        let mut modules = ModuleSplitter::split_configuration(configs, 1, false);
        let ids: Vec<_> = modules.iter().map(|m| m.id().to_string()).collect();
        assert_eq!(ids, vec!["a", "b"]);

        modules[0]
            .run(&fake_context("s"), &NullListener, &ModuleRunOptions::default())
            .await
            .unwrap();
    }
}
