//! modsuite: a module-based test suite execution engine.
//!
//! A suite is a list of *modules*. Each module bundles test delegates with the
//! preparers that set a device up for them and tear it down afterwards.
//! modsuite loads the modules, filters them, optionally shards them across
//! devices, runs every delegate with granular retries and reports the results
//! through a chain of listeners.
//!
//! # Architecture
//!
//! - **Framework** ([`framework`]): the traits a harness implements: test
//!   delegates, preparers, module controllers, status checkers, loaders
//! - **Suite** ([`suite`]): filtering, splitting, the per-module state
//!   machine, retries, shard scheduling and merging
//! - **Listeners** ([`listener`]): result collection, failure diagnostics,
//!   per-shard buffering
//! - **Report** ([`report`]): summary counting, console output, JUnit XML
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use modsuite::config::load_config;
//! use modsuite::device::{HostDevice, InvocationContext};
//! use modsuite::framework::shell::ShellModuleLoader;
//! use modsuite::report::ResultReporter;
//! use modsuite::suite::{TestSuite, scheduler::run_invocation};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("modsuite.toml"))?;
//!     let context = InvocationContext::new().with_device(
//!         "device",
//!         Arc::new(HostDevice::new("localhost")),
//!         Default::default(),
//!     );
//!     let loader = Arc::new(ShellModuleLoader::new(config.modules.clone()));
//!     let suite = TestSuite::new(config.suite.clone(), loader);
//!     let reporter = Arc::new(ResultReporter::new());
//!
//!     run_invocation(suite, &context, reporter.clone(), config.suite.shard_count).await?;
//!     std::process::exit(reporter.summary().exit_code());
//! }
//! ```

pub mod config;
pub mod device;
pub mod error;
pub mod framework;
pub mod listener;
pub mod log_saver;
pub mod report;
pub mod result;
pub mod suite;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use config::{Config, load_config};
pub use error::{SuiteError, SuiteResult};
pub use listener::TestListener;
pub use report::{ResultReporter, SuiteSummary};
pub use suite::TestSuite;
