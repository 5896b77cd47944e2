//! Module selection by abi, runner and metadata.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::config::SuiteConfig;
use crate::error::{SuiteError, SuiteResult};
use crate::framework::ModuleConfig;

/// Decides which loaded modules take part in a run.
///
/// - **abi**: modules with an abi outside `abis` are dropped; modules without
///   an abi are kept
/// - **runner whitelist**: every delegate of the module must use a
///   whitelisted runner
/// - **exclude metadata**: any matching key/value drops the module
/// - **include metadata**: when non-empty, at least one key/value must match
#[derive(Debug, Clone, Default)]
pub struct ModuleFilter {
    abis: BTreeSet<String>,
    runner_whitelist: BTreeSet<String>,
    include_metadata: BTreeMap<String, Vec<String>>,
    exclude_metadata: BTreeMap<String, Vec<String>>,
}

impl ModuleFilter {
    /// Builds the filter from suite options.
    ///
    /// # Errors
    ///
    /// Returns [`SuiteError::Config`] if the whitelist names a runner the
    /// loader does not know.
    pub fn new(options: &SuiteConfig, known_runners: &BTreeSet<String>) -> SuiteResult<Self> {
        let unknown: Vec<&str> = options
            .runner_whitelist
            .iter()
            .filter(|r| !known_runners.contains(*r))
            .map(String::as_str)
            .collect();
        if !unknown.is_empty() {
            return Err(SuiteError::Config(format!(
                "unknown runner(s) in whitelist: {}",
                unknown.join(", ")
            )));
        }

        Ok(Self {
            abis: options.abis.iter().cloned().collect(),
            runner_whitelist: options.runner_whitelist.iter().cloned().collect(),
            include_metadata: options.include_metadata.clone(),
            exclude_metadata: options.exclude_metadata.clone(),
        })
    }

    pub fn accepts(&self, module: &ModuleConfig) -> bool {
        let id = module.id();

        if let Some(abi) = &module.abi
            && !self.abis.is_empty()
            && !self.abis.contains(abi)
        {
            debug!("{}: abi not selected", id);
            return false;
        }

        if !self.runner_whitelist.is_empty()
            && let Some(test) = module
                .tests
                .iter()
                .find(|t| !self.runner_whitelist.contains(t.runner_name()))
        {
            debug!("{}: runner {} not whitelisted", id, test.runner_name());
            return false;
        }

        if matches_any(&module.metadata, &self.exclude_metadata) {
            debug!("{}: excluded by metadata", id);
            return false;
        }

        if !self.include_metadata.is_empty() && !matches_any(&module.metadata, &self.include_metadata)
        {
            debug!("{}: not included by metadata", id);
            return false;
        }

        true
    }

    /// Keeps the accepted modules, preserving order.
    pub fn apply(&self, modules: Vec<ModuleConfig>) -> Vec<ModuleConfig> {
        modules.into_iter().filter(|m| self.accepts(m)).collect()
    }
}

/// Returns `true` if any key/value of `metadata` appears in `filter`.
fn matches_any(
    metadata: &BTreeMap<String, Vec<String>>,
    filter: &BTreeMap<String, Vec<String>>,
) -> bool {
    metadata.iter().any(|(key, values)| {
        filter
            .get(key)
            .is_some_and(|wanted| values.iter().any(|v| wanted.contains(v)))
    })
}
