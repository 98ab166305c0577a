// Registered auto-process rules and source -> rule resolution
use super::AutoProcess;
use crate::application::catalog::Catalog;
use crate::domain::error::RuleId;
use crate::domain::timeseries::TimeseriesId;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct RuleRegistry {
    rules: RwLock<BTreeMap<RuleId, Arc<AutoProcess>>>,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a rule, returning the previous version if any.
    pub fn insert(&self, rule: AutoProcess) -> Option<Arc<AutoProcess>> {
        self.rules.write().insert(rule.id, Arc::new(rule))
    }

    pub fn remove(&self, rule_id: RuleId) -> Option<Arc<AutoProcess>> {
        self.rules.write().remove(&rule_id)
    }

    pub fn get(&self, rule_id: RuleId) -> Option<Arc<AutoProcess>> {
        self.rules.read().get(&rule_id).cloned()
    }

    pub fn ids(&self) -> Vec<RuleId> {
        self.rules.read().keys().copied().collect()
    }

    /// Rules whose source currently resolves to `timeseries_id`.
    pub fn affected_by(&self, timeseries_id: TimeseriesId, catalog: &Catalog) -> Vec<RuleId> {
        self.rules
            .read()
            .values()
            .filter(|rule| {
                rule.existing_source(catalog)
                    .is_some_and(|source| source.id == timeseries_id)
            })
            .map(|rule| rule.id)
            .collect()
    }
}
