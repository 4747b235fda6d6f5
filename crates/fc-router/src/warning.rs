//! In-memory warning store.
//!
//! Warnings are operator-facing: pools, mediator, consumers and the health
//! monitor raise them, the monitoring API lists them. The store is capped and
//! old entries age out on [`WarningService::cleanup`].

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use fc_common::{Warning, WarningCategory, WarningSeverity};

#[derive(Debug, Clone)]
pub struct WarningServiceConfig {
    /// Warnings older than this are dropped on cleanup
    pub max_warning_age_hours: i64,
    /// Oldest warnings are evicted beyond this count
    pub max_warnings: usize,
}

impl Default for WarningServiceConfig {
    fn default() -> Self {
        Self {
            max_warning_age_hours: 24,
            max_warnings: 1000,
        }
    }
}

pub struct WarningService {
    warnings: RwLock<HashMap<String, Warning>>,
    config: WarningServiceConfig,
}

impl WarningService {
    pub fn new(config: WarningServiceConfig) -> Self {
        Self {
            warnings: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Record a warning and return its id
    pub fn add_warning(
        &self,
        category: WarningCategory,
        severity: WarningSeverity,
        message: impl Into<String>,
        source: impl Into<String>,
    ) -> String {
        let warning = Warning::new(category, severity, message.into(), source.into());
        let id = warning.id.clone();

        match severity {
            WarningSeverity::Info => debug!(category = ?category, source = %warning.source, "{}", warning.message),
            _ => warn!(category = ?category, severity = ?severity, source = %warning.source, "{}", warning.message),
        }

        let mut warnings = self.warnings.write();
        if warnings.len() >= self.config.max_warnings {
            let excess = warnings.len() + 1 - self.config.max_warnings;
            Self::evict_oldest(&mut warnings, excess);
        }
        warnings.insert(id.clone(), warning);
        id
    }

    /// All warnings, newest first
    pub fn get_all_warnings(&self) -> Vec<Warning> {
        let mut all: Vec<Warning> = self.warnings.read().values().cloned().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        all
    }

    pub fn get_warnings_by_category(&self, category: WarningCategory) -> Vec<Warning> {
        self.get_all_warnings()
            .into_iter()
            .filter(|w| w.category == category)
            .collect()
    }

    pub fn get_unacknowledged_warnings(&self) -> Vec<Warning> {
        self.get_all_warnings()
            .into_iter()
            .filter(|w| !w.acknowledged)
            .collect()
    }

    pub fn acknowledge_warning(&self, id: &str) -> bool {
        match self.warnings.write().get_mut(id) {
            Some(warning) => {
                warning.acknowledged = true;
                true
            }
            None => false,
        }
    }

    pub fn warning_count(&self) -> usize {
        self.warnings.read().len()
    }

    pub fn unacknowledged_count(&self) -> usize {
        self.warnings.read().values().filter(|w| !w.acknowledged).count()
    }

    pub fn has_critical_warnings(&self) -> bool {
        self.warnings
            .read()
            .values()
            .any(|w| w.severity == WarningSeverity::Critical && !w.acknowledged)
    }

    /// Drop warnings past the maximum age. Returns how many were removed.
    pub fn cleanup(&self) -> usize {
        let threshold_minutes = self.config.max_warning_age_hours * 60;
        let mut warnings = self.warnings.write();
        let before = warnings.len();
        warnings.retain(|_, w| w.age_minutes() <= threshold_minutes);

        let removed = before - warnings.len();
        if removed > 0 {
            info!(removed, "Cleared old warnings");
        }
        removed
    }

    fn evict_oldest(warnings: &mut HashMap<String, Warning>, count: usize) {
        let mut by_age: Vec<_> = warnings.values().map(|w| (w.created_at, w.id.clone())).collect();
        by_age.sort();
        for (_, id) in by_age.into_iter().take(count) {
            warnings.remove(&id);
        }
    }
}

impl Default for WarningService {
    fn default() -> Self {
        Self::new(WarningServiceConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    #[test]
    fn test_add_and_filter() {
        let service = WarningService::default();
        service.add_warning(WarningCategory::Routing, WarningSeverity::Warn, "unknown pool X", "router");
        service.add_warning(WarningCategory::QueueBacklog, WarningSeverity::Warn, "backlog", "health");

        assert_eq!(service.warning_count(), 2);
        let routing = service.get_warnings_by_category(WarningCategory::Routing);
        assert_eq!(routing.len(), 1);
        assert_eq!(routing[0].message, "unknown pool X");
    }

    #[test]
    fn test_acknowledge_warning() {
        let service = WarningService::default();
        let id = service.add_warning(WarningCategory::Configuration, WarningSeverity::Error, "bad target", "pool");
        assert_eq!(service.unacknowledged_count(), 1);

        assert!(service.acknowledge_warning(&id));
        assert!(!service.acknowledge_warning("missing"));
        assert_eq!(service.unacknowledged_count(), 0);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let service = WarningService::new(WarningServiceConfig {
            max_warnings: 3,
            ..Default::default()
        });
        let first = service.add_warning(WarningCategory::Routing, WarningSeverity::Info, "0", "t");
        // Make the first one unambiguously the oldest
        service.warnings.write().get_mut(&first).unwrap().created_at = Utc::now() - Duration::minutes(5);

        for i in 1..=3 {
            service.add_warning(WarningCategory::Routing, WarningSeverity::Info, i.to_string(), "t");
        }
        assert_eq!(service.warning_count(), 3);
        assert!(service.get_all_warnings().iter().all(|w| w.id != first));
    }

    #[test]
    fn test_cleanup_removes_aged_warnings() {
        let service = WarningService::default();
        let old = service.add_warning(WarningCategory::CircuitBreaker, WarningSeverity::Warn, "old", "t");
        service.add_warning(WarningCategory::CircuitBreaker, WarningSeverity::Warn, "new", "t");
        service.warnings.write().get_mut(&old).unwrap().created_at = Utc::now() - Duration::hours(25);

        assert_eq!(service.cleanup(), 1);
        assert_eq!(service.get_all_warnings()[0].message, "new");
    }

    #[test]
    fn test_critical_detection() {
        let service = WarningService::default();
        assert!(!service.has_critical_warnings());
        service.add_warning(WarningCategory::ConsumerHealth, WarningSeverity::Critical, "stalled", "t");
        assert!(service.has_critical_warnings());
    }
}
