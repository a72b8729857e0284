use std::time::Duration;

use converge_apply::ApplyConfig;
use serde::{Deserialize, Serialize};

fn env_flag(name: &str) -> bool {
    std::env::var(name).ok().map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false)
}

/// Settings for every pass run by one [`crate::Reconciler`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileConfig {
    pub apply: ApplyConfig,
    /// Whole-pass deadline; in-flight cluster calls are aborted when it passes.
    pub pass_timeout: Duration,
    /// Re-apply every object even when its stored hash matches.
    pub force: bool,
}

impl Default for ReconcileConfig {
    fn default() -> Self { Self { apply: ApplyConfig::default(), pass_timeout: Duration::from_secs(300), force: false } }
}

impl ReconcileConfig {
    pub fn from_env() -> Self {
        let secs = std::env::var("CONVERGE_PASS_TIMEOUT_SECS").ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(300);
        Self { apply: ApplyConfig::from_env(), pass_timeout: Duration::from_secs(secs), force: env_flag("CONVERGE_FORCE") }
    }

    pub fn dry_run(&self) -> bool { self.apply.dry_run }
}
