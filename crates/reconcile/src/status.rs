//! Where recorded state goes after each pass.

use anyhow::Context;
use converge_persist::{now_ts, HistoryStore, PassRecord, SqliteStore};
use tracing::{info, warn};

use crate::ReconcileState;

pub trait StatusSink: Send + Sync {
    fn record(&self, state: &ReconcileState) -> anyhow::Result<()>;
}

/// Structured log summary of the last pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl StatusSink for LogSink {
    fn record(&self, state: &ReconcileState) -> anyhow::Result<()> {
        let st = &state.status;
        for c in &st.components {
            info!(
                owner = %state.spec.owner,
                component = %c.name,
                phase = ?c.phase,
                created = c.created,
                updated = c.updated,
                unchanged = c.unchanged,
                pruned = c.pruned,
                failed = c.failed,
                "component status"
            );
        }
        for f in &st.failures {
            warn!(owner = %state.spec.owner, failure = %f, "reconcile failure");
        }
        info!(owner = %state.spec.owner, passes = st.passes, healthy = st.is_healthy(), "status recorded");
        Ok(())
    }
}

/// Build the history row for the state's last pass.
pub fn pass_record(state: &ReconcileState) -> anyhow::Result<PassRecord> {
    let st = &state.status;
    let pass_id = st.last_pass.context("no pass recorded yet")?;
    Ok(PassRecord {
        pass_id: pass_id.to_string(),
        owner: state.spec.owner.clone(),
        revision: st.revision.clone().unwrap_or_default(),
        ts: now_ts(),
        failed: st.components.iter().filter(|c| c.is_failed()).count(),
        summary_json: serde_json::to_string(st).context("serializing status")?,
    })
}

impl StatusSink for SqliteStore {
    fn record(&self, state: &ReconcileState) -> anyhow::Result<()> {
        self.put_pass(&pass_record(state)?)
    }
}
