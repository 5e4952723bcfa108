//! Rule synchronizer: reconcile active markets against the filter rules
//! registered on the post source.
//!
//! Deletes run before adds so slot quotas free up first. A failed add leaves
//! that market unregistered until the next sync.

use super::store_err;
use crate::errors::PipelineError;
use crate::models::{FilterRule, Market};
use crate::sources::{NewSourceRule, PostSource, SourceRule};
use crate::storage::{now_ms, ScoreStore};
use std::collections::HashSet;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Default)]
pub struct RuleSyncSummary {
    pub deleted: u32,
    pub added: u32,
    pub failed: u32,
}

#[derive(Debug, Clone, Default)]
pub struct RuleDiff {
    /// Registered rules to remove, deletes first.
    pub delete: Vec<SourceRule>,
    /// One rule per unregistered market, tagged with the market id.
    pub add: Vec<NewSourceRule>,
}

/// Diff registered rules against the active markets. A market participates
/// only with a non-empty template; untagged or stale-tagged rules are removed.
pub fn compute_diff(active: &[Market], registered: &[SourceRule]) -> RuleDiff {
    let live: Vec<&Market> = active
        .iter()
        .filter(|m| m.filter_templates.iter().any(|t| !t.trim().is_empty()))
        .collect();
    let live_ids: HashSet<&str> = live.iter().map(|m| m.market_id.as_str()).collect();

    let delete: Vec<SourceRule> = registered
        .iter()
        .filter(|r| match r.tag.as_deref() {
            Some(tag) => !live_ids.contains(tag),
            None => true,
        })
        .cloned()
        .collect();

    let registered_tags: HashSet<&str> = registered
        .iter()
        .filter_map(|r| r.tag.as_deref())
        .collect();

    let add: Vec<NewSourceRule> = live
        .iter()
        .filter(|m| !registered_tags.contains(m.market_id.as_str()))
        .filter_map(|m| {
            m.filter_templates
                .iter()
                .map(|t| t.trim())
                .find(|t| !t.is_empty())
                .map(|t| NewSourceRule {
                    value: t.to_string(),
                    tag: m.market_id.clone(),
                })
        })
        .collect();

    RuleDiff { delete, add }
}

/// Reconcile the desired rule set with the post source. Per-market add
/// failures are logged and retried on the next sync.
pub async fn sync_rules(
    store: &ScoreStore,
    source: &dyn PostSource,
) -> Result<RuleSyncSummary, PipelineError> {
    let active = store.list_active_markets().map_err(store_err)?;
    let registered = source.get_rules().await?;
    let diff = compute_diff(&active, &registered);

    let mut summary = RuleSyncSummary::default();

    if !diff.delete.is_empty() {
        let ids: Vec<String> = diff.delete.iter().map(|r| r.id.clone()).collect();
        match source.delete_rules(&ids).await {
            Ok(()) => {
                for rule in &diff.delete {
                    if let Some(tag) = rule.tag.as_deref() {
                        store.delete_rules_for_market(tag).map_err(store_err)?;
                    }
                }
                summary.deleted = ids.len() as u32;
            }
            Err(e) => {
                warn!("rule delete failed, will retry next sync: {e}");
                summary.failed += ids.len() as u32;
            }
        }
    }

    for rule in &diff.add {
        match source.add_rules(std::slice::from_ref(rule)).await {
            Ok(created) => {
                for c in &created {
                    store
                        .upsert_rule(&FilterRule {
                            market_id: rule.tag.clone(),
                            external_rule_id: c.id.clone(),
                            rule_value: c.value.clone(),
                            rule_tag: rule.tag.clone(),
                            created_at_ms: now_ms(),
                        })
                        .map_err(store_err)?;
                }
                summary.added += created.len() as u32;
            }
            Err(e) => {
                warn!(market_id = %rule.tag, "rule add failed, market stays unregistered: {e}");
                summary.failed += 1;
            }
        }
    }

    info!(
        deleted = summary.deleted,
        added = summary.added,
        failed = summary.failed,
        "rule sync complete"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::market_fixture;

    fn registered(id: &str, tag: Option<&str>) -> SourceRule {
        SourceRule {
            id: id.to_string(),
            value: "whatever".to_string(),
            tag: tag.map(|t| t.to_string()),
        }
    }

    #[test]
    fn adds_unregistered_active_markets() {
        let active = vec![market_fixture("m1", "Q?", &["btc", "bitcoin"])];
        let diff = compute_diff(&active, &[]);
        assert!(diff.delete.is_empty());
        assert_eq!(diff.add.len(), 1);
        assert_eq!(diff.add[0].tag, "m1");
        assert_eq!(diff.add[0].value, "btc");
    }

    #[test]
    fn deletes_rules_for_unknown_or_untagged_markets() {
        let active = vec![market_fixture("m1", "Q?", &["btc"])];
        let rules = vec![
            registered("r1", Some("m1")),
            registered("r2", Some("m_gone")),
            registered("r3", None),
        ];
        let diff = compute_diff(&active, &rules);
        let delete_ids: Vec<&str> = diff.delete.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(delete_ids, vec!["r2", "r3"]);
        assert!(diff.add.is_empty());
    }

    #[test]
    fn market_without_templates_is_not_desired() {
        let active = vec![market_fixture("m1", "Q?", &[])];
        let rules = vec![registered("r1", Some("m1"))];
        let diff = compute_diff(&active, &rules);
        assert_eq!(diff.delete.len(), 1);
        assert!(diff.add.is_empty());
    }

    #[test]
    fn aligned_state_is_a_no_op() {
        let active = vec![market_fixture("m1", "Q?", &["btc"])];
        let rules = vec![registered("r1", Some("m1"))];
        let diff = compute_diff(&active, &rules);
        assert!(diff.delete.is_empty());
        assert!(diff.add.is_empty());
    }
}
