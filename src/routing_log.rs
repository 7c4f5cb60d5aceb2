use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// One token-to-expert assignment at one layer. Immutable once created;
/// a token routed to k experts yields k records sharing a `token_pos`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingRecord {
    pub layer_id: u32,
    pub token_id: u32,
    pub decoded_token: Option<String>,
    pub expert_id: u32,
    pub token_pos: u32,
}

impl RoutingRecord {
    /// Human-readable label, falling back to the stringified vocabulary id
    /// when the transport supplied no decoded text.
    pub fn display_token(&self) -> String {
        self.decoded_token
            .clone()
            .unwrap_or_else(|| self.token_id.to_string())
    }
}

/// Append-only record log for the current generation session.
/// Insertion order is arrival order; reset happens exactly at session
/// start and on topology change.
#[derive(Debug, Default)]
pub struct RoutingLog {
    records: Vec<RoutingRecord>,
    seen_positions: HashSet<u32>,
}

impl RoutingLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, records: Vec<RoutingRecord>) {
        for record in records {
            self.seen_positions.insert(record.token_pos);
            self.records.push(record);
        }
    }

    pub fn reset(&mut self) {
        self.records.clear();
        self.seen_positions.clear();
    }

    pub fn records(&self) -> &[RoutingRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Count of distinct token positions logged so far. This, not the raw
    /// record count, is the `base_pos` for the next event: one token yields
    /// one record per expert it is routed to.
    pub fn unique_token_count(&self) -> u32 {
        self.seen_positions.len() as u32
    }

    /// One group per expert id in `0..expert_count`, each sorted by
    /// ascending token position (stacking order, oldest at the bottom).
    /// Experts with no routed tokens yield an empty group so the axis can
    /// still draw their slot. Records outside the id range are skipped;
    /// they can only appear transiently around a topology change.
    pub fn group_by_expert(&self, expert_count: u32) -> Vec<Vec<&RoutingRecord>> {
        let mut groups: Vec<Vec<&RoutingRecord>> = vec![Vec::new(); expert_count as usize];
        for record in &self.records {
            if let Some(group) = groups.get_mut(record.expert_id as usize) {
                group.push(record);
            }
        }
        for group in &mut groups {
            group.sort_by_key(|record| record.token_pos);
        }
        groups
    }

    /// First-seen record per distinct position, ascending. This is the
    /// token-strip view: one entry per token regardless of expert fan-out.
    pub fn tokens_in_order(&self) -> Vec<&RoutingRecord> {
        let mut seen = HashSet::new();
        let mut tokens: Vec<&RoutingRecord> = self
            .records
            .iter()
            .filter(|record| seen.insert(record.token_pos))
            .collect();
        tokens.sort_by_key(|record| record.token_pos);
        tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(expert_id: u32, token_pos: u32) -> RoutingRecord {
        RoutingRecord {
            layer_id: 0,
            token_id: 100 + token_pos,
            decoded_token: None,
            expert_id,
            token_pos,
        }
    }

    #[test]
    fn grouping_covers_every_expert_slot() {
        let mut log = RoutingLog::new();
        log.append(vec![record(2, 0), record(0, 1)]);
        let groups = log.group_by_expert(4);
        assert_eq!(groups.len(), 4);
        assert_eq!(groups[0].len(), 1);
        assert!(groups[1].is_empty());
        assert_eq!(groups[2].len(), 1);
        assert!(groups[3].is_empty());
    }

    #[test]
    fn grouping_on_empty_log_yields_empty_groups() {
        let log = RoutingLog::new();
        let groups = log.group_by_expert(8);
        assert_eq!(groups.len(), 8);
        assert!(groups.iter().all(|g| g.is_empty()));
    }

    #[test]
    fn groups_sort_by_token_position() {
        let mut log = RoutingLog::new();
        log.append(vec![record(1, 3), record(1, 0), record(1, 2)]);
        let groups = log.group_by_expert(2);
        let positions: Vec<u32> = groups[1].iter().map(|r| r.token_pos).collect();
        assert_eq!(positions, vec![0, 2, 3]);
    }

    #[test]
    fn unique_token_count_ignores_expert_fanout() {
        let mut log = RoutingLog::new();
        log.append(vec![record(0, 0), record(1, 0), record(2, 0), record(0, 1)]);
        assert_eq!(log.len(), 4);
        assert_eq!(log.unique_token_count(), 2);
    }

    #[test]
    fn reset_clears_everything() {
        let mut log = RoutingLog::new();
        log.append(vec![record(0, 0)]);
        log.reset();
        assert!(log.is_empty());
        assert_eq!(log.unique_token_count(), 0);
    }

    #[test]
    fn tokens_in_order_is_one_entry_per_position() {
        let mut log = RoutingLog::new();
        log.append(vec![record(5, 1), record(2, 0), record(3, 1), record(1, 2)]);
        let tokens = log.tokens_in_order();
        let positions: Vec<u32> = tokens.iter().map(|r| r.token_pos).collect();
        assert_eq!(positions, vec![0, 1, 2]);
    }
}
