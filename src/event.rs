use serde::{Deserialize, Serialize};

use crate::routing_log::RoutingRecord;

/// Token payload of a routing event. Prefill reports a whole batch of
/// tokens at once; incremental decode usually reports a single id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TokenField {
    One(u32),
    Many(Vec<u32>),
}

impl TokenField {
    pub fn as_slice(&self) -> &[u32] {
        match self {
            TokenField::One(id) => std::slice::from_ref(id),
            TokenField::Many(ids) => ids.as_slice(),
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_slice().is_empty()
    }
}

/// Expert selection payload. `PerToken` is index-aligned with the event's
/// tokens; `Broadcast` is one flat list applied to every token. The variant
/// order matters: serde tries `PerToken` first, which is exactly the
/// "is the first element itself a sequence" disambiguation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExpertSelection {
    PerToken(Vec<Vec<u32>>),
    Broadcast(Vec<u32>),
}

impl ExpertSelection {
    pub fn is_empty(&self) -> bool {
        match self {
            ExpertSelection::PerToken(lists) => lists.is_empty(),
            ExpertSelection::Broadcast(list) => list.is_empty(),
        }
    }

    /// Expert ids for the i-th token of the event. A `PerToken` list shorter
    /// than the token batch yields an empty slice for the missing indices:
    /// no records are emitted for that token, so its position never enters
    /// the log and the next event hands the same value out again. This
    /// mirrors the upstream capture hooks, which can truncate the
    /// per-token lists.
    fn for_token(&self, i: usize) -> &[u32] {
        match self {
            ExpertSelection::PerToken(lists) => {
                lists.get(i).map(|l| l.as_slice()).unwrap_or(&[])
            }
            ExpertSelection::Broadcast(list) => list.as_slice(),
        }
    }
}

/// Raw routing event as produced by the capture hooks on the model server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingEvent {
    pub layer_id: u32,
    pub tokens: TokenField,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_experts: Option<ExpertSelection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decoded_tokens: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NormalizeError {
    #[error("routing event for layer {layer_id} reports {token_count} token(s) but no expert data")]
    MissingExperts { layer_id: u32, token_count: usize },
}

/// Flatten a raw routing event into one record per (token, expert) pair.
///
/// `base_pos` is the number of distinct token positions already logged, so
/// the i-th token of this event lands at `base_pos + i`. Positions are
/// assigned once per token, however many experts it is routed to.
///
/// An event with zero tokens is a no-op. An event with tokens but absent or
/// empty expert data is malformed: the caller drops it without touching the
/// log.
pub fn normalize(
    event: &RoutingEvent,
    base_pos: u32,
) -> Result<Vec<RoutingRecord>, NormalizeError> {
    let tokens = event.tokens.as_slice();
    if tokens.is_empty() {
        return Ok(Vec::new());
    }
    let experts = match &event.selected_experts {
        Some(experts) if !experts.is_empty() => experts,
        _ => {
            return Err(NormalizeError::MissingExperts {
                layer_id: event.layer_id,
                token_count: tokens.len(),
            });
        }
    };

    let mut records = Vec::new();
    for (i, &token_id) in tokens.iter().enumerate() {
        let token_pos = base_pos + i as u32;
        // Stringified id when the transport supplies no text (or a decoded
        // list shorter than the token batch).
        let decoded_token = Some(
            event
                .decoded_tokens
                .as_ref()
                .and_then(|decoded| decoded.get(i))
                .cloned()
                .unwrap_or_else(|| token_id.to_string()),
        );
        for &expert_id in experts.for_token(i) {
            records.push(RoutingRecord {
                layer_id: event.layer_id,
                token_id,
                decoded_token: decoded_token.clone(),
                expert_id,
                token_pos,
            });
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing_log::RoutingLog;

    fn event(
        layer_id: u32,
        tokens: TokenField,
        selected_experts: Option<ExpertSelection>,
        decoded_tokens: Option<Vec<&str>>,
    ) -> RoutingEvent {
        RoutingEvent {
            layer_id,
            tokens,
            selected_experts,
            decoded_tokens: decoded_tokens
                .map(|d| d.into_iter().map(str::to_string).collect()),
        }
    }

    #[test]
    fn batched_event_assigns_one_position_per_token() {
        let ev = event(
            0,
            TokenField::Many(vec![5, 9]),
            Some(ExpertSelection::PerToken(vec![vec![1, 2], vec![2]])),
            Some(vec!["The", "cat"]),
        );
        let records = normalize(&ev, 0).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!((records[0].token_pos, records[0].expert_id), (0, 1));
        assert_eq!((records[1].token_pos, records[1].expert_id), (0, 2));
        assert_eq!((records[2].token_pos, records[2].expert_id), (1, 2));
        assert_eq!(records[0].decoded_token.as_deref(), Some("The"));
        assert_eq!(records[2].decoded_token.as_deref(), Some("cat"));
    }

    #[test]
    fn scalar_token_with_broadcast_experts() {
        let ev = event(
            1,
            TokenField::One(7),
            Some(ExpertSelection::Broadcast(vec![0, 3])),
            None,
        );
        let records = normalize(&ev, 0).unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.token_pos == 0 && r.token_id == 7));
        assert_eq!(records[0].expert_id, 0);
        assert_eq!(records[1].expert_id, 3);
        // No decoded text on the wire: the record carries the stringified id.
        assert_eq!(records[0].decoded_token.as_deref(), Some("7"));
    }

    #[test]
    fn empty_expert_list_is_malformed() {
        let ev = event(
            0,
            TokenField::Many(vec![1]),
            Some(ExpertSelection::PerToken(vec![])),
            None,
        );
        assert_eq!(
            normalize(&ev, 0),
            Err(NormalizeError::MissingExperts {
                layer_id: 0,
                token_count: 1
            })
        );
    }

    #[test]
    fn missing_experts_is_malformed() {
        let ev = event(0, TokenField::Many(vec![1, 2]), None, None);
        assert!(normalize(&ev, 0).is_err());
    }

    #[test]
    fn zero_tokens_is_a_noop() {
        let ev = event(0, TokenField::Many(vec![]), None, None);
        assert_eq!(normalize(&ev, 0).unwrap(), vec![]);
    }

    #[test]
    fn ragged_per_token_list_leaves_the_position_for_the_next_event() {
        // Third token has no expert list: nothing is recorded for it, so
        // position 2 never enters the log and the next event gets it.
        let ev = event(
            0,
            TokenField::Many(vec![10, 11, 12]),
            Some(ExpertSelection::PerToken(vec![vec![0], vec![1]])),
            None,
        );
        let records = normalize(&ev, 0).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records.iter().map(|r| r.token_pos).max(), Some(1));

        // Numbering stays gapless: the follow-up event starts at the
        // dropped value, not past it.
        let mut log = RoutingLog::new();
        log.append(records);
        assert_eq!(log.unique_token_count(), 2);
        let next = event(
            0,
            TokenField::One(13),
            Some(ExpertSelection::Broadcast(vec![3])),
            None,
        );
        let next_records = normalize(&next, log.unique_token_count()).unwrap();
        assert_eq!(next_records[0].token_pos, 2);
    }

    #[test]
    fn base_pos_offsets_positions() {
        let ev = event(
            2,
            TokenField::Many(vec![4, 5]),
            Some(ExpertSelection::Broadcast(vec![6])),
            None,
        );
        let records = normalize(&ev, 17).unwrap();
        assert_eq!(records[0].token_pos, 17);
        assert_eq!(records[1].token_pos, 18);
    }

    #[test]
    fn wire_shapes_deserialize_both_forms() {
        let two_d: RoutingEvent = serde_json::from_str(
            r#"{"layer_id":0,"tokens":[5,9],"selected_experts":[[1,2],[2]],"decoded_tokens":["The","cat"]}"#,
        )
        .unwrap();
        assert_eq!(
            two_d.selected_experts,
            Some(ExpertSelection::PerToken(vec![vec![1, 2], vec![2]]))
        );

        let broadcast: RoutingEvent =
            serde_json::from_str(r#"{"layer_id":1,"tokens":7,"selected_experts":[0,3]}"#).unwrap();
        assert_eq!(broadcast.tokens, TokenField::One(7));
        assert_eq!(
            broadcast.selected_experts,
            Some(ExpertSelection::Broadcast(vec![0, 3]))
        );
    }
}
