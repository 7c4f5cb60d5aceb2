use moeviz::event::{ExpertSelection, RoutingEvent, TokenField};
use moeviz::topology::ModelEntry;
use moeviz_server::WebsocketServerClientMessage;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::sleep;

// Only the first MoE layer is captured, matching the server-side hook setup.
const CAPTURED_LAYER: u32 = 0;
const SYNTH_VOCAB_SIZE: u32 = 32_000;
const STREAM_INTERVAL: Duration = Duration::from_millis(25);

const CONTINUATION: &[&str] = &[
    " routing", " every", " token", " through", " a", " small", " subset", " of",
    " experts", " keeps", " the", " compute", " cost", " low", " while", " the",
    " parameter", " count", " stays", " huge", ".",
];

fn stable_hash(parts: &[u64]) -> u64 {
    let mut hasher = DefaultHasher::new();
    for part in parts {
        part.hash(&mut hasher);
    }
    hasher.finish()
}

fn synth_token_id(text: &str) -> u32 {
    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    (hasher.finish() % SYNTH_VOCAB_SIZE as u64) as u32
}

/// Top-k expert pick for one token position, deterministic in
/// (position, layer, k) so replays of the same prompt shape look the same.
fn pick_experts(token_pos: u32, expert_count: u32, top_k: u32) -> Vec<u32> {
    let top_k = top_k.min(expert_count);
    let mut picks = Vec::with_capacity(top_k as usize);
    for k in 0..top_k {
        let mut candidate =
            (stable_hash(&[token_pos as u64, CAPTURED_LAYER as u64, k as u64]) % expert_count as u64)
                as u32;
        while picks.contains(&candidate) {
            candidate = (candidate + 1) % expert_count;
        }
        picks.push(candidate);
    }
    picks
}

/// Streams synthetic routing events in place of a live model process: one
/// batched prefill event for the prompt, then one event per generated
/// token, then the completion signal. Refuses to start while a generation
/// is already running.
pub(crate) struct GenerationDriver {
    events: broadcast::Sender<WebsocketServerClientMessage>,
    running: Arc<AtomicBool>,
    max_new_tokens: u32,
}

impl GenerationDriver {
    pub(crate) fn new(
        events: broadcast::Sender<WebsocketServerClientMessage>,
        max_new_tokens: u32,
    ) -> Self {
        Self {
            events,
            running: Arc::new(AtomicBool::new(false)),
            max_new_tokens,
        }
    }

    /// Start a generation task, returning a handle that resolves to the
    /// generated text. The busy flag is released when the task finishes.
    pub(crate) fn try_start(
        &self,
        prompt: String,
        entry: &ModelEntry,
    ) -> Result<tokio::task::JoinHandle<String>, String> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err("a generation is already running".to_string());
        }
        let events = self.events.clone();
        let running = self.running.clone();
        let expert_count = entry.expert_count;
        let top_k = entry.top_k;
        let max_new_tokens = self.max_new_tokens;
        Ok(tokio::spawn(async move {
            let text =
                run_generation(&events, &prompt, expert_count, top_k, max_new_tokens).await;
            running.store(false, Ordering::SeqCst);
            text
        }))
    }
}

async fn run_generation(
    events: &broadcast::Sender<WebsocketServerClientMessage>,
    prompt: &str,
    expert_count: u32,
    top_k: u32,
    max_new_tokens: u32,
) -> String {
    // Whitespace "tokenization" is crude but gives the stream realistic
    // prefill batching and decoded text.
    let prompt_tokens: Vec<String> = prompt
        .split_whitespace()
        .enumerate()
        .map(|(i, word)| {
            if i == 0 {
                word.to_string()
            } else {
                format!(" {word}")
            }
        })
        .collect();

    if !prompt_tokens.is_empty() {
        let token_ids: Vec<u32> = prompt_tokens.iter().map(|t| synth_token_id(t)).collect();
        let expert_lists: Vec<Vec<u32>> = (0..token_ids.len())
            .map(|i| pick_experts(i as u32, expert_count, top_k))
            .collect();
        let prefill = RoutingEvent {
            layer_id: CAPTURED_LAYER,
            tokens: TokenField::Many(token_ids),
            selected_experts: Some(ExpertSelection::PerToken(expert_lists)),
            decoded_tokens: Some(prompt_tokens.clone()),
        };
        let _ = events.send(WebsocketServerClientMessage::RoutingUpdate(prefill));
    }

    let new_tokens = (max_new_tokens as usize).min(CONTINUATION.len());
    let mut generated = String::new();
    for step in 0..new_tokens {
        sleep(STREAM_INTERVAL).await;
        let text = CONTINUATION[step];
        generated.push_str(text);
        let token_pos = (prompt_tokens.len() + step) as u32;
        let event = RoutingEvent {
            layer_id: CAPTURED_LAYER,
            tokens: TokenField::One(synth_token_id(text)),
            selected_experts: Some(ExpertSelection::Broadcast(pick_experts(
                token_pos,
                expert_count,
                top_k,
            ))),
            decoded_tokens: Some(vec![text.to_string()]),
        };
        let _ = events.send(WebsocketServerClientMessage::RoutingUpdate(event));
    }

    let _ = events.send(WebsocketServerClientMessage::GenerationComplete);
    log::info!(
        "generation finished: {} prompt token(s), {new_tokens} new token(s)",
        prompt_tokens.len()
    );
    format!("{prompt}{generated}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expert_picks_are_deterministic_unique_and_in_range() {
        for pos in 0..64 {
            let picks = pick_experts(pos, 60, 4);
            assert_eq!(picks, pick_experts(pos, 60, 4));
            assert_eq!(picks.len(), 4);
            let mut deduped = picks.clone();
            deduped.sort_unstable();
            deduped.dedup();
            assert_eq!(deduped.len(), 4);
            assert!(picks.iter().all(|&e| e < 60));
        }
    }

    #[test]
    fn top_k_clamps_to_expert_count() {
        let picks = pick_experts(0, 2, 4);
        assert_eq!(picks.len(), 2);
    }
}
