use crate::event::{self, NormalizeError, RoutingEvent};
use crate::layout::{LayoutState, LayoutTunables};
use crate::routing_log::RoutingLog;
use crate::scene::{DisplayMode, Scene};
use crate::topology::{ModelRegistry, TopologyConfig, TopologyError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Generating,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error("a generation is already running")]
    AlreadyGenerating,
}

/// Which side of the hover sync published the current focus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FocusSource {
    Chart,
    TokenPanel,
}

/// Shared focus for block/token hover sync. Both views publish into this
/// and read from it; neither touches the other's presentation state. A
/// publisher can only clear its own focus, so the chart losing hover does
/// not cancel a highlight the token panel still holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FocusState {
    focused: Option<(FocusSource, u32)>,
}

impl FocusState {
    pub fn set(&mut self, source: FocusSource, token_pos: u32) {
        self.focused = Some((source, token_pos));
    }

    pub fn clear(&mut self, source: FocusSource) {
        if matches!(self.focused, Some((holder, _)) if holder == source) {
            self.focused = None;
        }
    }

    pub fn focused_pos(&self) -> Option<u32> {
        self.focused.map(|(_, pos)| pos)
    }

    pub fn is_focused(&self, token_pos: u32) -> bool {
        self.focused_pos() == Some(token_pos)
    }
}

/// Disposition of a generation acknowledgement, after staleness filtering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckDisposition {
    Accepted { message: String },
    Failed { error: String },
    Stale,
}

/// Orchestrates the session lifecycle: start generation (reset state),
/// ingest events (normalize → append), end generation, change model
/// (reset + reconfigure). Owns the routing log, the layout cache, and the
/// hover focus; all transitions run to completion on one thread.
pub struct SessionController {
    registry: ModelRegistry,
    topology: TopologyConfig,
    log: RoutingLog,
    tunables: LayoutTunables,
    display_mode: DisplayMode,
    state: SessionState,
    session_token: u64,
    malformed_events: u64,
    layout_cache: Option<(u32, f32, LayoutState)>,
    focus: FocusState,
}

impl SessionController {
    pub fn new(registry: ModelRegistry) -> Result<Self, TopologyError> {
        let topology = registry.topology(registry.default_model_id())?;
        Ok(Self {
            registry,
            topology,
            log: RoutingLog::new(),
            tunables: LayoutTunables::default(),
            display_mode: DisplayMode::default(),
            state: SessionState::Idle,
            session_token: 0,
            malformed_events: 0,
            layout_cache: None,
            focus: FocusState::default(),
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn log(&self) -> &RoutingLog {
        &self.log
    }

    pub fn topology(&self) -> &TopologyConfig {
        &self.topology
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn display_mode(&self) -> DisplayMode {
        self.display_mode
    }

    pub fn set_display_mode(&mut self, mode: DisplayMode) {
        self.display_mode = mode;
    }

    pub fn session_token(&self) -> u64 {
        self.session_token
    }

    pub fn malformed_events(&self) -> u64 {
        self.malformed_events
    }

    /// Start a new generation session. Rejected while one is running; the
    /// caller treats the rejection as a no-op, not a queue. On success the
    /// log is cleared and a fresh session token is returned for matching
    /// the eventual acknowledgement.
    pub fn begin_generation(&mut self) -> Result<u64, SubmitError> {
        if self.state == SessionState::Generating {
            return Err(SubmitError::AlreadyGenerating);
        }
        self.session_token += 1;
        self.log.reset();
        self.focus = FocusState::default();
        self.malformed_events = 0;
        self.state = SessionState::Generating;
        log::info!("session {} started", self.session_token);
        Ok(self.session_token)
    }

    /// Handle the generation request's acknowledgement. An ack carrying a
    /// superseded session token is discarded without side effects; a
    /// failure for the current session reverts to Idle so the user can
    /// resubmit.
    pub fn acknowledge(
        &mut self,
        session_token: u64,
        result: Result<String, String>,
    ) -> AckDisposition {
        if session_token != self.session_token {
            log::debug!(
                "dropping stale ack for session {session_token} (current {})",
                self.session_token
            );
            return AckDisposition::Stale;
        }
        match result {
            Ok(message) => AckDisposition::Accepted { message },
            Err(error) => {
                self.state = SessionState::Idle;
                log::warn!("generation request failed: {error}");
                AckDisposition::Failed { error }
            }
        }
    }

    /// Completion signal from the stream.
    pub fn complete_generation(&mut self) {
        if self.state == SessionState::Generating {
            log::info!(
                "session {} complete: {} token(s), {} record(s)",
                self.session_token,
                self.log.unique_token_count(),
                self.log.len()
            );
            self.state = SessionState::Idle;
        }
    }

    /// Normalize and append one routing event. Malformed events are
    /// counted and dropped; the log is never touched by a failed event.
    pub fn ingest(&mut self, event: &RoutingEvent) -> Result<usize, NormalizeError> {
        let base_pos = self.log.unique_token_count();
        match event::normalize(event, base_pos) {
            Ok(records) => {
                let appended = records.len();
                self.log.append(records);
                Ok(appended)
            }
            Err(err) => {
                self.malformed_events += 1;
                log::warn!("dropping malformed routing event: {err}");
                Err(err)
            }
        }
    }

    /// Project the current log to a scene. The layout is cached per
    /// (expert count, viewport width) pair; the scene itself is rebuilt
    /// from scratch every call.
    pub fn render(&mut self, viewport_width: f32) -> Scene {
        let expert_count = self.topology.expert_count();
        let layout = match &self.layout_cache {
            Some((cached_count, cached_width, layout))
                if *cached_count == expert_count && *cached_width == viewport_width =>
            {
                layout.clone()
            }
            _ => {
                let layout = LayoutState::compute(expert_count, viewport_width, &self.tunables);
                self.layout_cache = Some((expert_count, viewport_width, layout.clone()));
                layout
            }
        };
        Scene::build(&self.log, &self.topology, &layout, &self.tunables, self.display_mode)
    }

    /// Override the active topology's expert count. Invalidates the log
    /// and the layout cache.
    pub fn set_expert_count(&mut self, expert_count: u32) -> Result<(), TopologyError> {
        self.topology = self.topology.with_expert_count(expert_count)?;
        self.on_topology_changed();
        Ok(())
    }

    /// Switch to another registered model. Permitted mid-generation; the
    /// log is cleared either way.
    pub fn select_model(&mut self, model_id: &str) -> Result<(), TopologyError> {
        self.topology = self.registry.topology(model_id)?;
        self.on_topology_changed();
        Ok(())
    }

    /// Apply one model entry from a served config report. If it reshapes
    /// the active model, the topology change takes effect immediately.
    pub fn apply_model_override(
        &mut self,
        model_id: &str,
        display_name: String,
        expert_count: u32,
    ) {
        if expert_count == 0 {
            log::warn!("ignoring config override for {model_id:?} with zero experts");
            return;
        }
        self.registry
            .apply_override(model_id, display_name, expert_count);
        if self.topology.model_id() == model_id
            && self.topology.expert_count() != expert_count
        {
            if let Ok(topology) = self.registry.topology(model_id) {
                self.topology = topology;
                self.on_topology_changed();
            }
        }
    }

    pub fn reset_session(&mut self) {
        self.log.reset();
        self.focus = FocusState::default();
        self.malformed_events = 0;
        self.state = SessionState::Idle;
    }

    fn on_topology_changed(&mut self) {
        self.log.reset();
        self.focus = FocusState::default();
        self.layout_cache = None;
    }

    pub fn focus(&mut self, source: FocusSource, token_pos: u32) {
        self.focus.set(source, token_pos);
    }

    pub fn clear_focus(&mut self, source: FocusSource) {
        self.focus.clear(source);
    }

    pub fn focused_pos(&self) -> Option<u32> {
        self.focus.focused_pos()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ExpertSelection, TokenField};

    fn controller() -> SessionController {
        let mut c = SessionController::new(ModelRegistry::builtin()).unwrap();
        c.set_expert_count(8).unwrap();
        c
    }

    fn one_token_event(token_id: u32, experts: Vec<u32>) -> RoutingEvent {
        RoutingEvent {
            layer_id: 0,
            tokens: TokenField::One(token_id),
            selected_experts: Some(ExpertSelection::Broadcast(experts)),
            decoded_tokens: None,
        }
    }

    #[test]
    fn second_submission_is_rejected_while_generating() {
        let mut c = controller();
        c.begin_generation().unwrap();
        assert_eq!(c.begin_generation(), Err(SubmitError::AlreadyGenerating));
        c.complete_generation();
        assert!(c.begin_generation().is_ok());
    }

    #[test]
    fn stale_ack_is_silently_discarded() {
        let mut c = controller();
        let first = c.begin_generation().unwrap();
        c.complete_generation();
        let _second = c.begin_generation().unwrap();
        // The old session's ack arrives late; it must not disturb the new one.
        assert_eq!(
            c.acknowledge(first, Err("server went away".into())),
            AckDisposition::Stale
        );
        assert_eq!(c.state(), SessionState::Generating);
    }

    #[test]
    fn failed_ack_reverts_to_idle() {
        let mut c = controller();
        let token = c.begin_generation().unwrap();
        let disposition = c.acknowledge(token, Err("model not loaded".into()));
        assert!(matches!(disposition, AckDisposition::Failed { .. }));
        assert_eq!(c.state(), SessionState::Idle);
        assert!(c.begin_generation().is_ok());
    }

    #[test]
    fn sequential_events_never_reuse_or_skip_positions() {
        let mut c = controller();
        c.begin_generation().unwrap();
        c.ingest(&one_token_event(10, vec![0, 1, 2])).unwrap();
        c.ingest(&one_token_event(11, vec![3])).unwrap();
        let positions: Vec<u32> = c
            .log()
            .tokens_in_order()
            .iter()
            .map(|r| r.token_pos)
            .collect();
        assert_eq!(positions, vec![0, 1]);
        assert_eq!(c.log().unique_token_count(), 2);
    }

    #[test]
    fn malformed_event_leaves_the_log_untouched() {
        let mut c = controller();
        c.begin_generation().unwrap();
        c.ingest(&one_token_event(10, vec![0])).unwrap();
        let bad = RoutingEvent {
            layer_id: 0,
            tokens: TokenField::Many(vec![1]),
            selected_experts: Some(ExpertSelection::PerToken(vec![])),
            decoded_tokens: None,
        };
        assert!(c.ingest(&bad).is_err());
        assert_eq!(c.malformed_events(), 1);
        assert_eq!(c.log().len(), 1);
        assert_eq!(c.log().unique_token_count(), 1);
    }

    #[test]
    fn expert_count_change_clears_the_log() {
        let mut c = controller();
        c.begin_generation().unwrap();
        c.ingest(&one_token_event(10, vec![0])).unwrap();
        c.set_expert_count(5).unwrap();
        let groups = c.log().group_by_expert(c.topology().expert_count());
        assert_eq!(groups.len(), 5);
        assert!(groups.iter().all(|g| g.is_empty()));
    }

    #[test]
    fn model_selection_resets_and_reconfigures() {
        let mut c = SessionController::new(ModelRegistry::builtin()).unwrap();
        c.begin_generation().unwrap();
        c.ingest(&one_token_event(10, vec![0])).unwrap();
        c.select_model("mixtral-8x7b").unwrap();
        assert_eq!(c.topology().expert_count(), 8);
        assert!(c.log().is_empty());
        assert!(c.select_model("unknown").is_err());
    }

    #[test]
    fn config_override_of_active_model_takes_effect() {
        let mut c = SessionController::new(ModelRegistry::builtin()).unwrap();
        c.begin_generation().unwrap();
        c.ingest(&one_token_event(10, vec![0])).unwrap();
        let active = c.topology().model_id().to_string();
        c.apply_model_override(&active, "Qwen (served)".to_string(), 64);
        assert_eq!(c.topology().expert_count(), 64);
        assert!(c.log().is_empty());
    }

    #[test]
    fn render_uses_current_topology_for_axis_slots() {
        let mut c = controller();
        let scene = c.render(960.0);
        assert_eq!(scene.axis.len(), 8);
        c.set_expert_count(3).unwrap();
        let scene = c.render(960.0);
        assert_eq!(scene.axis.len(), 3);
    }

    #[test]
    fn focus_is_cleared_only_by_its_publisher() {
        let mut c = controller();
        c.focus(FocusSource::Chart, 4);
        assert_eq!(c.focused_pos(), Some(4));
        c.clear_focus(FocusSource::TokenPanel);
        assert_eq!(c.focused_pos(), Some(4));
        c.clear_focus(FocusSource::Chart);
        assert_eq!(c.focused_pos(), None);
    }
}
