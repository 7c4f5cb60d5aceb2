/// Upper bound of the color domain, in token positions. Fixed rather than
/// data-dependent so a token keeps its color as more of the stream arrives,
/// and so the chart and the token strip agree. Matches the generation cap
/// (`MOEVIZ_MAX_NEW_TOKENS` default).
pub const COLOR_DOMAIN_MAX: u32 = 128;

/// Fixed layout tunables. `padding` is the fraction of each expert slot
/// reserved as inter-column gap.
#[derive(Debug, Clone, PartialEq)]
pub struct LayoutTunables {
    pub min_block_width: f32,
    pub padding: f32,
    pub block_height: f32,
    pub text_threshold_full: f32,
    pub text_threshold_abbrev: f32,
}

impl Default for LayoutTunables {
    fn default() -> Self {
        Self {
            min_block_width: 24.0,
            padding: 0.1,
            block_height: 18.0,
            text_threshold_full: 56.0,
            text_threshold_abbrev: 32.0,
        }
    }
}

/// Per-block label rendering tier. Labels overflow their block below each
/// width threshold, so they degrade to an abbreviation and then to nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelPolicy {
    Full,
    Abbreviated,
    Hidden,
}

/// Derived layout, recomputed on topology or viewport change. Free of side
/// effects; recomputing is always safe.
#[derive(Debug, Clone, PartialEq)]
pub struct LayoutState {
    pub block_width: f32,
    pub block_height: f32,
    pub total_width: f32,
    pub needs_horizontal_scroll: bool,
    pub color_domain_max: u32,
}

impl LayoutState {
    pub fn compute(expert_count: u32, viewport_width: f32, tunables: &LayoutTunables) -> Self {
        let raw_width = viewport_width / expert_count as f32 * (1.0 - tunables.padding);
        // Clamping up keeps small blocks legible; for large expert counts
        // this pushes total content width past the viewport, which is what
        // triggers horizontal scrolling.
        let block_width = raw_width.max(tunables.min_block_width);
        let total_width = block_width * expert_count as f32 / (1.0 - tunables.padding);
        // Half a pixel of slack: when no block was clamped, total width
        // equals the viewport up to rounding, and that must not scroll.
        Self {
            block_width,
            block_height: tunables.block_height,
            total_width,
            needs_horizontal_scroll: total_width - viewport_width > 0.5,
            color_domain_max: COLOR_DOMAIN_MAX,
        }
    }

    pub fn label_policy(&self, tunables: &LayoutTunables) -> LabelPolicy {
        if self.block_width >= tunables.text_threshold_full {
            LabelPolicy::Full
        } else if self.block_width >= tunables.text_threshold_abbrev {
            LabelPolicy::Abbreviated
        } else {
            LabelPolicy::Hidden
        }
    }

    /// Horizontal stride of one expert slot, block plus gap.
    pub fn slot_stride(&self, expert_count: u32) -> f32 {
        self.total_width / expert_count as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn few_experts_fit_the_viewport() {
        let tunables = LayoutTunables::default();
        let layout = LayoutState::compute(8, 960.0, &tunables);
        assert!(layout.block_width > tunables.min_block_width);
        assert!(!layout.needs_horizontal_scroll);
        assert_eq!(layout.label_policy(&tunables), LabelPolicy::Full);
    }

    #[test]
    fn many_experts_trigger_horizontal_scroll() {
        let tunables = LayoutTunables::default();
        let layout = LayoutState::compute(60, 960.0, &tunables);
        assert_eq!(layout.block_width, tunables.min_block_width);
        assert!(layout.total_width > 960.0);
        assert!(layout.needs_horizontal_scroll);
        assert_eq!(layout.label_policy(&tunables), LabelPolicy::Hidden);
    }

    #[test]
    fn label_policy_tiers_with_block_width() {
        let tunables = LayoutTunables::default();
        let narrow = LayoutState::compute(20, 960.0, &tunables);
        assert_eq!(narrow.label_policy(&tunables), LabelPolicy::Abbreviated);
    }

    #[test]
    fn total_width_accounts_for_padding() {
        let tunables = LayoutTunables::default();
        let layout = LayoutState::compute(10, 1000.0, &tunables);
        let expected = layout.block_width * 10.0 / (1.0 - tunables.padding);
        assert!((layout.total_width - expected).abs() < f32::EPSILON * 1000.0);
    }
}
