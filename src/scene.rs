use serde::{Deserialize, Serialize};

use crate::layout::{LabelPolicy, LayoutState, LayoutTunables};
use crate::routing_log::RoutingLog;
use crate::topology::TopologyConfig;

/// Minimum chart height so the placeholder and axis have somewhere to live
/// before any data arrives.
pub const MIN_CHART_HEIGHT: f32 = 240.0;

/// Vertical space above the tallest stack reserved for the per-column count
/// headers.
pub const HEADER_SPACE: f32 = 24.0;

pub const EMPTY_PLACEHOLDER: &str = "Submit a prompt to watch expert routing";

/// What the token strip and block labels show.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumIter,
)]
pub enum DisplayMode {
    #[default]
    #[strum(to_string = "Token text")]
    Text,
    #[strum(to_string = "Token ids")]
    Ids,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

// Viridis anchor points, dark-to-light. Monotonic in perceived lightness,
// so later tokens always read as later.
const COLORMAP: [(u8, u8, u8); 9] = [
    (68, 1, 84),
    (72, 40, 120),
    (62, 74, 137),
    (49, 104, 142),
    (38, 130, 142),
    (31, 158, 137),
    (53, 183, 121),
    (109, 205, 89),
    (253, 231, 37),
];

/// Deterministic color for a token position over the fixed domain.
/// Positions past the domain end clamp to the final color.
pub fn position_color(token_pos: u32, domain_max: u32) -> Rgb {
    let t = if domain_max == 0 {
        0.0
    } else {
        (token_pos as f32 / domain_max as f32).min(1.0)
    };
    let scaled = t * (COLORMAP.len() - 1) as f32;
    let idx = (scaled as usize).min(COLORMAP.len() - 2);
    let frac = scaled - idx as f32;
    let (r0, g0, b0) = COLORMAP[idx];
    let (r1, g1, b1) = COLORMAP[idx + 1];
    let lerp = |a: u8, b: u8| (a as f32 + (b as f32 - a as f32) * frac).round() as u8;
    Rgb {
        r: lerp(r0, r1),
        g: lerp(g0, g1),
        b: lerp(b0, b1),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SceneRect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl SceneRect {
    pub fn contains(&self, x: f32, y: f32) -> bool {
        x >= self.x && x < self.x + self.width && y >= self.y && y < self.y + self.height
    }
}

/// One stacked block: a single (token, expert) routing assignment.
/// `token_pos` doubles as the stable cross-reference id for hover sync
/// with the token strip.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlockNode {
    pub expert_id: u32,
    pub token_pos: u32,
    pub rect: SceneRect,
    pub color: Rgb,
    pub label: Option<String>,
    pub hover_text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AxisSlot {
    pub expert_id: u32,
    pub x_center: f32,
    pub label: String,
    /// Record count header; only drawn once data exists.
    pub count: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Legend {
    /// Gradient samples as (fraction along the bar, color).
    pub stops: Vec<(f32, Rgb)>,
    /// Token-position tick values along the fixed domain.
    pub ticks: Vec<u32>,
}

/// One entry per distinct token position, for the side panel. Shares the
/// chart's colormap so hover sync reads naturally.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenEntry {
    pub token_pos: u32,
    pub token_id: u32,
    pub label: String,
    pub color: Rgb,
}

/// Fully resolved visual scene: a pure projection of the routing log under
/// the current topology and layout. Rebuilt from scratch on every render,
/// so repeated builds of the same state are structurally identical.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Scene {
    pub canvas_width: f32,
    pub canvas_height: f32,
    pub needs_horizontal_scroll: bool,
    pub blocks: Vec<BlockNode>,
    pub axis: Vec<AxisSlot>,
    pub legend: Option<Legend>,
    pub placeholder: Option<String>,
    pub tokens: Vec<TokenEntry>,
}

fn abbreviate(label: &str) -> String {
    let mut out: String = label.chars().take(3).collect();
    out.push('…');
    out
}

impl Scene {
    pub fn build(
        log: &RoutingLog,
        topology: &TopologyConfig,
        layout: &LayoutState,
        tunables: &LayoutTunables,
        display_mode: DisplayMode,
    ) -> Self {
        let expert_count = topology.expert_count();
        let groups = log.group_by_expert(expert_count);
        let stride = layout.slot_stride(expert_count);
        let label_policy = layout.label_policy(tunables);

        let tallest = groups.iter().map(|g| g.len()).max().unwrap_or(0);
        let canvas_height =
            (tallest as f32 * layout.block_height + HEADER_SPACE).max(MIN_CHART_HEIGHT);

        let axis = groups
            .iter()
            .enumerate()
            .map(|(expert_id, group)| AxisSlot {
                expert_id: expert_id as u32,
                x_center: expert_id as f32 * stride + stride / 2.0,
                label: expert_id.to_string(),
                count: if log.is_empty() { None } else { Some(group.len()) },
            })
            .collect();

        let mut blocks = Vec::with_capacity(log.len());
        for (expert_id, group) in groups.iter().enumerate() {
            let x = expert_id as f32 * stride + (stride - layout.block_width) / 2.0;
            for (i, record) in group.iter().enumerate() {
                let y = canvas_height - (i + 1) as f32 * layout.block_height;
                let token_label = record.display_token();
                let label = match label_policy {
                    LabelPolicy::Full => Some(token_label.clone()),
                    LabelPolicy::Abbreviated => Some(abbreviate(&token_label)),
                    LabelPolicy::Hidden => None,
                };
                blocks.push(BlockNode {
                    expert_id: expert_id as u32,
                    token_pos: record.token_pos,
                    rect: SceneRect {
                        x,
                        y,
                        width: layout.block_width,
                        height: layout.block_height,
                    },
                    color: position_color(record.token_pos, layout.color_domain_max),
                    label,
                    hover_text: format!(
                        "#{} {:?} (id {}) → expert {} @ layer {}",
                        record.token_pos,
                        token_label,
                        record.token_id,
                        record.expert_id,
                        record.layer_id,
                    ),
                });
            }
        }

        let legend = if log.is_empty() {
            None
        } else {
            let stops = (0..=16)
                .map(|i| {
                    let frac = i as f32 / 16.0;
                    let pos = (frac * layout.color_domain_max as f32).round() as u32;
                    (frac, position_color(pos, layout.color_domain_max))
                })
                .collect();
            let ticks = (0..=4)
                .map(|i| i * layout.color_domain_max / 4)
                .collect();
            Some(Legend { stops, ticks })
        };

        let tokens = log
            .tokens_in_order()
            .into_iter()
            .map(|record| TokenEntry {
                token_pos: record.token_pos,
                token_id: record.token_id,
                label: match display_mode {
                    DisplayMode::Text => record.display_token(),
                    DisplayMode::Ids => record.token_id.to_string(),
                },
                color: position_color(record.token_pos, layout.color_domain_max),
            })
            .collect();

        Scene {
            canvas_width: layout.total_width,
            canvas_height,
            needs_horizontal_scroll: layout.needs_horizontal_scroll,
            blocks,
            axis,
            legend,
            placeholder: if log.is_empty() {
                Some(EMPTY_PLACEHOLDER.to_string())
            } else {
                None
            },
            tokens,
        }
    }

    pub fn block_at(&self, x: f32, y: f32) -> Option<&BlockNode> {
        self.blocks.iter().find(|block| block.rect.contains(x, y))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing_log::RoutingRecord;

    fn record(expert_id: u32, token_pos: u32, decoded: Option<&str>) -> RoutingRecord {
        RoutingRecord {
            layer_id: 0,
            token_id: 40 + token_pos,
            decoded_token: decoded.map(str::to_string),
            expert_id,
            token_pos,
        }
    }

    fn topo(expert_count: u32) -> TopologyConfig {
        TopologyConfig::new("test-model", "Test Model", expert_count).unwrap()
    }

    fn layout(expert_count: u32) -> (LayoutState, LayoutTunables) {
        let tunables = LayoutTunables::default();
        (LayoutState::compute(expert_count, 960.0, &tunables), tunables)
    }

    #[test]
    fn empty_log_renders_axis_and_placeholder_without_legend() {
        let log = RoutingLog::new();
        let (layout, tunables) = layout(6);
        let scene = Scene::build(&log, &topo(6), &layout, &tunables, DisplayMode::Text);
        assert_eq!(scene.axis.len(), 6);
        assert!(scene.axis.iter().all(|slot| slot.count.is_none()));
        assert!(scene.blocks.is_empty());
        assert!(scene.legend.is_none());
        assert_eq!(scene.placeholder.as_deref(), Some(EMPTY_PLACEHOLDER));
    }

    #[test]
    fn blocks_stack_bottom_up_in_position_order() {
        let mut log = RoutingLog::new();
        log.append(vec![
            record(1, 2, None),
            record(1, 0, None),
            record(1, 1, None),
        ]);
        let (layout, tunables) = layout(4);
        let scene = Scene::build(&log, &topo(4), &layout, &tunables, DisplayMode::Text);
        let mut stack: Vec<&BlockNode> =
            scene.blocks.iter().filter(|b| b.expert_id == 1).collect();
        stack.sort_by(|a, b| a.rect.y.partial_cmp(&b.rect.y).unwrap());
        // Topmost block is the newest position.
        let positions: Vec<u32> = stack.iter().map(|b| b.token_pos).collect();
        assert_eq!(positions, vec![2, 1, 0]);
        let bottom = stack.last().unwrap();
        assert_eq!(
            bottom.rect.y,
            scene.canvas_height - layout.block_height
        );
    }

    #[test]
    fn rebuild_is_idempotent() {
        let mut log = RoutingLog::new();
        log.append(vec![record(0, 0, Some("The")), record(3, 1, Some(" cat"))]);
        let (layout, tunables) = layout(8);
        let first = Scene::build(&log, &topo(8), &layout, &tunables, DisplayMode::Text);
        let second = Scene::build(&log, &topo(8), &layout, &tunables, DisplayMode::Text);
        assert_eq!(first, second);
    }

    #[test]
    fn populated_scene_has_counts_and_legend() {
        let mut log = RoutingLog::new();
        log.append(vec![record(2, 0, None), record(2, 1, None)]);
        let (layout, tunables) = layout(4);
        let scene = Scene::build(&log, &topo(4), &layout, &tunables, DisplayMode::Text);
        assert_eq!(scene.axis[2].count, Some(2));
        assert_eq!(scene.axis[0].count, Some(0));
        assert!(scene.legend.is_some());
        assert!(scene.placeholder.is_none());
    }

    #[test]
    fn missing_decoded_token_falls_back_to_id() {
        let mut log = RoutingLog::new();
        log.append(vec![record(0, 0, None)]);
        let (layout, tunables) = layout(2);
        let scene = Scene::build(&log, &topo(2), &layout, &tunables, DisplayMode::Text);
        assert_eq!(scene.tokens[0].label, "40");
    }

    #[test]
    fn display_mode_switches_token_labels() {
        let mut log = RoutingLog::new();
        log.append(vec![record(0, 0, Some("The"))]);
        let (layout, tunables) = layout(2);
        let text = Scene::build(&log, &topo(2), &layout, &tunables, DisplayMode::Text);
        let ids = Scene::build(&log, &topo(2), &layout, &tunables, DisplayMode::Ids);
        assert_eq!(text.tokens[0].label, "The");
        assert_eq!(ids.tokens[0].label, "40");
    }

    #[test]
    fn colormap_is_deterministic_and_monotonic_in_lightness() {
        assert_eq!(position_color(3, 128), position_color(3, 128));
        // Past-domain positions clamp instead of wrapping.
        assert_eq!(position_color(128, 128), position_color(500, 128));
        let luma = |c: Rgb| 0.299 * c.r as f32 + 0.587 * c.g as f32 + 0.114 * c.b as f32;
        let mut last = luma(position_color(0, 128));
        for pos in 1..=128 {
            let next = luma(position_color(pos, 128));
            assert!(next >= last - 0.5, "luma dipped at position {pos}");
            last = next;
        }
    }
}
