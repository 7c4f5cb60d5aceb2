use crate::widgets::{color32, contrast_text_color};
use egui::{Align2, FontId, Pos2, Rect, Sense, Stroke, StrokeKind, Vec2};
use moeviz::scene::Scene;
use moeviz::session::{FocusSource, SessionController};

const AXIS_SPACE: f32 = 18.0;
const LEGEND_SPACE: f32 = 34.0;
const LEGEND_BAR_WIDTH: f32 = 220.0;
const LEGEND_BAR_HEIGHT: f32 = 10.0;

/// Paint the expert chart. Wide topologies get a horizontal scroll region
/// instead of squeezing blocks below their minimum width.
pub(crate) fn show(ui: &mut egui::Ui, scene: &Scene, controller: &mut SessionController) {
    if scene.needs_horizontal_scroll {
        egui::ScrollArea::horizontal()
            .id_salt("expert_chart_scroll")
            .show(ui, |ui| draw_chart(ui, scene, controller));
    } else {
        draw_chart(ui, scene, controller);
    }
}

fn draw_chart(ui: &mut egui::Ui, scene: &Scene, controller: &mut SessionController) {
    let desired = Vec2::new(
        scene.canvas_width,
        scene.canvas_height + AXIS_SPACE + LEGEND_SPACE,
    );
    let (response, painter) = ui.allocate_painter(desired, Sense::hover());
    let origin = response.rect.min;

    // Hover publishes focus; the token panel reads the same focus state.
    let hovered_block = response.hover_pos().and_then(|pos| {
        let local = pos - origin;
        scene.block_at(local.x, local.y)
    });
    match hovered_block {
        Some(block) => controller.focus(FocusSource::Chart, block.token_pos),
        None => controller.clear_focus(FocusSource::Chart),
    }
    let focused = controller.focused_pos();

    if let Some(placeholder) = &scene.placeholder {
        painter.text(
            origin + Vec2::new(scene.canvas_width / 2.0, scene.canvas_height / 2.0),
            Align2::CENTER_CENTER,
            placeholder,
            FontId::proportional(14.0),
            ui.visuals().weak_text_color(),
        );
    }

    for block in &scene.blocks {
        let rect = Rect::from_min_size(
            origin + Vec2::new(block.rect.x, block.rect.y),
            Vec2::new(block.rect.width, block.rect.height),
        );
        painter.rect_filled(rect.shrink(0.5), 1.0, color32(block.color));
        if focused == Some(block.token_pos) {
            painter.rect_stroke(
                rect,
                1.0,
                Stroke::new(2.0, ui.visuals().strong_text_color()),
                StrokeKind::Outside,
            );
        }
        if let Some(label) = &block.label {
            painter.text(
                rect.center(),
                Align2::CENTER_CENTER,
                label,
                FontId::proportional(10.0),
                contrast_text_color(block.color),
            );
        }
    }

    if let Some(block) = hovered_block {
        response.clone().on_hover_text(block.hover_text.clone());
    }

    // Axis baseline, slot labels below, count headers above.
    let baseline_y = origin.y + scene.canvas_height;
    painter.line_segment(
        [
            Pos2::new(origin.x, baseline_y),
            Pos2::new(origin.x + scene.canvas_width, baseline_y),
        ],
        Stroke::new(1.0, ui.visuals().weak_text_color()),
    );
    for slot in &scene.axis {
        painter.text(
            Pos2::new(origin.x + slot.x_center, baseline_y + 3.0),
            Align2::CENTER_TOP,
            &slot.label,
            FontId::proportional(10.0),
            ui.visuals().text_color(),
        );
        if let Some(count) = slot.count {
            if count > 0 {
                painter.text(
                    Pos2::new(origin.x + slot.x_center, origin.y + 2.0),
                    Align2::CENTER_TOP,
                    count.to_string(),
                    FontId::proportional(10.0),
                    ui.visuals().strong_text_color(),
                );
            }
        }
    }

    if let Some(legend) = &scene.legend {
        let legend_origin = Pos2::new(origin.x + 4.0, baseline_y + AXIS_SPACE + 4.0);
        for window in legend.stops.windows(2) {
            let (f0, c0) = window[0];
            let (f1, _) = window[1];
            painter.rect_filled(
                Rect::from_min_max(
                    Pos2::new(legend_origin.x + f0 * LEGEND_BAR_WIDTH, legend_origin.y),
                    Pos2::new(
                        legend_origin.x + f1 * LEGEND_BAR_WIDTH,
                        legend_origin.y + LEGEND_BAR_HEIGHT,
                    ),
                ),
                0.0,
                color32(c0),
            );
        }
        let domain = legend.ticks.last().copied().unwrap_or(1).max(1);
        for &tick in &legend.ticks {
            let x = legend_origin.x + tick as f32 / domain as f32 * LEGEND_BAR_WIDTH;
            painter.text(
                Pos2::new(x, legend_origin.y + LEGEND_BAR_HEIGHT + 2.0),
                Align2::CENTER_TOP,
                tick.to_string(),
                FontId::proportional(9.0),
                ui.visuals().weak_text_color(),
            );
        }
        painter.text(
            Pos2::new(legend_origin.x + LEGEND_BAR_WIDTH + 10.0, legend_origin.y),
            Align2::LEFT_TOP,
            "token position",
            FontId::proportional(10.0),
            ui.visuals().text_color(),
        );
    }
}
