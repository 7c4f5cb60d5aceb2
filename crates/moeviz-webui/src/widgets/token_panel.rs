use crate::widgets::{color32, contrast_text_color};
use egui::{Label, RichText, Sense, Ui};
use moeviz::scene::TokenEntry;
use moeviz::session::{FocusSource, SessionController};

fn escape_token_text(input: &str) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(input.len());

    for c in input.chars() {
        match c {
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\\' => out.push_str("\\\\"),
            // `is_control` is true for all C0 controls (0x00–0x1F) and DEL (0x7F)
            c if c.is_control() => {
                // \u{XXXX} where XXXX is at least 4 hex digits
                write!(out, "\\u{{{:04X}}}", c as u32).unwrap();
            }
            // Printable, keep as‑is
            c => out.push(c),
        }
    }

    out
}

/// Token strip: one colored chip per generated token, in sequence order.
/// Hovering a chip publishes its position for the chart to highlight, and
/// a chart-held focus highlights the matching chip here.
pub(crate) fn show(ui: &mut Ui, tokens: &[TokenEntry], controller: &mut SessionController) {
    if tokens.is_empty() {
        ui.weak("No tokens yet");
        return;
    }
    let focused = controller.focused_pos();
    let mut hovered = None;

    let frame = egui::Frame::default()
        .inner_margin(2.0)
        .stroke(ui.visuals().window_stroke);
    frame.show(ui, |ui| {
        egui::ScrollArea::vertical()
            .id_salt("token_strip_scroll")
            .max_height(120.0)
            .show(ui, |ui| {
                ui.horizontal_wrapped(|ui| {
                    {
                        let spacing_mut = ui.spacing_mut();
                        spacing_mut.item_spacing.x = 2.0;
                        spacing_mut.item_spacing.y = 2.0;
                    }
                    for entry in tokens {
                        let mut text = RichText::new(escape_token_text(&entry.label))
                            .background_color(color32(entry.color))
                            .color(contrast_text_color(entry.color))
                            .size(14.0);
                        if focused == Some(entry.token_pos) {
                            text = text.underline().strong();
                        }
                        let response = ui
                            .add(Label::new(text).sense(Sense::hover()))
                            .on_hover_text(format!("#{} (id {})", entry.token_pos, entry.token_id));
                        if response.hovered() {
                            hovered = Some(entry.token_pos);
                        }
                    }
                });
            });
    });

    match hovered {
        Some(token_pos) => controller.focus(FocusSource::TokenPanel, token_pos),
        None => controller.clear_focus(FocusSource::TokenPanel),
    }
}
