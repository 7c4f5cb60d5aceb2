pub(crate) mod token_panel;

use egui::Color32;
use moeviz::scene::Rgb;

pub(crate) fn color32(color: Rgb) -> Color32 {
    Color32::from_rgb(color.r, color.g, color.b)
}

/// Black-on-light, white-on-dark label color for a colored background.
pub(crate) fn contrast_text_color(color: Rgb) -> Color32 {
    let luma = 0.299 * color.r as f32 + 0.587 * color.g as f32 + 0.114 * color.b as f32;
    if luma > 140.0 {
        Color32::BLACK
    } else {
        Color32::WHITE
    }
}
