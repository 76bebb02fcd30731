//! Crop geometry for constrained tracks
//!
//! Adaptation only ever crops. The output size is found by capping each
//! dimension at its maximum and then trimming the long axis until the
//! aspect ratio sits inside its bounds. The crop is centered, with
//! [`center_crop`] as the single owner of the odd-pixel rule.

use super::ConstraintSet;
use crate::types::{Rect, Size};

/// Guards the floor in aspect-ratio trims against float noise
const RATIO_EPSILON: f64 = 1e-9;

/// Geometry of an adapted view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdaptedGeometry {
    pub visible_rect: Rect,
    pub natural_size: Size,
}

/// Output size for an input of `input` under `constraints`
pub fn target_size(input: Size, constraints: &ConstraintSet) -> Size {
    let mut width = input.width.min(constraints.max_width.unwrap_or(u32::MAX));
    let mut height = input.height.min(constraints.max_height.unwrap_or(u32::MAX));
    if width == 0 || height == 0 {
        return Size::new(width, height);
    }

    // Trims never go below a minimum the input itself satisfies
    let width_floor = constraints.min_width.unwrap_or(1).clamp(1, width);
    let height_floor = constraints.min_height.unwrap_or(1).clamp(1, height);

    let max_ratio = constraints.max_aspect_ratio;
    let min_ratio = constraints.min_aspect_ratio.filter(|r| *r > 0.0);
    let fits = |w: u32, h: u32| {
        let (w, h) = (w as f64, h as f64);
        max_ratio.map_or(true, |max| w <= h * max + RATIO_EPSILON)
            && min_ratio.map_or(true, |min| w + RATIO_EPSILON >= h * min)
    };

    if let Some(max) = max_ratio {
        width = trim(width, height as f64 * max, width_floor);
    }
    if let Some(min) = min_ratio {
        height = trim(height, width as f64 / min, height_floor);
        // Flooring the height can push the ratio back above the maximum
        if let Some(max) = max_ratio {
            width = trim(width, height as f64 * max, width_floor);
        }
    }

    // Narrow bounds can leave no fit at this height; step down to the
    // tallest one that has it
    if !fits(width, height) {
        let shorter = (height_floor..height).rev().find_map(|h| {
            let w = max_ratio.map_or(width, |max| trim(width, h as f64 * max, width_floor));
            fits(w, h).then_some((w, h))
        });
        if let Some((w, h)) = shorter {
            width = w;
            height = h;
        }
    }

    Size::new(width, height)
}

/// `value` cut down to `bound`, but never below `floor`
fn trim(value: u32, bound: f64, floor: u32) -> u32 {
    let bounded = (bound + RATIO_EPSILON).floor() as u32;
    if bounded < value {
        bounded.max(floor)
    } else {
        value
    }
}

/// Center `size` inside `outer`.
///
/// An odd leftover pixel goes to the right or bottom margin, so the crop
/// leans toward the top-left.
pub fn center_crop(outer: Rect, size: Size) -> Rect {
    let width = size.width.min(outer.width);
    let height = size.height.min(outer.height);
    Rect::new(
        outer.x + (outer.width - width) / 2,
        outer.y + (outer.height - height) / 2,
        width,
        height,
    )
}

/// Scale a cropped size into the input's natural space, never upscaling
pub fn natural_size_for(cropped: Size, visible: Size, natural: Size) -> Size {
    if visible == natural || visible.is_empty() {
        return cropped;
    }
    let scale = |v: u32, from: u32, to: u32| -> u32 {
        let scaled = (v as f64 * to as f64 / from as f64).round() as u32;
        scaled.clamp(1, to.max(1))
    };
    Size::new(
        scale(cropped.width, visible.width, natural.width),
        scale(cropped.height, visible.height, natural.height),
    )
}

/// Geometry for a frame with `visible_rect` and `natural_size`, or `None`
/// when the frame already satisfies `constraints`
pub fn compute_geometry(
    visible_rect: Rect,
    natural_size: Size,
    constraints: &ConstraintSet,
) -> Option<AdaptedGeometry> {
    let target = target_size(visible_rect.size(), constraints);
    if target == visible_rect.size() || target.is_empty() {
        return None;
    }
    Some(AdaptedGeometry {
        visible_rect: center_crop(visible_rect, target),
        natural_size: natural_size_for(target, visible_rect.size(), natural_size),
    })
}
