//! Turning a batch of damaged rectangles into encode requests.
//!
//! Many small packets cost more than one larger one, so the planner
//! weighs the pixels of each rectangle plus a fixed per-packet overhead
//! against merging them or sending the whole window. While a video
//! region is being sent separately, "the whole window" means the damaged
//! parts of the window around it.

use tracing::trace;

use crate::config::BatchSettings;
use crate::encoding::Encoding;
use crate::region::{Rectangle, RegionSet, merge_all};

/// One encode request produced by the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedRegion {
    pub rect: Rectangle,
    pub encoding: Encoding,
    /// Packets still to follow in this flush group.
    pub flush: u32,
}

/// Window-level inputs of the planner.
#[derive(Debug, Clone, Copy)]
pub struct PackingInput {
    pub width: u32,
    pub height: u32,
    pub full_frames_only: bool,
    /// Area owned by another encode request of the same flush.
    pub exclude: Option<Rectangle>,
}

fn full_window<F>(input: &PackingInput, damaged: &[Rectangle], choose: &mut F) -> Vec<PlannedRegion>
where
    F: FnMut(u64) -> Encoding,
{
    let rect = Rectangle::sized(input.width, input.height);
    let Some(exclude) = input.exclude else {
        return vec![PlannedRegion {
            rect,
            encoding: choose(rect.area()),
            flush: 0,
        }];
    };
    let pieces: Vec<Rectangle> = rect
        .subtract(&exclude)
        .into_iter()
        .filter(|piece| damaged.iter().any(|d| d.intersects(piece)))
        .collect();
    let last = pieces.len().saturating_sub(1);
    pieces
        .into_iter()
        .enumerate()
        .map(|(i, rect)| PlannedRegion {
            rect,
            encoding: choose(rect.area()),
            flush: (last - i) as u32,
        })
        .collect()
}

/// Plan the encode requests for `regions`.
///
/// `choose` picks the encoding for a given pixel count and
/// `needs_full_frame` tells whether an encoding can only encode whole
/// windows (video). Separate regions are returned in sending order: the
/// last one carries `flush == 0`.
pub fn plan_regions<F, G>(
    regions: &RegionSet,
    input: &PackingInput,
    settings: &BatchSettings,
    mut choose: F,
    needs_full_frame: G,
) -> Vec<PlannedRegion>
where
    F: FnMut(u64) -> Encoding,
    G: Fn(Encoding) -> bool,
{
    let window_area = input.width as u64 * input.height as u64;
    let mut rects: Vec<Rectangle> = regions
        .iter()
        .filter_map(|r| r.clip_to(input.width, input.height))
        .collect();
    if rects.is_empty() {
        return Vec::new();
    }
    if input.full_frames_only || rects.len() > settings.max_regions || window_area <= settings.min_window_area {
        return full_window(input, &rects, &mut choose);
    }
    rects.sort_by_key(|r| (r.y, r.x, r.width, r.height));
    rects.dedup();

    let threshold = window_area * settings.max_bytes_percent / 100;
    let pixel_count: u64 = rects.iter().map(Rectangle::area).sum();
    let cost = pixel_count + settings.packet_cost * rects.len() as u64;
    trace!(cost, threshold, pixel_count, "region packing");
    if cost >= threshold {
        return full_window(input, &rects, &mut choose);
    }
    if rects.len() > 1 {
        if let Some(merged) = merge_all(rects.iter()) {
            let merged_cost = merged.area() + settings.packet_cost;
            if merged_cost < cost || merged.area() < pixel_count {
                rects = vec![merged];
            }
        }
    }
    if rects.len() > 1 {
        let total: u64 = rects.iter().map(Rectangle::area).sum();
        let encoding = choose(total);
        if input.exclude.is_some() && (total >= window_area || needs_full_frame(encoding)) {
            return full_window(input, &rects, &mut choose);
        }
        if total >= window_area || needs_full_frame(encoding) {
            return vec![PlannedRegion {
                rect: Rectangle::sized(input.width, input.height),
                encoding,
                flush: 0,
            }];
        }
    }

    let mut planned = Vec::with_capacity(rects.len());
    for (i, rect) in rects.iter().enumerate() {
        let encoding = choose(rect.area());
        if needs_full_frame(encoding) {
            if input.exclude.is_some() {
                return full_window(input, &rects, &mut choose);
            }
            return vec![PlannedRegion {
                rect: Rectangle::sized(input.width, input.height),
                encoding,
                flush: 0,
            }];
        }
        planned.push(PlannedRegion {
            rect: *rect,
            encoding,
            flush: i as u32,
        });
    }
    // flush 0 goes out last
    planned.reverse();
    planned
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const INPUT: PackingInput = PackingInput {
        width: 1000,
        height: 1000,
        full_frames_only: false,
        exclude: None,
    };

    fn plan(rects: &[Rectangle], input: &PackingInput) -> Vec<PlannedRegion> {
        let set: RegionSet = rects.iter().copied().collect();
        plan_regions(&set, input, &BatchSettings::default(), |_| Encoding::Png, |e| e.is_video())
    }

    #[test]
    fn small_separate_regions_stay_separate() {
        let out = plan(&[Rectangle::new(0, 0, 10, 10), Rectangle::new(900, 900, 10, 10)], &INPUT);
        assert_eq!(out.len(), 2);
        assert_eq!(out.last().map(|p| p.flush), Some(0));
        assert_eq!(out[0].flush, 1);
    }

    #[test]
    fn nearby_regions_are_merged() {
        let out = plan(&[Rectangle::new(0, 0, 10, 10), Rectangle::new(12, 0, 10, 10)], &INPUT);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].rect, Rectangle::new(0, 0, 22, 10));
    }

    #[test]
    fn expensive_batch_becomes_full_frame() {
        let out = plan(&[Rectangle::new(0, 0, 1000, 700)], &INPUT);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].rect, Rectangle::sized(1000, 1000));
    }

    #[test]
    fn too_many_regions_or_tiny_window() {
        let many: Vec<Rectangle> = (0..41).map(|i| Rectangle::new(i * 20, 0, 2, 2)).collect();
        assert_eq!(plan(&many, &INPUT).len(), 1);
        let tiny = PackingInput {
            width: 32,
            height: 32,
            full_frames_only: false,
            exclude: None,
        };
        let out = plan(&[Rectangle::new(0, 0, 2, 2)], &tiny);
        assert_eq!(out[0].rect, Rectangle::sized(32, 32));
    }

    #[test]
    fn video_forces_full_frame() {
        let set: RegionSet = [Rectangle::new(0, 0, 10, 10)].into_iter().collect();
        let out = plan_regions(&set, &INPUT, &BatchSettings::default(), |_| Encoding::H264, |e| e.is_video());
        assert_eq!(out, vec![PlannedRegion {
            rect: Rectangle::sized(1000, 1000),
            encoding: Encoding::H264,
            flush: 0,
        }]);
    }

    #[test]
    fn full_frame_leaves_out_the_excluded_area() {
        let input = PackingInput {
            exclude: Some(Rectangle::new(0, 0, 1000, 200)),
            ..INPUT
        };
        let out = plan(&[Rectangle::new(0, 300, 1000, 650)], &input);
        assert_eq!(out, vec![PlannedRegion {
            rect: Rectangle::new(0, 200, 1000, 800),
            encoding: Encoding::Png,
            flush: 0,
        }]);
    }

    #[test]
    fn empty_after_clipping() {
        assert!(plan(&[Rectangle::new(2000, 2000, 10, 10)], &INPUT).is_empty());
    }
}
