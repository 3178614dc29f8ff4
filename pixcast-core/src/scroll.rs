//! Vertical scroll detection.
//!
//! Every row of a full-window frame is reduced to a checksum. Comparing
//! the checksums with those of the previous frame reveals rows that only
//! moved: a shift `d` means row `i` of the new frame equals row `i - d`
//! of the old one. When a single shift explains a large enough share of
//! the frame, the update is sent as a list of copy instructions plus
//! still images for the rows that really changed.

use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::{debug, trace};

use crate::config::ScrollSettings;
use crate::packet::ScrollCopy;
use crate::types::ImageBuffer;

// ── Checksums ────────────────────────────────────────────────────

/// One checksum per row of `image` (padding excluded).
pub fn line_checksums(image: &ImageBuffer) -> Vec<u64> {
    (0..image.height)
        .map(|y| {
            let row = image.row(y).unwrap_or(&[]);
            let hash = blake3::hash(row);
            let mut first = [0u8; 8];
            first.copy_from_slice(&hash.as_bytes()[..8]);
            u64::from_le_bytes(first)
        })
        .collect()
}

/// Score every shift between two checksum lists.
///
/// For a shift `d` (within `max_distance`) counts the rows `i` with
/// `new[i] == old[i - d]` that belong to a run of at least `min_run`
/// such rows. Shifts with no qualifying rows are omitted.
pub fn calculate_distances(
    new: &[u64],
    old: &[u64],
    min_run: usize,
    max_distance: usize,
) -> BTreeMap<i32, usize> {
    let mut by_checksum: HashMap<u64, Vec<usize>> = HashMap::new();
    for (j, c) in old.iter().enumerate() {
        by_checksum.entry(*c).or_default().push(j);
    }
    let mut candidates: HashSet<i64> = HashSet::new();
    for (i, c) in new.iter().enumerate() {
        if let Some(olds) = by_checksum.get(c) {
            for &j in olds {
                let d = i as i64 - j as i64;
                if d.unsigned_abs() as usize <= max_distance {
                    candidates.insert(d);
                }
            }
        }
    }

    let min_run = min_run.max(1);
    let mut distances = BTreeMap::new();
    for d in candidates {
        let mut hits = 0;
        let mut run = 0;
        for (i, c) in new.iter().enumerate() {
            let j = i as i64 - d;
            let matched = j >= 0 && (j as usize) < old.len() && old[j as usize] == *c;
            if matched {
                run += 1;
            } else {
                if run >= min_run {
                    hits += run;
                }
                run = 0;
            }
        }
        if run >= min_run {
            hits += run;
        }
        if hits > 0 {
            distances.insert(d as i32, hits);
        }
    }
    distances
}

/// Rows of the new frame that equal the old row `distance` above them.
pub fn match_distance(new: &[u64], old: &[u64], distance: i32) -> Vec<usize> {
    new.iter()
        .enumerate()
        .filter(|(i, c)| {
            let j = *i as i64 - distance as i64;
            j >= 0 && (j as usize) < old.len() && old[j as usize] == **c
        })
        .map(|(i, _)| i)
        .collect()
}

/// Group sorted row indices into `(start, count)` runs.
pub fn consecutive_lines(lines: &[usize]) -> Vec<(usize, usize)> {
    let mut out: Vec<(usize, usize)> = Vec::new();
    for &line in lines {
        match out.last_mut() {
            Some((start, count)) if *start + *count == line => *count += 1,
            _ => out.push((line, 1)),
        }
    }
    out
}

// ── ScrollPlan ───────────────────────────────────────────────────

/// How to send a frame as scroll copies plus changed rows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScrollPlan {
    pub copies: Vec<ScrollCopy>,
    /// `(start_row, rows)` ranges (relative to the image) that must be
    /// sent as pixels.
    pub changed: Vec<(u32, u32)>,
}

/// Build the copy list for `distances`, best scoring shifts first.
pub fn plan_scroll(
    x: u32,
    y: u32,
    width: u32,
    new: &[u64],
    old: &[u64],
    distances: &BTreeMap<i32, usize>,
    settings: &ScrollSettings,
) -> ScrollPlan {
    let mut ordered: Vec<(i32, usize)> = distances.iter().map(|(d, h)| (*d, *h)).collect();
    // most hits first, smaller shifts before larger ones on ties
    ordered.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.abs().cmp(&b.0.abs())));
    let mut shifts: Vec<i32> = ordered
        .into_iter()
        .map(|(d, _)| d)
        .filter(|d| *d != 0)
        .take(settings.max_regions)
        .collect();
    if distances.contains_key(&0) {
        // unchanged rows are handled last so they never split a copy
        shifts.push(0);
    }

    let mut handled = vec![false; new.len()];
    let mut copies = Vec::new();
    'shifts: for s in shifts {
        let lines: Vec<usize> = match_distance(new, old, s)
            .into_iter()
            .filter(|l| !handled[*l])
            .collect();
        if lines.is_empty() {
            continue;
        }
        if s == 0 {
            trace!(lines = lines.len(), "rows unchanged");
            for l in lines {
                handled[l] = true;
            }
            continue;
        }
        for (start, count) in consecutive_lines(&lines) {
            if copies.len() >= settings.max_copies {
                break 'shifts;
            }
            for l in start..start + count {
                handled[l] = true;
            }
            copies.push(ScrollCopy {
                x,
                y: (y as i64 + start as i64 - s as i64) as u32,
                width,
                height: count as u32,
                dx: 0,
                dy: s,
            });
        }
    }
    let remaining: Vec<usize> = (0..new.len()).filter(|l| !handled[*l]).collect();
    let changed = consecutive_lines(&remaining)
        .into_iter()
        .map(|(s, c)| (s as u32, c as u32))
        .collect();
    ScrollPlan { copies, changed }
}

// ── ScrollDetector ───────────────────────────────────────────────

/// Remembers the previous frame's checksums of one window.
#[derive(Debug)]
pub struct ScrollDetector {
    settings: ScrollSettings,
    last: Option<(u32, u32, Vec<u64>)>,
}

impl ScrollDetector {
    pub fn new(settings: &ScrollSettings) -> Self {
        Self {
            settings: settings.clone(),
            last: None,
        }
    }

    /// Forget the previous frame.
    pub fn reset(&mut self) {
        self.last = None;
    }

    /// Compare `image` against the previous frame and keep it for next time.
    ///
    /// Returns a plan when the best shift covers enough of the frame.
    pub fn detect(&mut self, image: &ImageBuffer) -> Option<ScrollPlan> {
        if !self.settings.enabled || image.format.is_yuv() {
            return None;
        }
        let checksums = line_checksums(image);
        let previous = self.last.replace((image.width, image.height, checksums));
        let (lw, lh, old) = previous?;
        if lw != image.width || lh != image.height {
            return None;
        }
        let (_, _, new) = self.last.as_ref()?;
        let distances = calculate_distances(new, &old, self.settings.min_run, self.settings.max_distance);
        let best = distances.values().copied().max()?;
        let pct = 100 * best as u64 / image.height.max(1) as u64;
        if pct < self.settings.min_percent {
            trace!(pct, "scroll match too weak");
            return None;
        }
        let plan = plan_scroll(image.x, image.y, image.width, new, &old, &distances, &self.settings);
        debug!(
            pct,
            copies = plan.copies.len(),
            changed = plan.changed.len(),
            "scroll detected"
        );
        Some(plan)
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::Rectangle;
    use crate::types::PixelFormat;
    use std::time::Instant;

    /// A 4-byte-per-pixel image whose row `r` is filled from `rows[r]`.
    fn image(width: u32, rows: &[u32]) -> ImageBuffer {
        let mut data = Vec::new();
        for r in rows {
            for _ in 0..width {
                data.extend_from_slice(&r.to_le_bytes());
            }
        }
        ImageBuffer::new(
            Rectangle::sized(width, rows.len() as u32),
            width * 4,
            PixelFormat::Bgrx,
            data,
            Instant::now(),
        )
    }

    #[test]
    fn distances_find_shift() {
        let d = calculate_distances(&[0, 1, 2], &[1, 2, 3], 1, 10);
        assert_eq!(d.get(&1), Some(&2));
        let same = [7, 8, 9];
        let d = calculate_distances(&same, &same, 1, 10);
        assert_eq!(d.len(), 1);
        assert_eq!(d.get(&0), Some(&3));
    }

    #[test]
    fn short_runs_are_ignored() {
        let d = calculate_distances(&[1, 50, 2, 60], &[0, 1, 70, 2], 2, 10);
        assert!(d.is_empty());
    }

    #[test]
    fn consecutive_grouping() {
        assert_eq!(consecutive_lines(&[1, 2, 3, 100, 200, 201]), vec![(1, 3), (100, 1), (200, 2)]);
        assert!(consecutive_lines(&[]).is_empty());
    }

    #[test]
    fn match_distance_directions() {
        assert_eq!(match_distance(&[2, 3, 4, 5], &[0, 1, 2, 3], -2), vec![0, 1]);
        assert!(match_distance(&[2, 3, 4, 5], &[0, 1, 2, 3], 2).is_empty());
        assert_eq!(match_distance(&[0, 1, 2, 3], &[0, 1, 2, 3], 0).len(), 4);
    }

    #[test]
    fn scroll_by_twenty_lines() {
        let mut detector = ScrollDetector::new(&ScrollSettings::default());
        let old_rows: Vec<u32> = (0..100).collect();
        // content moved up by 20 rows, 20 new rows at the bottom
        let new_rows: Vec<u32> = (20..120).collect();
        assert!(detector.detect(&image(8, &old_rows)).is_none());
        let plan = detector.detect(&image(8, &new_rows)).unwrap();
        assert_eq!(plan.copies, vec![ScrollCopy {
            x: 0,
            y: 20,
            width: 8,
            height: 80,
            dx: 0,
            dy: -20,
        }]);
        assert_eq!(plan.changed, vec![(80, 20)]);
    }

    #[test]
    fn unchanged_rows_need_no_packets() {
        let mut detector = ScrollDetector::new(&ScrollSettings::default());
        let rows: Vec<u32> = (0..50).collect();
        detector.detect(&image(4, &rows));
        let mut changed = rows.clone();
        changed[10] = 999;
        let plan = detector.detect(&image(4, &changed)).unwrap();
        assert!(plan.copies.is_empty());
        assert_eq!(plan.changed, vec![(10, 1)]);
    }

    #[test]
    fn unrelated_frames_do_not_scroll() {
        let mut detector = ScrollDetector::new(&ScrollSettings::default());
        detector.detect(&image(4, &(0..50).collect::<Vec<_>>()));
        assert!(detector.detect(&image(4, &(1000..1050).collect::<Vec<_>>())).is_none());
    }

    #[test]
    fn size_change_resets_comparison() {
        let mut detector = ScrollDetector::new(&ScrollSettings::default());
        detector.detect(&image(4, &(0..50).collect::<Vec<_>>()));
        assert!(detector.detect(&image(4, &(0..60).collect::<Vec<_>>())).is_none());
    }
}
