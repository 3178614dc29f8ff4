//! Video region detection.
//!
//! A page playing a clip repaints the same sub-rectangle many times a
//! second while the rest of the window sits still. [`VideoSubregion`]
//! scores the recent damage history for such a rectangle; the engine
//! sends it with the video encoder and everything around it as stills.
//!
//! Lossy frames inside the region are refreshed on the region's own
//! timer, so the window's
//! [`RefreshScheduler`](crate::refresh::RefreshScheduler) never sees
//! them and never schedules overlapping refreshes of a playing video.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, trace};

use crate::config::SubregionSettings;
use crate::region::{Rectangle, RegionSet, merge_all};
use crate::stats::TimedRing;
use crate::timer::{TimerEvent, TimerHandle, TimerKind, TimerSlot, Timers};
use crate::types::WindowId;

/// Scores are relative to 100, which means "no better than anywhere else".
const NEUTRAL: u32 = 100;
/// The current region is kept without looking further.
const KEEP_SCORE: u32 = 125;
/// A weaker current region is kept unless something beats it.
const KEEP_WEAK_SCORE: u32 = 90;
/// A candidate is taken straight away.
const SET_SCORE: u32 = 120;
/// Bounding box of every busy rectangle.
const MERGED_SCORE: u32 = 110;
/// New damage events needed before a full detection pass.
const RECHECK_EVENTS: u64 = 10;

/// Published state of a detected region.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SubregionInfo {
    pub rectangle: Rectangle,
    pub score: u32,
    /// Damaged pixels inside and outside the region over the history.
    pub pixels_in: u64,
    pub pixels_out: u64,
    pub fps: u32,
    /// Percentage of the region the history painted at least once.
    pub damaged: u8,
}

/// What detection reads from the window's statistics.
#[derive(Debug, Clone, Copy)]
pub struct DamageHistory<'a> {
    pub width: u32,
    pub height: u32,
    /// Damage events recorded since the window was added.
    pub events_count: u64,
    pub events: &'a TimedRing<Rectangle>,
    /// Events before this instant are ignored (last resize).
    pub starting_at: Option<Instant>,
}

// ── VideoSubregion ───────────────────────────────────────────────

#[derive(Debug)]
pub struct VideoSubregion {
    settings: SubregionSettings,
    refresh_delay: Duration,
    info: Option<SubregionInfo>,
    /// Damage event count when the region was chosen.
    set_at: u64,
    /// Damage event count at the last full pass.
    counter: u64,
    checked_at: Option<Instant>,
    refresh_regions: RegionSet,
    refresh_timer: TimerSlot,
}

impl VideoSubregion {
    /// `auto_refresh_delay_ms` is the window's regular refresh delay.
    pub fn new(settings: &SubregionSettings, auto_refresh_delay_ms: u64) -> Self {
        Self {
            refresh_delay: Duration::from_millis(settings.refresh_min_delay_ms.max(auto_refresh_delay_ms)),
            settings: settings.clone(),
            info: None,
            set_at: 0,
            counter: 0,
            checked_at: None,
            refresh_regions: RegionSet::new(),
            refresh_timer: TimerSlot::default(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.settings.enabled
    }

    pub fn rectangle(&self) -> Option<Rectangle> {
        self.info.map(|i| i.rectangle)
    }

    pub fn info(&self) -> Option<SubregionInfo> {
        self.info
    }

    pub fn refresh_pending(&self) -> &RegionSet {
        &self.refresh_regions
    }

    /// Quality and speed for still regions sent next to the video.
    pub fn boost(&self, quality: u8, speed: u8) -> (u8, u8) {
        if self.info.is_none() {
            return (quality, speed);
        }
        (
            quality.saturating_add(self.settings.quality_boost).min(100),
            speed.saturating_add(self.settings.speed_boost).min(100),
        )
    }

    /// Forget the region and any refresh it was waiting for.
    pub fn reset(&mut self, timers: &mut Timers) {
        self.cancel_refresh(timers);
        self.clear();
    }

    fn clear(&mut self) {
        self.info = None;
        self.set_at = 0;
        self.counter = 0;
        self.checked_at = None;
    }

    // ── Detection ────────────────────────────────────────────────

    /// Re-run detection over the damage history.
    pub fn identify(&mut self, window: WindowId, history: &DamageHistory<'_>, now: Instant) {
        if !self.settings.enabled {
            return;
        }
        let (ww, wh) = (history.width, history.height);
        let count = history.events_count;
        if count < self.set_at {
            self.set_at = 0;
        }
        let current = self.rectangle();
        if current.is_some_and(|r| r.width > ww || r.height > wh) {
            return self.lose(window, "window is now smaller than the region");
        }
        if ww < self.settings.min_width || wh < self.settings.min_height {
            return self.lose(window, "window too small");
        }
        if self.counter + RECHECK_EVENTS > count {
            // the region lives longer the more frames it has carried
            let carried = count.saturating_sub(self.set_at) as f64;
            let timeout = 2.0 + (2.0 + carried).log(1.5);
            let elapsed = self
                .checked_at
                .map_or(f64::INFINITY, |t| now.saturating_duration_since(t).as_secs_f64());
            if current.is_some() && elapsed >= timeout {
                self.lose(window, "too few damage events");
            }
            return;
        }

        let horizon = now
            .checked_sub(Duration::from_millis(self.settings.max_time_ms))
            .unwrap_or(now);
        let from = history.starting_at.map_or(horizon, |t| t.max(horizon));
        let recent: Vec<Rectangle> = history.events.since(from).map(|(_, r)| *r).collect();
        if recent.len() <= self.settings.min_events {
            return self.lose(window, "not enough damage events");
        }
        let scorer = Scorer::new(&self.settings, ww, wh, &recent);

        self.counter = count;
        self.checked_at = Some(now);
        let pass = Pass { count, from, now };

        let mut current_score = 0;
        if let Some(rect) = current {
            current_score = scorer.score(&rect, 0);
            if current_score >= KEEP_SCORE {
                trace!(window, ?rect, score = current_score, "keeping video region");
                return;
            }
        }

        let mut scores: Vec<(Rectangle, u32)> = Vec::new();
        let min_hits = 2f64.max(recent.len() as f64 / 40.0);
        let busy: Vec<(Rectangle, u64)> = scorer
            .hits
            .iter()
            .filter(|(r, n)| *n as f64 > min_hits && scorer.big_enough(r))
            .copied()
            .collect();
        if let Some(most) = busy.iter().map(|(_, n)| *n).max() {
            let mut top = busy.iter().filter(|(_, n)| *n == most);
            if let (Some((rect, _)), None) = (top.next(), top.next()) {
                let score = scorer.score(rect, 0);
                if score > SET_SCORE {
                    return self.set(window, *rect, &scorer, "most damaged", pass);
                }
                if score >= NEUTRAL {
                    scores.push((*rect, score));
                }
            }
        }

        // players that paint in bands
        for bands in [&scorer.columns, &scorer.rows] {
            for members in bands.values().filter(|m| m.len() >= 2) {
                let need = 2f64.max(members.len() as f64 / 25.0);
                let keep: Vec<&Rectangle> = members
                    .iter()
                    .filter(|r| scorer.hits_of(r) as f64 >= need)
                    .collect();
                if let Some(merged) = merge_all(keep) {
                    scores.push((merged, scorer.score(&merged, self.settings.ignore_pixels)));
                }
            }
        }

        let (best, high) = scores
            .iter()
            .fold((None, 0), |(b, h), (r, s)| if *s > h { (Some(*r), *s) } else { (b, h) });
        if let Some(rect) = best.filter(|_| high >= SET_SCORE) {
            return self.set(window, rect, &scorer, "very high score", pass);
        }
        if let Some(rect) = current.filter(|_| current_score >= KEEP_WEAK_SCORE && (high < NEUTRAL || current_score >= high)) {
            trace!(window, ?rect, score = current_score, "keeping weaker video region");
            self.info = Some(scorer.describe(rect, &recent, from, now));
            return;
        }
        if let Some(rect) = best.filter(|_| high >= NEUTRAL) {
            return self.set(window, rect, &scorer, "high score", pass);
        }
        if busy.len() >= 2 {
            if let Some(merged) = merge_all(busy.iter().map(|(r, _)| r)) {
                if scorer.score(&merged, 0) >= MERGED_SCORE {
                    return self.set(window, merged, &scorer, "merged", pass);
                }
            }
        }
        self.lose(window, "no video region found");
    }

    fn set(&mut self, window: WindowId, rect: Rectangle, scorer: &Scorer<'_>, why: &str, pass: Pass) {
        self.set_at = pass.count;
        self.counter = pass.count;
        let info = scorer.describe(rect, scorer.events, pass.from, pass.now);
        if self.rectangle() != Some(rect) {
            debug!(window, ?rect, score = info.score, fps = info.fps, why, "video region");
        }
        self.info = Some(info);
    }

    fn lose(&mut self, window: WindowId, why: &str) {
        if let Some(rect) = self.rectangle() {
            debug!(window, ?rect, why, "video region lost");
        }
        self.clear();
    }

    // ── Refresh ──────────────────────────────────────────────────

    /// A lossy packet painted `rect` inside the region.
    ///
    /// Restarts the region's refresh timer. Pending pieces the region no
    /// longer covers (it moved or shrank) are returned for the regular
    /// refresh path.
    pub fn add_video_refresh(
        &mut self,
        window: WindowId,
        rect: Rectangle,
        now: Instant,
        timers: &mut Timers,
    ) -> Vec<Rectangle> {
        let Some(vr) = self.rectangle() else {
            return vec![rect];
        };
        self.refresh_timer.cancel(timers);
        self.refresh_regions.add(rect);
        let mut outside = Vec::new();
        if self.refresh_regions.iter().any(|r| !vr.contains(r)) {
            let mut inside = RegionSet::new();
            for r in self.refresh_regions.iter() {
                outside.extend(r.subtract(&vr));
                if let Some(piece) = r.intersection(&vr) {
                    inside.add(piece);
                }
            }
            self.refresh_regions = inside;
        }
        if !self.refresh_regions.is_empty() {
            trace!(window, regions = self.refresh_regions.len(), "video region refresh scheduled");
            self.refresh_timer.arm(
                timers,
                now + self.refresh_delay,
                TimerEvent::Window(window, TimerKind::SubregionRefresh),
            );
        }
        outside
    }

    /// A lossless packet covered `rect`.
    pub fn remove_refresh_region(&mut self, rect: &Rectangle) {
        self.refresh_regions.subtract(rect);
    }

    /// The refresh timer fired; returns what to re-send.
    pub fn on_refresh_timer(&mut self, window: WindowId, handle: TimerHandle) -> Option<Vec<Rectangle>> {
        if !self.refresh_timer.fired(handle) {
            return None;
        }
        let regions = std::mem::take(&mut self.refresh_regions);
        if regions.is_empty() {
            return None;
        }
        debug!(window, regions = regions.len(), "refreshing video region");
        // several pieces: one refresh of the whole region is cheaper
        match self.rectangle() {
            Some(vr) if regions.len() >= 2 => Some(vec![vr]),
            _ => Some(regions.iter().copied().collect()),
        }
    }

    pub fn cancel_refresh(&mut self, timers: &mut Timers) {
        self.refresh_timer.cancel(timers);
        self.refresh_regions.clear();
    }
}

/// Locate the damaged part of the video region within a batch.
///
/// Exact match first, then the whole region if the batch repaints at
/// least 40% of it, then a lone batch rectangle of the same size.
pub fn find_in_regions(vr: &Rectangle, regions: &RegionSet) -> Option<Rectangle> {
    if regions.iter().any(|r| r == vr) {
        return Some(*vr);
    }
    let inside: Vec<Rectangle> = regions.iter().filter_map(|r| vr.intersection(r)).collect();
    if merge_all(&inside).is_some_and(|m| m.area() * 100 >= vr.area() * 40) {
        return Some(*vr);
    }
    let same_size: Vec<&Rectangle> = regions
        .iter()
        .filter(|r| r.width == vr.width && r.height == vr.height)
        .collect();
    match same_size.as_slice() {
        [one] => Some(**one),
        [] => None,
        many => {
            let mut aligned = many.iter().filter(|r| r.x == vr.x || r.y == vr.y);
            match (aligned.next(), aligned.next()) {
                (Some(r), None) => Some(**r),
                _ => None,
            }
        }
    }
}

// ── Scorer ───────────────────────────────────────────────────────

/// Event count and time span of one detection pass.
#[derive(Debug, Clone, Copy)]
struct Pass {
    count: u64,
    from: Instant,
    now: Instant,
}

/// Damage history digested for one detection pass.
struct Scorer<'a> {
    width: u32,
    height: u32,
    min_width: u32,
    min_height: u32,
    events: &'a [Rectangle],
    /// Distinct rectangles and how often each was damaged.
    hits: Vec<(Rectangle, u64)>,
    /// Wide rectangles grouped by `(width, x)`.
    columns: BTreeMap<(u32, u32), Vec<Rectangle>>,
    /// Tall rectangles grouped by `(height, y)`.
    rows: BTreeMap<(u32, u32), Vec<Rectangle>>,
}

impl<'a> Scorer<'a> {
    fn new(settings: &SubregionSettings, width: u32, height: u32, events: &'a [Rectangle]) -> Self {
        let mut hits: Vec<(Rectangle, u64)> = Vec::new();
        let mut columns: BTreeMap<(u32, u32), Vec<Rectangle>> = BTreeMap::new();
        let mut rows: BTreeMap<(u32, u32), Vec<Rectangle>> = BTreeMap::new();
        for r in events {
            match hits.iter_mut().find(|(h, _)| h == r) {
                Some((_, n)) => *n += 1,
                None => hits.push((*r, 1)),
            }
            if r.width >= settings.min_width {
                let group = columns.entry((r.width, r.x)).or_default();
                if !group.contains(r) {
                    group.push(*r);
                }
            }
            if r.height >= settings.min_height {
                let group = rows.entry((r.height, r.y)).or_default();
                if !group.contains(r) {
                    group.push(*r);
                }
            }
        }
        Self {
            width,
            height,
            min_width: settings.min_width,
            min_height: settings.min_height,
            events,
            hits,
            columns,
            rows,
        }
    }

    fn window_area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    fn big_enough(&self, r: &Rectangle) -> bool {
        r.width >= self.min_width && r.height >= self.min_height
    }

    fn hits_of(&self, r: &Rectangle) -> u64 {
        self.hits.iter().find(|(h, _)| h == r).map_or(0, |(_, n)| *n)
    }

    /// Damaged pixels inside and outside `region`, weighted by hits.
    fn in_out(&self, region: &Rectangle, ignore_pixels: u64) -> (u64, u64) {
        self.hits.iter().fold((0, 0), |(i, o), (r, n)| {
            let inside = r.intersection(region).map_or(0, |x| x.area());
            let outside: u64 = r
                .subtract(region)
                .iter()
                .map(Rectangle::area)
                .filter(|a| *a >= ignore_pixels)
                .sum();
            (i + inside * n, o + outside * n)
        })
    }

    /// Bigger wins, as long as it keeps more damage in than out.
    fn score_in_out(&self, region: &Rectangle, (inside, outside): (u64, u64)) -> u32 {
        let total = inside + outside;
        if total == 0 {
            return 0;
        }
        let in_region = inside as f64 / total as f64;
        let covered = region.width.min(self.width) as f64 * region.height.min(self.height) as f64;
        let in_window = covered / self.window_area().max(1) as f64;
        let ratio = in_region / in_window;
        let boost = 1.0 + in_window;
        (boost * 5.0 + 100.0 * ratio.powf(boost)) as u32
    }

    fn score(&self, region: &Rectangle, ignore_pixels: u64) -> u32 {
        if !self.big_enough(region) || region.area() > self.window_area() {
            return 0;
        }
        self.score_in_out(region, self.in_out(region, ignore_pixels))
    }

    fn describe(&self, rect: Rectangle, events: &[Rectangle], from: Instant, now: Instant) -> SubregionInfo {
        let (pixels_in, pixels_out) = self.in_out(&rect, 0);
        let elapsed = now.saturating_duration_since(from).as_secs_f64().max(0.001);
        let area = rect.area().max(1);
        let mut left = vec![rect];
        for e in events {
            left = left.iter().flat_map(|piece| piece.subtract(e)).collect();
            if left.is_empty() {
                break;
            }
        }
        let untouched: u64 = left.iter().map(Rectangle::area).sum();
        SubregionInfo {
            rectangle: rect,
            score: self.score_in_out(&rect, (pixels_in, pixels_out)),
            pixels_in,
            pixels_out,
            fps: (pixels_in as f64 / area as f64 / elapsed) as u32,
            damaged: (100 - 100 * untouched / area) as u8,
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
