//! A synthetic display: windows whose pixels are computed on demand.
//!
//! Each window advances one frame per tick. Capture renders the
//! requested rectangle of the current frame, so the engine sees real
//! pixel data with realistic change patterns (full-frame motion,
//! scrolling text, a blinking cursor line).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use pixcast_core::{CaptureBackend, CaptureError, ImageBuffer, PixelFormat, Rectangle, WindowId};

use crate::config::Content;

/// Lines the scroll content moves per frame.
const SCROLL_STEP: u32 = 4;
/// Height of one text line in the typing window.
const LINE_HEIGHT: u32 = 16;

#[derive(Debug, Clone, Copy)]
struct Surface {
    width: u32,
    height: u32,
    content: Content,
    frame: u64,
}

impl Surface {
    fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        match self.content {
            Content::Video => {
                let t = self.frame as u32;
                let r = (x.wrapping_mul(3).wrapping_add(t * 5)) as u8;
                let g = (y.wrapping_mul(2).wrapping_add(t * 3)) as u8;
                let b = ((x ^ y).wrapping_add(t * 7)) as u8;
                [b, g, r, 0xFF]
            }
            Content::Scroll => {
                // document line = screen line + scroll offset
                let line = y as u64 + self.frame * SCROLL_STEP as u64;
                text_pixel(x, line)
            }
            Content::Typing => {
                let cursor_line = (self.frame / 8) as u32 % (self.height / LINE_HEIGHT).max(1);
                let line = y / LINE_HEIGHT;
                if line < cursor_line {
                    text_pixel(x, y as u64)
                } else if line == cursor_line && x < (self.frame % 8) as u32 * 8 + 8 {
                    text_pixel(x, y as u64)
                } else {
                    [0xF0, 0xF0, 0xF0, 0xFF]
                }
            }
        }
    }

    /// Rectangle that changed between the previous frame and this one.
    fn damage(&self) -> Rectangle {
        match self.content {
            Content::Video | Content::Scroll => Rectangle::sized(self.width, self.height),
            Content::Typing => {
                let cursor_line = (self.frame / 8) as u32 % (self.height / LINE_HEIGHT).max(1);
                Rectangle::new(0, cursor_line * LINE_HEIGHT, self.width, LINE_HEIGHT)
            }
        }
    }
}

/// Dark glyph-like runs on a light background, keyed by document line.
fn text_pixel(x: u32, line: u64) -> [u8; 4] {
    let row = line % LINE_HEIGHT as u64;
    let text_line = line / LINE_HEIGHT as u64;
    let glyph = (x / 8) as u64;
    let seed = text_line.wrapping_mul(0x9E37_79B9).wrapping_add(glyph.wrapping_mul(0x85EB_CA6B));
    let ink = row > 2 && row < 13 && (seed >> 7) % 5 != 0 && (seed >> (row % 8)) & 1 == 1;
    if ink { [0x20, 0x20, 0x20, 0xFF] } else { [0xF0, 0xF0, 0xF0, 0xFF] }
}

// ── SyntheticDisplay ─────────────────────────────────────────────

/// Cloneable handle to the shared window surfaces.
#[derive(Debug, Clone, Default)]
pub struct SyntheticDisplay {
    surfaces: Arc<Mutex<HashMap<WindowId, Surface>>>,
}

impl SyntheticDisplay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_window(&self, id: WindowId, width: u32, height: u32, content: Content) {
        if let Ok(mut surfaces) = self.surfaces.lock() {
            surfaces.insert(
                id,
                Surface {
                    width,
                    height,
                    content,
                    frame: 0,
                },
            );
        }
    }

    pub fn remove_window(&self, id: WindowId) {
        if let Ok(mut surfaces) = self.surfaces.lock() {
            surfaces.remove(&id);
        }
    }

    /// Advance every window one frame; returns what each one damaged.
    pub fn tick(&self) -> Vec<(WindowId, Rectangle)> {
        let Ok(mut surfaces) = self.surfaces.lock() else {
            return Vec::new();
        };
        let mut damage: Vec<(WindowId, Rectangle)> = surfaces
            .iter_mut()
            .map(|(id, s)| {
                s.frame += 1;
                (*id, s.damage())
            })
            .collect();
        damage.sort_by_key(|(id, _)| *id);
        damage
    }

    fn render(&self, window: WindowId, rect: Rectangle) -> Result<ImageBuffer, CaptureError> {
        let surface = {
            let surfaces = self
                .surfaces
                .lock()
                .map_err(|_| CaptureError::Failed("display lock poisoned".into()))?;
            *surfaces.get(&window).ok_or(CaptureError::NoSuchWindow(window))?
        };
        let rect = rect
            .clip_to(surface.width, surface.height)
            .ok_or(CaptureError::Failed(format!("{rect:?} outside window {window}")))?;
        let mut data = Vec::with_capacity(rect.area() as usize * 4);
        for y in rect.y..rect.bottom() {
            for x in rect.x..rect.right() {
                data.extend_from_slice(&surface.pixel(x, y));
            }
        }
        Ok(ImageBuffer::new(rect, rect.width * 4, PixelFormat::Bgrx, data, Instant::now()))
    }
}

impl CaptureBackend for SyntheticDisplay {
    fn get_pixels(&mut self, window: WindowId, rect: Rectangle) -> Result<ImageBuffer, CaptureError> {
        self.render(window, rect)
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_renders_the_requested_rect() {
        let mut display = SyntheticDisplay::new();
        display.add_window(1, 64, 32, Content::Video);
        let image = display.get_pixels(1, Rectangle::new(8, 4, 16, 8)).unwrap();
        assert_eq!((image.x, image.y, image.width, image.height), (8, 4, 16, 8));
        assert_eq!(image.data.len(), 16 * 8 * 4);
        assert!(matches!(
            display.get_pixels(2, Rectangle::sized(1, 1)),
            Err(CaptureError::NoSuchWindow(2))
        ));
    }

    #[test]
    fn scroll_content_moves_up() {
        let mut display = SyntheticDisplay::new();
        display.add_window(1, 64, 64, Content::Scroll);
        let before = display.get_pixels(1, Rectangle::sized(64, 64)).unwrap();
        display.tick();
        let after = display.get_pixels(1, Rectangle::sized(64, 64)).unwrap();
        let stride = 64 * 4;
        let step = SCROLL_STEP as usize;
        assert_eq!(after.data[..stride * (64 - step)], before.data[stride * step..]);
    }

    #[test]
    fn typing_damages_one_line() {
        let display = SyntheticDisplay::new();
        display.add_window(3, 320, 160, Content::Typing);
        display.add_window(1, 100, 100, Content::Video);
        let damage = display.tick();
        assert_eq!(damage[0], (1, Rectangle::sized(100, 100)));
        assert_eq!(damage[1].1.height, LINE_HEIGHT);
        assert_eq!(damage[1].1.width, 320);
    }
}
