//! Frame buffers and the frame-source contract
//!
//! The renderer only sees [`FrameSource`]. Decoding real video is someone
//! else's job; the sources here cover still images and a calibration test
//! pattern, which is what the projection surface needs while it is being
//! mapped.

use anyhow::{Context, Result};
use image::{ImageBuffer, ImageOutputFormat, Rgb, RgbImage};
use std::io::Cursor;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::error::{WarpError, WarpResult};
use crate::playlist::VideoCue;

/// Bytes per pixel of every frame (packed RGB)
pub const CHANNELS: usize = 3;

/// How long a still image is shown when the cue has no duration
pub const DEFAULT_STILL_DURATION: Duration = Duration::from_secs(10);

/// Packed RGB8 frame
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl Frame {
    pub fn new_black(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0u8; width as usize * height as usize * CHANNELS],
        }
    }

    pub fn from_rgb_image(img: RgbImage) -> Self {
        let (width, height) = img.dimensions();
        Self {
            width,
            height,
            data: img.into_raw(),
        }
    }

    pub fn stride(&self) -> usize {
        self.width as usize * CHANNELS
    }

    pub fn clear(&mut self) {
        self.data.fill(0);
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = y as usize * self.stride() + x as usize * CHANNELS;
        Some([self.data[offset], self.data[offset + 1], self.data[offset + 2]])
    }

    /// Encode to JPEG for previews
    pub fn to_jpeg(&self, quality: u8) -> Result<Vec<u8>> {
        let img: ImageBuffer<Rgb<u8>, _> =
            ImageBuffer::from_raw(self.width, self.height, self.data.as_slice())
                .ok_or_else(|| anyhow::anyhow!("Failed to create image buffer"))?;

        let mut jpeg_data = Vec::new();
        let mut cursor = Cursor::new(&mut jpeg_data);
        img.write_to(&mut cursor, ImageOutputFormat::Jpeg(quality))?;

        Ok(jpeg_data)
    }
}

/// Play/pause/seek position tracking
#[derive(Debug, Clone, Default)]
pub struct PlaybackClock {
    /// Position accumulated before the current run
    offset: Duration,
    /// Set while playing
    started: Option<Instant>,
}

impl PlaybackClock {
    pub fn play(&mut self) {
        if self.started.is_none() {
            self.started = Some(Instant::now());
        }
    }

    pub fn pause(&mut self) {
        if let Some(started) = self.started.take() {
            self.offset += started.elapsed();
        }
    }

    pub fn seek(&mut self, position: Duration) {
        self.offset = position;
        if self.started.is_some() {
            self.started = Some(Instant::now());
        }
    }

    pub fn position(&self) -> Duration {
        self.offset + self.started.map_or(Duration::ZERO, |s| s.elapsed())
    }
}

/// What the render loop needs from a video source
pub trait FrameSource: Send {
    /// Native frame size, which may differ from the output size
    fn frame_size(&self) -> (u32, u32);

    /// Frame to show at `timestamp`, or `FrameNotReady`
    fn current_frame(&mut self, timestamp: Duration) -> WarpResult<&Frame>;

    fn seek(&mut self, position: Duration);
    fn play(&mut self);
    fn pause(&mut self);

    /// Current playback position
    fn position(&self) -> Duration;

    /// Completion signal: the source has played to its end
    fn is_complete(&self) -> bool;
}

/// A decoded still image shown for a fixed duration
pub struct StillImageSource {
    frame: Frame,
    duration: Duration,
    clock: PlaybackClock,
}

impl StillImageSource {
    pub fn open(path: &Path, duration: Duration) -> Result<Self> {
        let img = image::open(path)
            .with_context(|| format!("Failed to decode image {:?}", path))?
            .to_rgb8();
        info!("Loaded still {:?} ({}x{})", path, img.width(), img.height());
        Ok(Self::from_frame(Frame::from_rgb_image(img), duration))
    }

    pub fn from_frame(frame: Frame, duration: Duration) -> Self {
        Self {
            frame,
            duration,
            clock: PlaybackClock::default(),
        }
    }
}

impl FrameSource for StillImageSource {
    fn frame_size(&self) -> (u32, u32) {
        (self.frame.width, self.frame.height)
    }

    fn current_frame(&mut self, _timestamp: Duration) -> WarpResult<&Frame> {
        Ok(&self.frame)
    }

    fn seek(&mut self, position: Duration) {
        self.clock.seek(position);
    }

    fn play(&mut self) {
        self.clock.play();
    }

    fn pause(&mut self) {
        self.clock.pause();
    }

    fn position(&self) -> Duration {
        self.clock.position()
    }

    fn is_complete(&self) -> bool {
        self.clock.position() >= self.duration
    }
}

/// Animated grid pattern for lining the mesh up with the surface
pub struct TestPatternSource {
    frame: Frame,
    duration: Option<Duration>,
    clock: PlaybackClock,
    /// Pattern phase the frame was last drawn for
    drawn_phase: Option<u32>,
}

/// Checker cell size of the test pattern, in pixels
const PATTERN_CELL: u32 = 40;

impl TestPatternSource {
    pub fn new(width: u32, height: u32, duration: Option<Duration>) -> Self {
        Self {
            frame: Frame::new_black(width, height),
            duration,
            clock: PlaybackClock::default(),
            drawn_phase: None,
        }
    }

    fn draw(&mut self, phase: u32) {
        let width = self.frame.width;
        let stride = self.frame.stride();
        if stride == 0 {
            return;
        }
        for (y, row) in self.frame.data.chunks_exact_mut(stride).enumerate() {
            let y = y as u32;
            for x in 0..width {
                let shifted = x + phase;
                let checker = ((shifted / PATTERN_CELL) + (y / PATTERN_CELL)) % 2 == 0;
                let line = shifted % PATTERN_CELL == 0 || y % PATTERN_CELL == 0;
                let rgb = if line {
                    [255, 255, 255]
                } else if checker {
                    [40, 40, 160]
                } else {
                    [20, 20, 20]
                };
                let offset = x as usize * CHANNELS;
                row[offset..offset + CHANNELS].copy_from_slice(&rgb);
            }
        }
        self.drawn_phase = Some(phase);
    }
}

impl FrameSource for TestPatternSource {
    fn frame_size(&self) -> (u32, u32) {
        (self.frame.width, self.frame.height)
    }

    fn current_frame(&mut self, timestamp: Duration) -> WarpResult<&Frame> {
        // Scroll one cell per second
        let phase = ((timestamp.as_secs_f64() * PATTERN_CELL as f64) as u32) % (2 * PATTERN_CELL);
        if self.drawn_phase != Some(phase) {
            self.draw(phase);
        }
        Ok(&self.frame)
    }

    fn seek(&mut self, position: Duration) {
        self.clock.seek(position);
    }

    fn play(&mut self) {
        self.clock.play();
    }

    fn pause(&mut self) {
        self.clock.pause();
    }

    fn position(&self) -> Duration {
        self.clock.position()
    }

    fn is_complete(&self) -> bool {
        self.duration.is_some_and(|d| self.clock.position() >= d)
    }
}

/// Stand-in for media that could not be loaded. Never has a frame.
pub struct UnavailableSource {
    size: (u32, u32),
    duration: Duration,
    clock: PlaybackClock,
}

impl UnavailableSource {
    pub fn new(width: u32, height: u32, duration: Duration) -> Self {
        Self {
            size: (width, height),
            duration,
            clock: PlaybackClock::default(),
        }
    }
}

impl FrameSource for UnavailableSource {
    fn frame_size(&self) -> (u32, u32) {
        self.size
    }

    fn current_frame(&mut self, _timestamp: Duration) -> WarpResult<&Frame> {
        Err(WarpError::FrameNotReady)
    }

    fn seek(&mut self, position: Duration) {
        self.clock.seek(position);
    }

    fn play(&mut self) {
        self.clock.play();
    }

    fn pause(&mut self) {
        self.clock.pause();
    }

    fn position(&self) -> Duration {
        self.clock.position()
    }

    fn is_complete(&self) -> bool {
        self.clock.position() >= self.duration
    }
}

/// uri prefix selecting the built-in test pattern
pub const PATTERN_URI: &str = "pattern:";

/// Pick a source implementation for a cue. Load failures degrade to an
/// [`UnavailableSource`] rather than an error.
pub fn open_source(cue: &VideoCue, width: u32, height: u32) -> Box<dyn FrameSource> {
    let duration = cue.play_duration();

    if cue.uri.starts_with(PATTERN_URI) {
        return Box::new(TestPatternSource::new(width, height, duration));
    }

    let path = cue.uri.strip_prefix("file://").unwrap_or(&cue.uri);
    match StillImageSource::open(Path::new(path), duration.unwrap_or(DEFAULT_STILL_DURATION)) {
        Ok(source) => Box::new(source),
        Err(e) => {
            warn!("Cue {:?} unavailable: {:#}", cue.name, e);
            Box::new(UnavailableSource::new(width, height, duration.unwrap_or(Duration::ZERO)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_pixels() {
        let mut frame = Frame::new_black(4, 2);
        assert_eq!(frame.data.len(), 4 * 2 * 3);
        frame.data[3 * 5..3 * 5 + 3].copy_from_slice(&[1, 2, 3]);
        assert_eq!(frame.pixel(1, 1), Some([1, 2, 3]));
        assert_eq!(frame.pixel(4, 0), None);
        frame.clear();
        assert_eq!(frame.pixel(1, 1), Some([0, 0, 0]));
    }

    #[test]
    fn test_jpeg_encoding() {
        let frame = Frame::new_black(16, 16);
        let jpeg = frame.to_jpeg(70).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_clock_seek_and_pause() {
        let mut clock = PlaybackClock::default();
        assert_eq!(clock.position(), Duration::ZERO);
        clock.seek(Duration::from_secs(3));
        assert_eq!(clock.position(), Duration::from_secs(3));
        clock.play();
        assert!(clock.position() >= Duration::from_secs(3));
        clock.pause();
        let paused = clock.position();
        assert_eq!(clock.position(), paused);
    }

    #[test]
    fn test_still_completes_after_duration() {
        let mut source = StillImageSource::from_frame(Frame::new_black(2, 2), Duration::from_secs(5));
        assert!(!source.is_complete());
        source.seek(Duration::from_secs(5));
        assert!(source.is_complete());
        source.seek(Duration::ZERO);
        assert!(!source.is_complete());
        assert!(source.current_frame(Duration::ZERO).is_ok());
    }

    #[test]
    fn test_pattern_has_grid_lines() {
        let mut source = TestPatternSource::new(100, 100, None);
        let frame = source.current_frame(Duration::ZERO).unwrap();
        assert_eq!(frame.pixel(0, 10), Some([255, 255, 255]));
        assert_eq!(frame.pixel(10, 0), Some([255, 255, 255]));
        assert_ne!(frame.pixel(10, 10), Some([255, 255, 255]));
        assert!(!source.is_complete());
    }

    #[test]
    fn test_missing_media_is_unavailable() {
        let cue = VideoCue::new("missing", "/nonexistent/clip.png", false, Some(0.0));
        let mut source = open_source(&cue, 32, 24);
        assert_eq!(source.frame_size(), (32, 24));
        assert_eq!(source.current_frame(Duration::ZERO).err(), Some(WarpError::FrameNotReady));
        assert!(source.is_complete());
    }

    #[test]
    fn test_oversized_duration_plays_without_end() {
        let cue = VideoCue::new("big", "pattern:grid", false, Some(1e20));
        let mut source = open_source(&cue, 8, 8);
        source.play();
        assert!(source.current_frame(Duration::ZERO).is_ok());
        assert!(!source.is_complete());
    }

    #[test]
    fn test_zero_width_pattern() {
        let mut source = TestPatternSource::new(0, 4, None);
        assert!(source.current_frame(Duration::ZERO).is_ok());
    }

    #[test]
    fn test_pattern_uri() {
        let cue = VideoCue::new("grid", "pattern:grid", true, None);
        let mut source = open_source(&cue, 64, 48);
        assert!(source.current_frame(Duration::ZERO).is_ok());
        assert!(!source.is_complete());
    }
}
