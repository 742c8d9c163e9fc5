// Projector output
//
// Warped frames leave the process as raw packed RGB24, one frame after the
// other, written to a file or named pipe. Any player that reads raw video
// can put them on the projector, e.g.
//
//   mkfifo /tmp/warpcue.rgb
//   ffplay -f rawvideo -pixel_format rgb24 -video_size 1280x720 -i /tmp/warpcue.rgb
//
// Opening a FIFO blocks until a reader attaches, so the sink opens lazily
// from the render thread and retries at most once per RETRY_INTERVAL.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::frame::Frame;

const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Destination for rendered frames
pub trait FrameSink: Send {
    fn write_frame(&mut self, frame: &Frame) -> io::Result<()>;

    /// Human readable description for logs
    fn info(&self) -> String;
}

/// Discards frames; used when no output path is configured
pub struct NullSink;

impl FrameSink for NullSink {
    fn write_frame(&mut self, _frame: &Frame) -> io::Result<()> {
        Ok(())
    }

    fn info(&self) -> String {
        "none (preview only)".to_string()
    }
}

/// Raw RGB24 frames written to a file or FIFO
pub struct RawSink {
    path: PathBuf,
    file: Option<File>,
    frame_count: u64,
    dropped_count: u64,
    last_attempt: Option<Instant>,
    /// Track when we last logged a warning about dropped frames
    last_drop_warn: Option<Instant>,
}

impl RawSink {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            file: None,
            frame_count: 0,
            dropped_count: 0,
            last_attempt: None,
            last_drop_warn: None,
        }
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped_count
    }

    fn ensure_open(&mut self) -> io::Result<&mut File> {
        if self.file.is_none() {
            if self
                .last_attempt
                .is_some_and(|t| t.elapsed() < RETRY_INTERVAL)
            {
                return Err(io::Error::new(io::ErrorKind::NotConnected, "output not open"));
            }
            self.last_attempt = Some(Instant::now());
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&self.path)?;
            info!("Output opened: {:?}", self.path);
            self.file = Some(file);
        }
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "output not open"))
    }

    fn drop_frame(&mut self, err: &io::Error) {
        self.dropped_count += 1;
        let should_warn = self
            .last_drop_warn
            .map_or(true, |t| t.elapsed() >= RETRY_INTERVAL);
        if should_warn {
            warn!(
                "Output {:?} dropping frames ({} so far): {}",
                self.path, self.dropped_count, err
            );
            self.last_drop_warn = Some(Instant::now());
        }
    }
}

impl FrameSink for RawSink {
    fn write_frame(&mut self, frame: &Frame) -> io::Result<()> {
        let result = self
            .ensure_open()
            .and_then(|file| file.write_all(&frame.data));
        match result {
            Ok(()) => {
                self.frame_count += 1;
                Ok(())
            }
            Err(e) => {
                // Reader went away; reopen on a later tick
                if e.kind() == io::ErrorKind::BrokenPipe {
                    self.file = None;
                }
                self.drop_frame(&e);
                Err(e)
            }
        }
    }

    fn info(&self) -> String {
        format!(
            "{} (raw rgb24, {} written, {} dropped)",
            self.path.display(),
            self.frame_count(),
            self.dropped_count()
        )
    }
}
