//! Cue list for a performance

use anyhow::{Context, Result};
use base64::Engine;
use image::ImageOutputFormat;
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::{WarpError, WarpResult};

/// Thumbnail bounding box in pixels
const THUMBNAIL_SIZE: (u32, u32) = (160, 90);

/// One playable source plus its performance-time behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoCue {
    pub id: String,
    pub name: String,
    pub uri: String,
    /// Restart from the beginning instead of completing
    #[serde(rename = "loop")]
    pub looping: bool,
    /// Length in seconds, when known
    #[serde(default)]
    pub duration: Option<f64>,
    /// `data:` URI preview image
    #[serde(default)]
    pub thumbnail: Option<String>,
    /// Unix milliseconds
    pub created_at: u64,
}

impl VideoCue {
    pub fn new(name: &str, uri: &str, looping: bool, duration: Option<f64>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            uri: uri.to_string(),
            looping,
            duration,
            thumbnail: None,
            created_at: now_millis(),
        }
    }

    /// Duration as a `Duration`; `None` when unknown or not representable
    pub fn play_duration(&self) -> Option<Duration> {
        self.duration.and_then(|d| Duration::try_from_secs_f64(d).ok())
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Build a JPEG `data:` URI thumbnail for an image file
pub fn make_thumbnail(path: &Path) -> Result<String> {
    let img = image::open(path)
        .with_context(|| format!("Failed to decode image {:?}", path))?
        .thumbnail(THUMBNAIL_SIZE.0, THUMBNAIL_SIZE.1)
        .to_rgb8();

    let mut jpeg = Vec::new();
    img.write_to(&mut Cursor::new(&mut jpeg), ImageOutputFormat::Jpeg(70))
        .context("Failed to encode thumbnail")?;

    Ok(format!(
        "data:image/jpeg;base64,{}",
        base64::engine::general_purpose::STANDARD.encode(jpeg)
    ))
}

/// Ordered cues plus the cue cursor
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Playlist {
    cues: Vec<VideoCue>,
    current_cue_index: usize,
}

impl Playlist {
    pub fn new(cues: Vec<VideoCue>) -> Self {
        Self {
            cues,
            current_cue_index: 0,
        }
    }

    pub fn cues(&self) -> &[VideoCue] {
        &self.cues
    }

    pub fn len(&self) -> usize {
        self.cues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cues.is_empty()
    }

    pub fn current_index(&self) -> usize {
        self.current_cue_index
    }

    pub fn current(&self) -> Option<&VideoCue> {
        self.cues.get(self.current_cue_index)
    }

    /// Move the cursor. Out-of-range indices are ignored and return false.
    pub fn select(&mut self, index: usize) -> bool {
        if index < self.cues.len() {
            self.current_cue_index = index;
            true
        } else {
            false
        }
    }

    pub fn push(&mut self, cue: VideoCue) -> &VideoCue {
        self.cues.push(cue);
        &self.cues[self.cues.len() - 1]
    }

    /// Remove a cue by id. The cursor stays on the same cue when an earlier
    /// one is removed, and is pulled back if it now points past the end.
    pub fn remove(&mut self, id: &str) -> WarpResult<VideoCue> {
        let index = self
            .cues
            .iter()
            .position(|c| c.id == id)
            .ok_or_else(|| WarpError::not_found(format!("cue {}", id)))?;

        let cue = self.cues.remove(index);
        if index < self.current_cue_index {
            self.current_cue_index -= 1;
        } else if self.current_cue_index >= self.cues.len() {
            self.current_cue_index = self.cues.len().saturating_sub(1);
        }
        Ok(cue)
    }
}
