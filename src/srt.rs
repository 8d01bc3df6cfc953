use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::error::DubResult;

/// A single subtitle entry
#[derive(Debug, Clone)]
pub struct SubtitleEntry {
    /// Start time in seconds
    pub start: f64,
    /// End time in seconds
    pub end: f64,
    pub text: String,
}

impl SubtitleEntry {
    pub fn new(start: f64, end: f64, text: impl Into<String>) -> Self {
        Self {
            start,
            end,
            text: text.into(),
        }
    }
}

/// Format timestamp as SRT format: HH:MM:SS,mmm
fn format_timestamp(seconds: f64) -> String {
    let total_ms = (seconds.max(0.0) * 1000.0).round() as u64;
    let ms = total_ms % 1000;
    let total_secs = total_ms / 1000;
    let secs = total_secs % 60;
    let total_mins = total_secs / 60;
    let mins = total_mins % 60;
    let hours = total_mins / 60;

    format!("{:02}:{:02}:{:02},{:03}", hours, mins, secs, ms)
}

/// Subtitles of the dubbed output, in playback order.
#[derive(Debug, Clone, Default)]
pub struct Subtitle {
    pub entries: Vec<SubtitleEntry>,
}

impl Subtitle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, start: f64, end: f64, text: impl Into<String>) {
        self.entries.push(SubtitleEntry::new(start, end, text));
    }

    /// Write subtitle to an SRT file
    pub fn to_file(&self, path: &Path) -> DubResult<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        self.write_to(&mut writer)?;
        writer.flush()?;
        Ok(())
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> DubResult<()> {
        write!(writer, "{}", self)?;
        Ok(())
    }

    /// End of the last entry
    pub fn duration(&self) -> f64 {
        self.entries.last().map(|e| e.end).unwrap_or(0.0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for Subtitle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Indices are always sequential from 1
        for (i, entry) in self.entries.iter().enumerate() {
            writeln!(f, "{}", i + 1)?;
            writeln!(
                f,
                "{} --> {}",
                format_timestamp(entry.start),
                format_timestamp(entry.end)
            )?;
            writeln!(f, "{}", entry.text)?;
            writeln!(f)?;
        }
        Ok(())
    }
}
