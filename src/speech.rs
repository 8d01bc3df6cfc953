use std::path::Path;

use reqwest::Client;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::error::{DubError, DubResult};

/// Renders text to an audio file at `dest`. Shared by every worker.
pub trait Synthesizer: Send + Sync {
    /// Extension (with dot) of the files this synthesizer writes, e.g. `".mp3"`.
    fn file_suffix(&self) -> &str;

    fn synthesize(&self, text: &str, language: &str, dest: &Path) -> DubResult<()>;
}

const GOOGLE_TTS_URL: &str = "https://translate.google.com/translate_tts";
/// The endpoint rejects longer queries.
const MAX_CHUNK_CHARS: usize = 100;

/// Split `text` into pieces of at most `max_chars` characters, breaking at
/// whitespace where possible.
fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();

    for word in text.split_whitespace() {
        let word_len = word.chars().count();
        let current_len = current.chars().count();
        if current_len > 0 && current_len + 1 + word_len > max_chars {
            chunks.push(std::mem::take(&mut current));
        }
        if word_len > max_chars {
            // no whitespace to break at
            let chars: Vec<char> = word.chars().collect();
            for piece in chars.chunks(max_chars) {
                let piece: String = piece.iter().collect();
                if piece.chars().count() == max_chars {
                    chunks.push(piece);
                } else {
                    current = piece;
                }
            }
            continue;
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

fn looks_like_mp3(bytes: &[u8]) -> bool {
    let is_id3 = bytes.len() > 3 && &bytes[0..3] == b"ID3";
    let is_mpeg = bytes.len() > 2 && bytes[0] == 0xFF && (bytes[1] & 0xE0) == 0xE0;
    is_id3 || is_mpeg
}

/// Google Translate text-to-speech. Produces MP3.
pub struct GoogleSpeech {
    client: Client,
    endpoint: String,
    runtime: Handle,
}

impl GoogleSpeech {
    pub fn new(runtime: Handle) -> Self {
        Self::with_endpoint(GOOGLE_TTS_URL, runtime)
    }

    pub fn with_endpoint(endpoint: impl Into<String>, runtime: Handle) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into(),
            runtime,
        }
    }

    async fn fetch_chunk(&self, chunk: &str, language: &str, index: usize, total: usize) -> DubResult<Vec<u8>> {
        let index = index.to_string();
        let total = total.to_string();
        let len = chunk.chars().count().to_string();
        let resp = self
            .client
            .get(&self.endpoint)
            .query(&[
                ("ie", "UTF-8"),
                ("client", "tw-ob"),
                ("tl", language),
                ("q", chunk),
                ("idx", index.as_str()),
                ("total", total.as_str()),
                ("textlen", len.as_str()),
            ])
            .send()
            .await
            .map_err(|e| DubError::Synthesis(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(DubError::Synthesis(format!("TTS request failed ({}): {}", status, body.trim())));
        }

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| DubError::Synthesis(e.to_string()))?;
        if !looks_like_mp3(&bytes) {
            warn!("TTS response for chunk {} does not look like MP3", index);
        }
        Ok(bytes.to_vec())
    }

    async fn synthesize_async(&self, text: &str, language: &str) -> DubResult<Vec<u8>> {
        let chunks = chunk_text(text, MAX_CHUNK_CHARS);
        if chunks.is_empty() {
            return Err(DubError::Synthesis("nothing to synthesize".into()));
        }

        // MP3 frames are self-delimiting, so payloads concatenate cleanly
        let mut audio = Vec::new();
        for (i, chunk) in chunks.iter().enumerate() {
            audio.extend(self.fetch_chunk(chunk, language, i, chunks.len()).await?);
        }
        if audio.is_empty() {
            return Err(DubError::Synthesis("empty response from TTS endpoint".into()));
        }
        Ok(audio)
    }
}

impl Synthesizer for GoogleSpeech {
    fn file_suffix(&self) -> &str {
        ".mp3"
    }

    /// Blocks the calling worker thread; must not be called from an async task.
    fn synthesize(&self, text: &str, language: &str, dest: &Path) -> DubResult<()> {
        let audio = self.runtime.block_on(self.synthesize_async(text, language))?;
        debug!("Synthesized {} bytes of speech to {}", audio.len(), dest.display());
        std::fs::write(dest, audio)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_one_chunk() {
        assert_eq!(chunk_text("नमस्ते दुनिया", 100), vec!["नमस्ते दुनिया"]);
        assert!(chunk_text("   ", 100).is_empty());
    }

    #[test]
    fn chunks_break_on_whitespace() {
        let chunks = chunk_text("aaa bbb ccc ddd", 7);
        assert_eq!(chunks, vec!["aaa bbb", "ccc ddd"]);
        assert!(chunks.iter().all(|c| c.chars().count() <= 7));
    }

    #[test]
    fn long_words_are_split() {
        let chunks = chunk_text("abcdefghij xy", 4);
        assert_eq!(chunks, vec!["abcd", "efgh", "ij", "xy"]);
    }

    #[test]
    fn chunks_count_characters_not_bytes() {
        let text = "क ".repeat(60);
        let chunks = chunk_text(&text, 100);
        assert!(chunks.iter().all(|c| c.chars().count() <= 100));
        assert_eq!(chunks.concat().replace(' ', "").chars().count(), 60);
    }

    #[test]
    fn mp3_sniffing() {
        assert!(looks_like_mp3(b"ID3\x04\x00"));
        assert!(looks_like_mp3(&[0xFF, 0xFB, 0x90]));
        assert!(!looks_like_mp3(b"<html>"));
    }
}
