use crate::error::IngestError;
use crate::models::TextChunk;
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 500,
            overlap: 100,
        }
    }
}

impl ChunkingConfig {
    pub fn validate(&self) -> Result<(), IngestError> {
        if self.chunk_size == 0 {
            return Err(IngestError::InvalidChunkConfig(
                "chunk_size must be positive".to_string(),
            ));
        }
        if self.overlap >= self.chunk_size {
            return Err(IngestError::InvalidChunkConfig(format!(
                "overlap {} must be smaller than chunk_size {}",
                self.overlap, self.chunk_size
            )));
        }
        Ok(())
    }
}

pub fn normalize_whitespace(text: &str) -> String {
    text.replace('\u{a0}', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Fixed-size character windows; each window starts `chunk_size - overlap`
/// characters after the previous one.
pub fn split_fixed(text: &str, config: ChunkingConfig) -> Result<Vec<String>, IngestError> {
    config.validate()?;

    let chars: Vec<char> = text.chars().collect();
    if chars.is_empty() {
        return Ok(Vec::new());
    }

    let step = config.chunk_size - config.overlap;
    let mut pieces = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        let end = (start + config.chunk_size).min(chars.len());
        pieces.push(chars[start..end].iter().collect::<String>());
        if end == chars.len() {
            break;
        }
        start += step;
    }

    Ok(pieces)
}

pub fn build_chunks(
    document_path: &str,
    text: &str,
    config: ChunkingConfig,
) -> Result<Vec<TextChunk>, IngestError> {
    let normalized = normalize_whitespace(text);
    let pieces = split_fixed(&normalized, config)?;

    Ok(pieces
        .into_iter()
        .enumerate()
        .map(|(index, piece)| TextChunk {
            chunk_id: chunk_id(document_path, index as u64),
            document_path: document_path.to_string(),
            index: index as u64,
            text: piece,
        })
        .collect())
}

fn chunk_id(document_path: &str, index: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document_path.as_bytes());
    hasher.update(b":");
    hasher.update(index.to_le_bytes());
    format!("{:x}", hasher.finalize())
}
