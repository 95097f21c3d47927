//! WordPiece vocabulary management and export
//!
//! The tokenizer side of the pipeline: a bidirectional token/id mapping
//! with ids contiguous from 0 to N-1, plus the exporter that writes the
//! newline-delimited ordered token list consumed by the on-device decoder.
//! Line index i of the exported file equals the token whose id is i.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::error::{ExportError, Result};

/// Vocabulary mapping between tokens and IDs
///
/// IDs are contiguous: every id in `[0, len)` maps to exactly one token.
#[derive(Debug, Clone)]
pub struct Vocabulary {
    /// Token to ID mapping
    token_to_id: HashMap<String, u32>,
    /// Tokens in ascending-id order (index = token ID)
    ordered: Vec<String>,
}

impl Vocabulary {
    /// Create a new vocabulary from a token list
    ///
    /// # Arguments
    ///
    /// * `tokens` - List of tokens in order (index = token ID)
    ///
    /// # Errors
    ///
    /// Returns error if the token list is empty or contains duplicates.
    pub fn from_tokens(tokens: Vec<String>) -> Result<Self> {
        if tokens.is_empty() {
            return Err(ExportError::FormatError {
                reason: "Vocabulary cannot be empty".to_string(),
            });
        }

        let mut token_to_id = HashMap::with_capacity(tokens.len());

        for (id, token) in tokens.iter().enumerate() {
            let id = u32::try_from(id).map_err(|_| ExportError::FormatError {
                reason: format!("Token ID {id} exceeds u32 limit"),
            })?;

            if token_to_id.insert(token.clone(), id).is_some() {
                return Err(ExportError::FormatError {
                    reason: format!("Duplicate token: {token}"),
                });
            }
        }

        Ok(Self {
            token_to_id,
            ordered: tokens,
        })
    }

    /// Create a vocabulary from a token-to-id map
    ///
    /// # Errors
    ///
    /// Returns error if the ids do not exactly cover `[0, N)` (a gapped or
    /// duplicated id space would silently corrupt the exported token order).
    pub fn from_token_map(map: HashMap<String, u32>) -> Result<Self> {
        if map.is_empty() {
            return Err(ExportError::FormatError {
                reason: "Vocabulary cannot be empty".to_string(),
            });
        }

        let mut ordered = vec![None::<String>; map.len()];
        for (token, id) in &map {
            let slot =
                ordered
                    .get_mut(*id as usize)
                    .ok_or_else(|| ExportError::FormatError {
                        reason: format!(
                            "Token id {id} out of range for vocabulary of size {}",
                            map.len()
                        ),
                    })?;
            if slot.replace(token.clone()).is_some() {
                return Err(ExportError::FormatError {
                    reason: format!("Duplicate token id: {id}"),
                });
            }
        }

        // Every slot is filled: N entries landed in N distinct slots.
        let ordered: Vec<String> = ordered.into_iter().flatten().collect();

        Ok(Self {
            token_to_id: map,
            ordered,
        })
    }

    /// Load a vocabulary from a newline-delimited token file
    ///
    /// # Errors
    ///
    /// Returns error if the file is unreadable or malformed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|e| ExportError::IoError {
            message: format!("Failed to read vocabulary '{}': {e}", path.display()),
        })?;

        let tokens: Vec<String> = contents.lines().map(str::to_string).collect();
        Self::from_tokens(tokens)
    }

    /// Get token ID for a token
    ///
    /// Returns `None` if the token is not in the vocabulary.
    #[must_use]
    pub fn get_id(&self, token: &str) -> Option<u32> {
        self.token_to_id.get(token).copied()
    }

    /// Get the token for an ID
    ///
    /// Returns `None` if the ID is out of range.
    #[must_use]
    pub fn get_token(&self, id: u32) -> Option<&str> {
        self.ordered.get(id as usize).map(String::as_str)
    }

    /// Number of tokens
    #[must_use]
    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    /// Whether the vocabulary is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    /// Tokens in ascending-id order
    #[must_use]
    pub fn ordered_tokens(&self) -> &[String] {
        &self.ordered
    }
}

/// Write the vocabulary as a newline-delimited ordered token list
///
/// Line index i (0-based) is the token whose id is i. Creates the
/// destination directory (and parents) if absent. An existing file is
/// overwritten directly.
///
/// # Returns
///
/// Number of tokens written.
///
/// # Errors
///
/// Returns error if the destination is unwritable.
pub fn write_vocab(vocab: &Vocabulary, path: &Path) -> Result<usize> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| ExportError::IoError {
            message: format!("Failed to create directory '{}': {e}", parent.display()),
        })?;
    }

    let mut contents = String::new();
    for token in vocab.ordered_tokens() {
        contents.push_str(token);
        contents.push('\n');
    }

    fs::write(path, contents).map_err(|e| ExportError::IoError {
        message: format!("Failed to write vocabulary '{}': {e}", path.display()),
    })?;

    Ok(vocab.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tokens() -> Vec<String> {
        vec![
            "[PAD]".to_string(),
            "[UNK]".to_string(),
            "[CLS]".to_string(),
            "[SEP]".to_string(),
            "[MASK]".to_string(),
            "שלום".to_string(),
            "##ים".to_string(),
        ]
    }

    #[test]
    fn test_from_tokens_roundtrip() {
        let vocab = Vocabulary::from_tokens(sample_tokens()).unwrap();
        assert_eq!(vocab.len(), 7);
        assert_eq!(vocab.get_id("שלום"), Some(5));
        assert_eq!(vocab.get_token(6), Some("##ים"));
        assert_eq!(vocab.get_token(7), None);
    }

    #[test]
    fn test_empty_vocabulary_rejected() {
        assert!(Vocabulary::from_tokens(vec![]).is_err());
    }

    #[test]
    fn test_duplicate_token_rejected() {
        let result = Vocabulary::from_tokens(vec!["a".to_string(), "a".to_string()]);
        assert!(matches!(
            result.unwrap_err(),
            ExportError::FormatError { .. }
        ));
    }

    #[test]
    fn test_from_token_map_orders_by_id() {
        let mut map = HashMap::new();
        map.insert("c".to_string(), 2);
        map.insert("a".to_string(), 0);
        map.insert("b".to_string(), 1);

        let vocab = Vocabulary::from_token_map(map).unwrap();
        assert_eq!(vocab.ordered_tokens(), &["a", "b", "c"]);
    }

    #[test]
    fn test_from_token_map_rejects_gap() {
        let mut map = HashMap::new();
        map.insert("a".to_string(), 0);
        map.insert("b".to_string(), 2);

        assert!(Vocabulary::from_token_map(map).is_err());
    }

    #[test]
    fn test_write_vocab_line_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("vocab.txt");

        let vocab = Vocabulary::from_tokens(sample_tokens()).unwrap();
        let written = write_vocab(&vocab, &path).unwrap();
        assert_eq!(written, 7);

        let contents = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 7);
        for (i, line) in lines.iter().enumerate() {
            assert_eq!(Some(*line), vocab.get_token(u32::try_from(i).unwrap()));
        }
    }

    #[test]
    fn test_write_vocab_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vocab.txt");

        let first = Vocabulary::from_tokens(sample_tokens()).unwrap();
        write_vocab(&first, &path).unwrap();

        let second = Vocabulary::from_tokens(vec!["x".to_string(), "y".to_string()]).unwrap();
        write_vocab(&second, &path).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "x\ny\n");
    }

    #[test]
    fn test_large_vocabulary_line_count() {
        // End-to-end property: 128k tokens produce exactly 128k lines.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vocab.txt");

        let tokens: Vec<String> = (0..128_000).map(|i| format!("tok{i}")).collect();
        let vocab = Vocabulary::from_tokens(tokens).unwrap();
        write_vocab(&vocab, &path).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 128_000);
        assert_eq!(contents.lines().next(), Some("tok0"));
        assert_eq!(contents.lines().last(), Some("tok127999"));
    }

    #[test]
    fn test_from_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vocab.txt");

        let vocab = Vocabulary::from_tokens(sample_tokens()).unwrap();
        write_vocab(&vocab, &path).unwrap();

        let loaded = Vocabulary::from_file(&path).unwrap();
        assert_eq!(loaded.ordered_tokens(), vocab.ordered_tokens());
    }
}
