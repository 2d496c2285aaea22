//! Array-of-bytes signatures with wildcards.
//!
//! A [`BytePattern`] can be written in two notations that produce the same
//! structure:
//!
//! - IDA-style: whitespace-separated hex tokens, `?` or `??` for a wildcard
//!   (`"48 8B ?? ? 05"`).
//! - Code-style: a byte array plus a mask string where `x` means "match"
//!   and `?` means "any byte" (`(b"\x48\x8B\x00\x00\x05", "xx??x")`).

use std::{fmt, str::FromStr};

/// An error produced while parsing a [`BytePattern`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PatternError {
    /// The pattern has no bytes.
    #[error("Empty pattern")]
    Empty,

    /// A token is neither a hex byte nor a wildcard.
    #[error("Invalid pattern token `{0}`")]
    InvalidToken(String),

    /// The mask contains a character other than `x` or `?`.
    #[error("Invalid mask character `{0}`")]
    InvalidMask(char),

    /// The byte array and the mask have different lengths.
    #[error("Mask length {mask} does not match byte length {bytes}")]
    LengthMismatch {
        /// Number of bytes.
        bytes: usize,

        /// Number of mask characters.
        mask: usize,
    },
}

/// A byte signature where each position is either an exact byte or a
/// wildcard.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BytePattern {
    tokens: Vec<Option<u8>>,
}

impl BytePattern {
    /// Parses an IDA-style pattern.
    pub fn from_ida(pattern: &str) -> Result<Self, PatternError> {
        let tokens = pattern
            .split_whitespace()
            .map(|token| match token {
                "?" | "??" => Ok(None),
                _ if token.len() == 2 => u8::from_str_radix(token, 16)
                    .map(Some)
                    .map_err(|_| PatternError::InvalidToken(token.into())),
                _ => Err(PatternError::InvalidToken(token.into())),
            })
            .collect::<Result<Vec<_>, _>>()?;

        Self::from_tokens(tokens)
    }

    /// Builds a pattern from a byte array and an `x`/`?` mask.
    ///
    /// Bytes under a `?` mask position are ignored.
    pub fn from_mask(bytes: &[u8], mask: &str) -> Result<Self, PatternError> {
        if bytes.len() != mask.chars().count() {
            return Err(PatternError::LengthMismatch {
                bytes: bytes.len(),
                mask: mask.chars().count(),
            });
        }

        let tokens = bytes
            .iter()
            .zip(mask.chars())
            .map(|(&byte, mask)| match mask {
                'x' | 'X' => Ok(Some(byte)),
                '?' => Ok(None),
                other => Err(PatternError::InvalidMask(other)),
            })
            .collect::<Result<Vec<_>, _>>()?;

        Self::from_tokens(tokens)
    }

    /// Builds an exact-match pattern.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PatternError> {
        Self::from_tokens(bytes.iter().copied().map(Some).collect())
    }

    fn from_tokens(tokens: Vec<Option<u8>>) -> Result<Self, PatternError> {
        if tokens.is_empty() {
            return Err(PatternError::Empty);
        }

        Ok(Self { tokens })
    }

    /// Returns the number of positions in the pattern.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Always `false`; empty patterns cannot be constructed.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Returns the `(byte, wildcard)` positions of the pattern.
    pub fn tokens(&self) -> &[Option<u8>] {
        &self.tokens
    }

    /// Checks whether the pattern matches `haystack` at `position`.
    pub fn matches_at(&self, haystack: &[u8], position: usize) -> bool {
        let Some(window) = haystack.get(position..position + self.tokens.len())
        else {
            return false;
        };

        window
            .iter()
            .zip(&self.tokens)
            .all(|(&byte, token)| token.is_none_or(|expected| expected == byte))
    }

    /// Returns the offsets of all matches in `haystack`, in ascending order.
    ///
    /// Overlapping matches are all reported.
    pub fn find_iter<'a>(&'a self, haystack: &'a [u8]) -> impl Iterator<Item = usize> + 'a {
        let last = haystack.len().checked_sub(self.tokens.len());

        // Anchor on the first exact byte so that candidates come from memchr.
        let anchor = self
            .tokens
            .iter()
            .enumerate()
            .find_map(|(index, token)| token.map(|byte| (index, byte)));

        let candidates: Box<dyn Iterator<Item = usize> + 'a> = match (last, anchor) {
            (None, _) => Box::new(std::iter::empty()),
            (Some(last), None) => Box::new(0..=last),
            (Some(last), Some((index, byte))) => Box::new(
                memchr::memchr_iter(byte, &haystack[index..=last + index])
                    .filter(move |&position| position <= last),
            ),
        };

        candidates.filter(move |&position| self.matches_at(haystack, position))
    }

    /// Returns the offset of the first match in `haystack`.
    pub fn find(&self, haystack: &[u8]) -> Option<usize> {
        self.find_iter(haystack).next()
    }
}

impl FromStr for BytePattern {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_ida(s)
    }
}

impl fmt::Display for BytePattern {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (index, token) in self.tokens.iter().enumerate() {
            if index > 0 {
                f.write_str(" ")?;
            }

            match token {
                Some(byte) => write!(f, "{byte:02X}")?,
                None => f.write_str("??")?,
            }
        }

        Ok(())
    }
}
