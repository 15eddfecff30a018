//! Session tokens and the 16-bit wire hash
//!
//! Tokens are 12 symbols drawn from a 32-symbol alphabet with the ambiguous
//! glyphs (`I`, `O`, `0`, `1`) removed. Only the hash of a token travels over
//! the air, so [`hash_token`] must stay bit-for-bit identical on every
//! broadcaster and scanner build.

use rand::rngs::OsRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Token alphabet (32 symbols, 5 bits each)
pub const TOKEN_ALPHABET: &[u8; 32] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Token length in symbols
pub const TOKEN_LENGTH: usize = 12;

/// Minimum Shannon estimate (frequency entropy x length) a token must reach
pub const MIN_TOKEN_ENTROPY_BITS: f64 = 24.0;

/// Attempts before generation gives up
pub const MAX_GENERATION_ATTEMPTS: usize = 8;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TokenError {
    #[error("Token must be {TOKEN_LENGTH} characters, got {0}")]
    InvalidLength(usize),
    #[error("Token contains character outside the alphabet: {0:?}")]
    InvalidCharacter(char),
    #[error("Token entropy too low ({0:.1} bits)")]
    LowEntropy(f64),
    #[error("Token generation failed after {0} attempts")]
    GenerationFailed(usize),
}

/// A validated session token
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Token(String);

impl Token {
    /// Parse and validate a token. Lower-case input is accepted and normalized.
    pub fn parse(raw: &str) -> Result<Self, TokenError> {
        let normalized = raw.trim().to_ascii_uppercase();
        check_format(&normalized)?;

        let bits = estimate_entropy(&normalized);
        if bits < MIN_TOKEN_ENTROPY_BITS {
            return Err(TokenError::LowEntropy(bits));
        }

        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Wire hash of this token
    pub fn hash(&self) -> TokenHash {
        hash_token(&self.0)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Token {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// 16-bit token hash carried in the beacon minor field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TokenHash(pub u16);

impl TokenHash {
    pub fn value(self) -> u16 {
        self.0
    }
}

impl From<u16> for TokenHash {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl fmt::Display for TokenHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// Generate a fresh token from the OS random source.
///
/// Candidates that fail the format or entropy checks are discarded and
/// regenerated, up to [`MAX_GENERATION_ATTEMPTS`].
pub fn generate_token() -> Result<Token, TokenError> {
    generate_token_with(&mut OsRng)
}

pub(crate) fn generate_token_with<R: Rng + ?Sized>(rng: &mut R) -> Result<Token, TokenError> {
    for attempt in 1..=MAX_GENERATION_ATTEMPTS {
        let candidate: String = (0..TOKEN_LENGTH)
            .map(|_| TOKEN_ALPHABET[rng.gen_range(0..TOKEN_ALPHABET.len())] as char)
            .collect();

        match Token::parse(&candidate) {
            Ok(token) => return Ok(token),
            Err(e) => {
                tracing::debug!("Discarding generated token (attempt {}): {}", attempt, e);
            }
        }
    }

    tracing::error!("Token generation exhausted {} attempts", MAX_GENERATION_ATTEMPTS);
    Err(TokenError::GenerationFailed(MAX_GENERATION_ATTEMPTS))
}

/// Deterministic 16-bit hash: `h = h * 31 + c` over UTF-16 code units,
/// truncated to 16 bits.
///
/// Defined for any input, including strings outside the token alphabet.
pub fn hash_token(token: &str) -> TokenHash {
    let mut h: u16 = 0;
    for unit in token.encode_utf16() {
        h = (h << 5).wrapping_sub(h).wrapping_add(unit);
    }
    TokenHash(h)
}

/// True if `token` is exactly 12 characters from the alphabet
pub fn validate_format(token: &str) -> bool {
    check_format(token).is_ok()
}

fn check_format(token: &str) -> Result<(), TokenError> {
    let len = token.chars().count();
    if len != TOKEN_LENGTH {
        return Err(TokenError::InvalidLength(len));
    }
    if let Some(bad) = token
        .chars()
        .find(|c| !c.is_ascii() || !TOKEN_ALPHABET.contains(&(*c as u8)))
    {
        return Err(TokenError::InvalidCharacter(bad));
    }
    Ok(())
}

/// Shannon entropy of the character distribution multiplied by length
pub fn estimate_entropy(token: &str) -> f64 {
    let mut counts: HashMap<char, usize> = HashMap::new();
    let mut total = 0usize;
    for c in token.chars() {
        *counts.entry(c).or_insert(0) += 1;
        total += 1;
    }
    if total == 0 {
        return 0.0;
    }

    let n = total as f64;
    let per_symbol: f64 = counts
        .values()
        .map(|&count| {
            let p = count as f64 / n;
            -p * p.log2()
        })
        .sum();

    per_symbol * n
}
