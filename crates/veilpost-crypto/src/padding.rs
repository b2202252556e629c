//! Two padding layers
//!
//! Traffic padding hides message size from an observer of ciphertexts by
//! growing the plaintext to a fixed bucket:
//!
//! ```text
//! "\x01VP2" | length (5 ASCII digits) | content | printable filler
//! ```
//!
//! Protocol padding is applied to the result just before encryption:
//!
//! ```text
//! length (u16 big-endian) | bytes | zeros up to calc_padded_len(length)
//! ```
//!
//! Encoding runs traffic then protocol. Decoding runs protocol then traffic.

use rand::{CryptoRng, Rng, RngCore};

use crate::error::CryptoError;

/// Smallest plaintext the protocol layer accepts
pub const MIN_PLAINTEXT_SIZE: usize = 1;

/// Largest plaintext the protocol layer accepts
pub const MAX_PLAINTEXT_SIZE: usize = 65_535;

/// Size buckets for traffic padding, ascending
pub const TRAFFIC_BUCKETS: [usize; 9] = [256, 512, 1024, 2048, 4096, 8192, 16384, 32768, 65000];

/// Marker prefixing traffic-padded text
pub const PADDING_MARKER: &str = "\u{1}VP2";

/// Marker of the superseded traffic padding format, decoded only
pub const LEGACY_PADDING_MARKER: &str = "\u{1}VP1";

const LENGTH_DIGITS: usize = 5;
const LEGACY_LENGTH_DIGITS: usize = 3;

/// Bytes taken by the marker and length field
pub const TRAFFIC_HEADER_SIZE: usize = PADDING_MARKER.len() + LENGTH_DIGITS;

/// Padded length of the protocol layer for a plaintext of `unpadded_len`
/// bytes, excluding the 2-byte length prefix.
///
/// Minimum 32. Above that, rounds up to a chunk of 32 bytes until 256, then
/// to an eighth of the next power of two.
pub fn calc_padded_len(unpadded_len: usize) -> usize {
    if unpadded_len <= 32 {
        return 32;
    }

    let next_power = unpadded_len.next_power_of_two();
    let chunk = if next_power <= 256 { 32 } else { next_power / 8 };

    chunk * unpadded_len.div_ceil(chunk)
}

/// Apply protocol padding.
///
/// # Errors
///
/// - `InvalidPlaintextLength`: empty or longer than [`MAX_PLAINTEXT_SIZE`]
pub fn pad(plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let length = plaintext.len();
    if !(MIN_PLAINTEXT_SIZE..=MAX_PLAINTEXT_SIZE).contains(&length) {
        return Err(CryptoError::InvalidPlaintextLength { length });
    }

    let padded_len = calc_padded_len(length);
    let mut padded = Vec::with_capacity(2 + padded_len);
    padded.extend_from_slice(&(length as u16).to_be_bytes());
    padded.extend_from_slice(plaintext);
    padded.resize(2 + padded_len, 0);

    Ok(padded)
}

/// Remove protocol padding.
///
/// Strict: the length prefix must be in range, the total size must match
/// [`calc_padded_len`] exactly and every filler byte must be zero.
pub fn unpad(padded: &[u8]) -> Result<&[u8], CryptoError> {
    let [hi, lo, body @ ..] = padded else {
        return Err(CryptoError::InvalidPaddingLength { reason: "missing length prefix" });
    };

    let length = usize::from(u16::from_be_bytes([*hi, *lo]));
    if length < MIN_PLAINTEXT_SIZE {
        return Err(CryptoError::InvalidPaddingLength { reason: "zero length prefix" });
    }
    if body.len() != calc_padded_len(length) {
        return Err(CryptoError::InvalidPaddingLength { reason: "padded size mismatch" });
    }

    let (plaintext, filler) = body.split_at(length);
    if filler.iter().any(|&b| b != 0) {
        return Err(CryptoError::InvalidPaddingLength { reason: "non-zero filler" });
    }

    Ok(plaintext)
}

/// Smallest traffic bucket that fits `content_len` bytes plus the header.
///
/// `None` when the content is too large for every bucket.
pub fn calculate_padded_size(content_len: usize) -> Option<usize> {
    let needed = content_len.checked_add(TRAFFIC_HEADER_SIZE)?;
    TRAFFIC_BUCKETS.iter().copied().find(|&bucket| bucket >= needed)
}

/// Grow `content` to its traffic bucket.
///
/// Content that fits no bucket is returned unchanged.
pub fn apply_traffic_padding<R: RngCore + CryptoRng>(content: &str, rng: &mut R) -> String {
    let Some(bucket) = calculate_padded_size(content.len()) else {
        tracing::debug!(len = content.len(), "content exceeds largest padding bucket");
        return content.to_owned();
    };

    let mut padded = String::with_capacity(bucket);
    padded.push_str(PADDING_MARKER);
    padded.push_str(&format!("{:0width$}", content.len(), width = LENGTH_DIGITS));
    padded.push_str(content);
    while padded.len() < bucket {
        padded.push(char::from(rng.gen_range(0x21u8..=0x7e)));
    }

    padded
}

/// Strip traffic padding, accepting both the current and legacy formats.
///
/// Text without a recognised marker is returned as-is.
///
/// # Errors
///
/// - `InvalidPaddingLength`: a marker is present but the length field is
///   malformed or exceeds the remaining text
pub fn remove_traffic_padding(text: &str) -> Result<&str, CryptoError> {
    if let Some(rest) = text.strip_prefix(PADDING_MARKER) {
        return extract_content(rest, LENGTH_DIGITS);
    }
    if let Some(rest) = text.strip_prefix(LEGACY_PADDING_MARKER) {
        return extract_content(rest, LEGACY_LENGTH_DIGITS);
    }

    Ok(text)
}

fn extract_content(rest: &str, digits: usize) -> Result<&str, CryptoError> {
    let header = rest
        .get(..digits)
        .ok_or(CryptoError::InvalidPaddingLength { reason: "truncated length field" })?;
    if !header.bytes().all(|b| b.is_ascii_digit()) {
        return Err(CryptoError::InvalidPaddingLength { reason: "non-numeric length field" });
    }

    let length: usize = header
        .parse()
        .map_err(|_| CryptoError::InvalidPaddingLength { reason: "non-numeric length field" })?;

    rest[digits..]
        .get(..length)
        .ok_or(CryptoError::InvalidPaddingLength { reason: "length exceeds padded text" })
}
