//! Typed skylink identifier.
//!
//! A skylink names 34 raw bytes: a 2-byte little-endian bitfield followed by
//! a 32-byte merkle root. It has two string encodings, a 46-character
//! url-safe base64 form and a 55-character base32 form (used for portal
//! subdomains). Loading validates the bitfield, so arbitrary 46-character
//! strings matched out of an email body are rejected unless they decode to a
//! structurally valid link. The base64 form is canonical: a skylink loaded
//! from its base32 form is displayed in base64.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::{alphabet, Engine};
use data_encoding::Encoding;
use thiserror::Error;

/// Size of a raw skylink in bytes.
const RAW_SIZE: usize = 34;

/// Length of the base64 encoded skylink string.
const BASE64_ENCODED_SIZE: usize = 46;

/// Length of the base32 encoded skylink string.
const BASE32_ENCODED_SIZE: usize = 55;

/// Maximum fetch size encodable in a v1 bitfield, equal to a sector.
const MAX_FETCH_SIZE: u64 = 1 << 22;

// Mail providers routinely re-wrap and re-encode links, which leaves the two
// padding bits of the final base64 symbol dirty. The upstream decoder is
// lenient about those bits, so ours is too.
static BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(base64::engine::DecodePaddingMode::RequireNone)
        .with_decode_allow_trailing_bits(true),
);

// Base32hex with lowercase symbols and no padding, as used for portal
// subdomains. Trailing bits stay unchecked here too.
static BASE32: LazyLock<Encoding> = LazyLock::new(|| {
    let mut spec = data_encoding::Specification::new();
    spec.symbols.push_str("0123456789abcdefghijklmnopqrstuv");
    spec.check_trailing_bits = false;
    spec.encoding().unwrap()
});

/// Errors raised when loading a skylink from a string.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SkylinkError {
    #[error("unexpected skylink length {0}")]
    Length(usize),

    #[error("skylink is not valid base64: {0}")]
    Base64(String),

    #[error("skylink is not valid base32: {0}")]
    Base32(String),

    #[error("skylink has an unrecognized version")]
    Version,

    #[error("skylink bitfield has invalid mode bits")]
    Mode,

    #[error("skylink bitfield has an invalid offset and fetch size combination")]
    OffsetFetchSize,
}

/// A validated skylink.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Skylink([u8; RAW_SIZE]);

impl Skylink {
    /// Loads a skylink from either of its two string encodings and validates
    /// the bitfield.
    pub fn load(s: &str) -> Result<Self, SkylinkError> {
        let raw = match s.len() {
            BASE64_ENCODED_SIZE => BASE64
                .decode(s)
                .map_err(|e| SkylinkError::Base64(e.to_string()))?,
            BASE32_ENCODED_SIZE => BASE32
                .decode(s.to_lowercase().as_bytes())
                .map_err(|e| SkylinkError::Base32(e.to_string()))?,
            n => return Err(SkylinkError::Length(n)),
        };

        let mut bytes = [0u8; RAW_SIZE];
        bytes.copy_from_slice(&raw);

        let bitfield = u16::from_le_bytes([bytes[0], bytes[1]]);
        validate_bitfield(bitfield)?;

        Ok(Skylink(bytes))
    }
}

impl FromStr for Skylink {
    type Err = SkylinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Skylink::load(s)
    }
}

impl fmt::Display for Skylink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&BASE64.encode(self.0))
    }
}

impl fmt::Debug for Skylink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Skylink({})", self)
    }
}

/// Validates the 2-byte bitfield of a raw skylink.
fn validate_bitfield(bitfield: u16) -> Result<(), SkylinkError> {
    match bitfield & 3 {
        0 => parse_v1_bitfield(bitfield).map(|_| ()),
        // a v2 skylink carries no offset or fetch size, every other bit must
        // be zero
        1 if bitfield == 1 => Ok(()),
        1 => Err(SkylinkError::Version),
        _ => Err(SkylinkError::Version),
    }
}

/// Parses a v1 bitfield into its `(offset, fetch size)` pair, verifying the
/// mode bits and the alignment rules on the way.
fn parse_v1_bitfield(mut bitfield: u16) -> Result<(u64, u64), SkylinkError> {
    // shift out the version bits
    bitfield >>= 2;

    // the mode is encoded as a unary run of ones terminated by a zero
    let mut mode = 0u32;
    while bitfield & 1 == 1 {
        mode += 1;
        if mode > 7 {
            return Err(SkylinkError::Mode);
        }
        bitfield >>= 1;
    }
    bitfield >>= 1;

    let (offset_align, fetch_align) = if mode > 0 {
        (4096u64 << (mode + 1), 4096u64 << (mode - 1))
    } else {
        (4096u64, 4096u64)
    };

    // the next three bits select the fetch size within the mode's band
    let mut fetch_size = (u64::from(bitfield & 7) + 1) * fetch_align;
    if mode > 0 {
        fetch_size += fetch_align << 3;
    }
    bitfield >>= 3;

    let offset = u64::from(bitfield) * offset_align;
    if offset + fetch_size > MAX_FETCH_SIZE {
        return Err(SkylinkError::OffsetFetchSize);
    }

    Ok((offset, fetch_size))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_base64_is_identity() {
        let links = [
            "GAEE7l0IkIVcVEHDgRCcNkRYS8keZKr9v_ffxf9_614m6g",
            "CABbGpIwkPL0WDkiHUt5iMlWK-u5RYmdwsKuUY-TGyC9hw",
            "nAA_hbtNaOYyR2WrM9UNIc5jRu4WfGy5QK_iTGosDgLmSA",
            "AAAg4mZrsNcedNPazZ4kSFAYBzf7f8ZgHO1Tu1L-NN8Gjg",
        ];
        for link in links {
            let sl = Skylink::load(link).unwrap();
            assert_eq!(sl.to_string(), link);
        }
    }

    #[test]
    fn test_load_base32_normalizes_to_base64() {
        let cases = [
            (
                "300g9rit1288an2k871o244s6p25giu93pialvdvuvfsbvrvtdf2dqg",
                "GAEE7l0IkIVcVEHDgRCcNkRYS8keZKr9v_ffxf9_614m6g",
            ),
            (
                "1005m6ki628f5t2o74h1qirph34lcavbn52oj7e2oan533sj3cgbr1o",
                "CABbGpIwkPL0WDkiHUt5iMlWK-u5RYmdwsKuUY-TGyC9hw",
            ),
            (
                "7g01n1fmusamd3k4c5l7ahb39356rfhfs92e9mjshj1vq93vk891m2o",
                "PAAbhfb3FWaOhGFqdUVjSMptvi_iROTafIzD_SR_ohIbCw",
            ),
        ];
        for (base32, base64) in cases {
            let sl = Skylink::load(base32).unwrap();
            assert_eq!(sl.to_string(), base64);
        }
    }

    #[test]
    fn test_load_base32_tolerates_trailing_bits() {
        // 55 base32 characters carry three bits more than the raw skylink;
        // re-encoded links found in the wild do not always zero them
        assert!(
            Skylink::load("3005m6ki628f5t2o74h1qirph34lcavbn52oj7e2oan533sj3cgbr2b").is_ok()
        );
    }

    #[test]
    fn test_load_base32_is_case_insensitive() {
        let lower = Skylink::load("1005m6ki628f5t2o74h1qirph34lcavbn52oj7e2oan533sj3cgbr1o");
        let upper = Skylink::load("1005M6KI628F5T2O74H1QIRPH34LCAVBN52OJ7E2OAN533SJ3CGBR1O");
        assert_eq!(lower, upper);
        assert!(lower.is_ok());
    }

    #[test]
    fn test_load_rejects_wrong_length() {
        assert_eq!(Skylink::load(""), Err(SkylinkError::Length(0)));
        assert_eq!(Skylink::load("abc"), Err(SkylinkError::Length(3)));
        assert!(matches!(
            Skylink::load("GAEE7l0IkIVcVEHDgRCcNkRYS8keZKr9v_ffxf9_614m6"),
            Err(SkylinkError::Length(45))
        ));
    }

    #[test]
    fn test_load_rejects_invalid_alphabet() {
        // right length, wrong symbols
        let err = Skylink::load("GAEE7l0IkIVcVEHDgRCcNkRYS8keZKr9v/ffxf9/614m6g").unwrap_err();
        assert!(matches!(err, SkylinkError::Base64(_)));
    }

    #[test]
    fn test_load_rejects_invalid_version() {
        // first two bytes decode to a bitfield with version bits 0b10
        let err = Skylink::load("AgAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA").unwrap_err();
        assert_eq!(err, SkylinkError::Version);
    }

    #[test]
    fn test_v2_bitfield_must_be_bare() {
        assert!(validate_bitfield(1).is_ok());
        assert_eq!(validate_bitfield(1 | (1 << 4)), Err(SkylinkError::Version));
    }

    #[test]
    fn test_v1_bitfield_offset_fetch_cap() {
        // mode 0, two fetch size steps, maximum offset overflows the cap
        let bitfield: u16 = 0b1111_1111_1100_1000;
        assert_eq!(
            parse_v1_bitfield(bitfield),
            Err(SkylinkError::OffsetFetchSize)
        );
    }
}
