//! Block parameter parsing shared by the cache handlers and the last-value cache.

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid hex quantity: {0}")]
    InvalidHex(String),
    #[error("block parameter must be a string")]
    NotAString,
}

/// Standard Ethereum block tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTag {
    Latest,
    Pending,
    Earliest,
    Safe,
    Finalized,
}

impl BlockTag {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Latest => "latest",
            Self::Pending => "pending",
            Self::Earliest => "earliest",
            Self::Safe => "safe",
            Self::Finalized => "finalized",
        }
    }
}

/// A block reference as it appears in request params.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockRef {
    Number(u64),
    Tag(BlockTag),
}

impl BlockRef {
    /// True for tags whose block changes as the chain advances. `earliest` is fixed.
    #[must_use]
    pub fn is_moving(&self) -> bool {
        matches!(
            self,
            Self::Tag(BlockTag::Latest | BlockTag::Pending | BlockTag::Safe | BlockTag::Finalized)
        )
    }

    /// Canonical spelling used in cache keys: tags verbatim, numbers as minimal hex.
    #[must_use]
    pub fn canonical(&self) -> String {
        match self {
            Self::Number(n) => format!("{n:#x}"),
            Self::Tag(tag) => tag.as_str().to_string(),
        }
    }
}

impl TryFrom<&str> for BlockRef {
    type Error = ParseError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        BlockParameter::parse(value)
    }
}

pub struct BlockParameter;

impl BlockParameter {
    /// Parses a block tag or a `0x`-prefixed hex quantity.
    ///
    /// ```
    /// use proxyd_core::utils::block_param::{BlockParameter, BlockRef, BlockTag};
    ///
    /// assert_eq!(BlockParameter::parse("pending").unwrap(), BlockRef::Tag(BlockTag::Pending));
    /// assert_eq!(BlockParameter::parse("0x10").unwrap(), BlockRef::Number(16));
    /// assert!(BlockParameter::parse("100").is_err());
    /// ```
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::InvalidHex`] if the input is neither a tag nor a hex quantity.
    pub fn parse(param: &str) -> Result<BlockRef, ParseError> {
        match param {
            "latest" => Ok(BlockRef::Tag(BlockTag::Latest)),
            "pending" => Ok(BlockRef::Tag(BlockTag::Pending)),
            "earliest" => Ok(BlockRef::Tag(BlockTag::Earliest)),
            "safe" => Ok(BlockRef::Tag(BlockTag::Safe)),
            "finalized" => Ok(BlockRef::Tag(BlockTag::Finalized)),
            s => Self::parse_hex(s)
                .map(BlockRef::Number)
                .ok_or_else(|| ParseError::InvalidHex(s.to_string())),
        }
    }

    /// # Errors
    ///
    /// Returns [`ParseError::NotAString`] for non-string values, otherwise see
    /// [`BlockParameter::parse`].
    pub fn from_json_value(value: &Value) -> Result<BlockRef, ParseError> {
        value.as_str().ok_or(ParseError::NotAString).and_then(Self::parse)
    }

    /// Parses a `0x`-prefixed hex quantity. Only ASCII hex digits may follow the prefix.
    ///
    /// ```
    /// use proxyd_core::utils::block_param::BlockParameter;
    ///
    /// assert_eq!(BlockParameter::parse_hex("0xff"), Some(255));
    /// assert_eq!(BlockParameter::parse_hex("ff"), None);
    /// assert_eq!(BlockParameter::parse_hex("0x+ff"), None);
    /// ```
    #[must_use]
    pub fn parse_hex(s: &str) -> Option<u64> {
        let digits = s.strip_prefix("0x")?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        u64::from_str_radix(digits, 16).ok()
    }
}
