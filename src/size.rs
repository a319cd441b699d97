use std::fmt;
use std::str::FromStr;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid size {0:?}")]
pub struct SizeError(pub String);

/// Target box parsed from a `WxH` path segment.
///
/// A zero dimension is syntactically valid; the transform engine decides
/// what it means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub fn parse(token: &str) -> Result<Self, SizeError> {
        let invalid = || SizeError(token.to_string());
        let mut parts = token.split('x');
        let (Some(w), Some(h), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(invalid());
        };
        Ok(Size {
            width: parse_dimension(w).ok_or_else(invalid)?,
            height: parse_dimension(h).ok_or_else(invalid)?,
        })
    }
}

// u32::from_str accepts a leading '+', which is not part of the format
fn parse_dimension(s: &str) -> Option<u32> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

impl FromStr for Size {
    type Err = SizeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Size::parse(s)
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_width_and_height() {
        assert_eq!(Size::parse("100x200"), Ok(Size { width: 100, height: 200 }));
        assert_eq!(Size::parse("0x0"), Ok(Size { width: 0, height: 0 }));
        assert_eq!("300x0".parse::<Size>().unwrap().to_string(), "300x0");
    }

    #[test]
    fn rejects_malformed_tokens() {
        for bad in ["100", "ax200", "100x", "x100", "1x2x3", "", "+1x2", "-1x2", "1 x2", "100X200"] {
            assert!(Size::parse(bad).is_err(), "{bad:?} should not parse");
        }
    }

    #[test]
    fn rejects_overflow() {
        assert!(Size::parse("4294967296x1").is_err());
        assert!(Size::parse("4294967295x1").is_ok());
    }
}
