use std::{fmt, str::FromStr};

/// Content codings this proxy knows by name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ContentEncoding {
    #[default]
    Identity,
    Deflate,
    Gzip,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    #[error("unknown content encoding code {0}")]
    UnknownCode(u8),
    #[error("unknown content encoding {0}")]
    UnknownName(String),
}

const ALL: [ContentEncoding; 3] = [
    ContentEncoding::Identity,
    ContentEncoding::Deflate,
    ContentEncoding::Gzip,
];

impl ContentEncoding {
    pub fn code(self) -> u8 {
        match self {
            ContentEncoding::Identity => 0,
            ContentEncoding::Deflate => 1,
            ContentEncoding::Gzip => 2,
        }
    }

    /// canonical name
    pub fn name(self) -> &'static str {
        self.names()[0]
    }

    /// canonical name, then aliases
    pub fn names(self) -> &'static [&'static str] {
        match self {
            ContentEncoding::Identity => &["identity"],
            ContentEncoding::Deflate => &["deflate"],
            ContentEncoding::Gzip => &["gzip", "x-gzip"],
        }
    }

    pub fn from_code(code: u8) -> Result<Self, EncodingError> {
        ALL.into_iter()
            .find(|encoding| encoding.code() == code)
            .ok_or(EncodingError::UnknownCode(code))
    }

    pub fn from_name(name: &str) -> Result<Self, EncodingError> {
        let name = name.trim();
        ALL.into_iter()
            .find(|encoding| {
                encoding
                    .names()
                    .iter()
                    .any(|known| known.eq_ignore_ascii_case(name))
            })
            .ok_or_else(|| EncodingError::UnknownName(name.to_owned()))
    }

    /// every name that may be advertised in `Accept-Encoding`
    pub fn supported_names() -> Vec<&'static str> {
        ALL.iter()
            .flat_map(|encoding| encoding.names().iter().copied())
            .collect()
    }
}

impl FromStr for ContentEncoding {
    type Err = EncodingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ContentEncoding::from_name(s)
    }
}

impl fmt::Display for ContentEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookups() {
        assert_eq!(ContentEncoding::from_name("GZIP"), Ok(ContentEncoding::Gzip));
        assert_eq!(
            "x-gzip".parse::<ContentEncoding>(),
            Ok(ContentEncoding::Gzip)
        );
        assert_eq!(ContentEncoding::from_code(1), Ok(ContentEncoding::Deflate));
        assert_eq!(ContentEncoding::Gzip.code(), 2);
        assert_eq!(ContentEncoding::Gzip.to_string(), "gzip");
        assert_eq!(
            ContentEncoding::supported_names(),
            vec!["identity", "deflate", "gzip", "x-gzip"]
        );
    }

    #[test]
    fn unknown_values_are_errors() {
        assert_eq!(
            ContentEncoding::from_name("br"),
            Err(EncodingError::UnknownName("br".to_owned()))
        );
        assert_eq!(
            ContentEncoding::from_code(7),
            Err(EncodingError::UnknownCode(7))
        );
    }
}
