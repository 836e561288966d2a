//! Typed versions of the webdav request/response headers.
//!
//! These plug into the `headers` crate's `Header` trait so handlers can
//! use `typed_get`/`typed_insert` on the header map.

use std::convert::TryFrom;
use std::time::Duration;

use headers::{self, Header, HeaderName, HeaderValue};

lazy_static! {
    static ref DEPTH: HeaderName = HeaderName::from_static("depth");
    static ref TIMEOUT: HeaderName = HeaderName::from_static("timeout");
    static ref DESTINATION: HeaderName = HeaderName::from_static("destination");
    static ref OVERWRITE: HeaderName = HeaderName::from_static("overwrite");
    static ref LOCKTOKEN: HeaderName = HeaderName::from_static("lock-token");
    static ref IF: HeaderName = HeaderName::from_static("if");
    static ref IF_MATCH: HeaderName = HeaderName::from_static("if-match");
    static ref IF_NONE_MATCH: HeaderName = HeaderName::from_static("if-none-match");
    static ref CONTENT_LOCATION: HeaderName = HeaderName::from_static("content-location");
    static ref X_LITMUS: HeaderName = HeaderName::from_static("x-litmus");
}

/// The prefix every lock token URI carries.
pub const OPAQUE_LOCK_TOKEN: &str = "opaquelocktoken:";

/// Depth: 0, 1, infinity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Depth {
    Zero,
    One,
    Infinity,
}

impl Header for Depth {
    fn name() -> &'static HeaderName {
        &DEPTH
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        let value = values.next().ok_or_else(headers::Error::invalid)?;
        match value.as_bytes() {
            b"0" => Ok(Depth::Zero),
            b"1" => Ok(Depth::One),
            b"infinity" | b"Infinity" => Ok(Depth::Infinity),
            _ => Err(headers::Error::invalid()),
        }
    }

    fn encode<E: Extend<HeaderValue>>(&self, values: &mut E) {
        let value = match self {
            Depth::Zero => "0",
            Depth::One => "1",
            Depth::Infinity => "infinity",
        };
        values.extend(std::iter::once(HeaderValue::from_static(value)));
    }
}

/// One element of the `Timeout:` request header list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DavTimeout {
    Infinite,
    Seconds(u64),
}

impl DavTimeout {
    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            DavTimeout::Infinite => None,
            DavTimeout::Seconds(s) => Some(Duration::from_secs(*s)),
        }
    }
}

/// `Timeout: Second-3600, Infinite`. The list is in order of preference.
/// Values we do not understand are skipped; an empty result falls back to
/// the server default at the caller.
#[derive(Debug, Clone)]
pub struct Timeout(pub Vec<DavTimeout>);

impl Header for Timeout {
    fn name() -> &'static HeaderName {
        &TIMEOUT
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        let value = values.next().ok_or_else(headers::Error::invalid)?;
        let value = value.to_str().map_err(|_| headers::Error::invalid())?;
        let mut v = Vec::new();
        for word in value.split(',').map(|s| s.trim()) {
            if word.eq_ignore_ascii_case("infinite") {
                v.push(DavTimeout::Infinite);
            } else if let Some(secs) = word.strip_prefix("Second-") {
                // "Second-n" or the legacy "Second-n n seconds" form;
                // the first numeric run wins.
                let digits: String = secs.chars().take_while(|c| c.is_ascii_digit()).collect();
                if let Ok(n) = digits.parse::<u64>() {
                    v.push(DavTimeout::Seconds(n));
                }
            }
        }
        Ok(Timeout(v))
    }

    fn encode<E: Extend<HeaderValue>>(&self, values: &mut E) {
        let s = self
            .0
            .iter()
            .map(|t| match t {
                DavTimeout::Infinite => "Infinite".to_string(),
                DavTimeout::Seconds(n) => format!("Second-{}", n),
            })
            .collect::<Vec<_>>()
            .join(", ");
        if let Ok(value) = HeaderValue::try_from(s) {
            values.extend(std::iter::once(value));
        }
    }
}

/// `Destination:` header, raw value. Resolution against the server prefix
/// happens in the COPY/MOVE handler.
#[derive(Debug, Clone)]
pub struct Destination(pub String);

impl Header for Destination {
    fn name() -> &'static HeaderName {
        &DESTINATION
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        let value = values.next().ok_or_else(headers::Error::invalid)?;
        let value = value.to_str().map_err(|_| headers::Error::invalid())?;
        Ok(Destination(value.to_string()))
    }

    fn encode<E: Extend<HeaderValue>>(&self, values: &mut E) {
        if let Ok(value) = HeaderValue::try_from(self.0.clone()) {
            values.extend(std::iter::once(value));
        }
    }
}

/// `Overwrite: T|F`. Absent means `T`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Overwrite(pub bool);

impl Header for Overwrite {
    fn name() -> &'static HeaderName {
        &OVERWRITE
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        let value = values.next().ok_or_else(headers::Error::invalid)?;
        match value.as_bytes() {
            b"T" => Ok(Overwrite(true)),
            b"F" => Ok(Overwrite(false)),
            _ => Err(headers::Error::invalid()),
        }
    }

    fn encode<E: Extend<HeaderValue>>(&self, values: &mut E) {
        let value = if self.0 { "T" } else { "F" };
        values.extend(std::iter::once(HeaderValue::from_static(value)));
    }
}

/// `Lock-Token:` header.
///
/// The value should be `<opaquelocktoken:...>`, but several clients send
/// the token without the angle brackets, so we tolerate that and re-wrap.
#[derive(Debug, Clone)]
pub struct LockToken(pub String);

impl LockToken {
    /// The token URI without the surrounding `<` `>`.
    pub fn opaque(&self) -> &str {
        self.0
            .trim_start_matches('<')
            .trim_end_matches('>')
            .trim()
    }
}

impl Header for LockToken {
    fn name() -> &'static HeaderName {
        &LOCKTOKEN
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        let value = values.next().ok_or_else(headers::Error::invalid)?;
        let value = value.to_str().map_err(|_| headers::Error::invalid())?;
        Ok(LockToken(value.trim().to_string()))
    }

    fn encode<E: Extend<HeaderValue>>(&self, values: &mut E) {
        let s = if self.0.starts_with('<') {
            self.0.clone()
        } else {
            format!("<{}>", self.0)
        };
        if let Ok(value) = HeaderValue::try_from(s) {
            values.extend(std::iter::once(value));
        }
    }
}

/// An entity-tag list from `If-Match` / `If-None-Match`.
#[derive(Debug, Clone)]
pub enum ETagList {
    Star,
    Tags(Vec<String>),
}

impl ETagList {
    /// Whether `etag` (a quoted strong validator) is covered by this list.
    pub fn matches(&self, etag: &str) -> bool {
        match self {
            ETagList::Star => true,
            ETagList::Tags(tags) => tags.iter().any(|t| t == etag),
        }
    }

    fn decode_value(value: &str) -> ETagList {
        if value.trim() == "*" {
            return ETagList::Star;
        }
        // split on commas outside quoted strings.
        let mut tags = Vec::new();
        let mut cur = String::new();
        let mut quoted = false;
        for c in value.chars() {
            match c {
                '"' => {
                    quoted = !quoted;
                    cur.push(c);
                }
                ',' if !quoted => {
                    let t = cur.trim();
                    if !t.is_empty() {
                        tags.push(t.to_string());
                    }
                    cur.clear();
                }
                _ => cur.push(c),
            }
        }
        let t = cur.trim();
        if !t.is_empty() {
            tags.push(t.to_string());
        }
        ETagList::Tags(tags)
    }
}

macro_rules! etag_header {
    ($name:ident, $static:ident) => {
        #[derive(Debug, Clone)]
        pub struct $name(pub ETagList);

        impl Header for $name {
            fn name() -> &'static HeaderName {
                &$static
            }

            fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
            where
                I: Iterator<Item = &'i HeaderValue>,
            {
                let value = values.next().ok_or_else(headers::Error::invalid)?;
                let value = value.to_str().map_err(|_| headers::Error::invalid())?;
                Ok($name(ETagList::decode_value(value)))
            }

            fn encode<E: Extend<HeaderValue>>(&self, values: &mut E) {
                let s = match &self.0 {
                    ETagList::Star => "*".to_string(),
                    ETagList::Tags(t) => t.join(", "),
                };
                if let Ok(value) = HeaderValue::try_from(s) {
                    values.extend(std::iter::once(value));
                }
            }
        }
    };
}

etag_header!(IfMatch, IF_MATCH);
etag_header!(IfNoneMatch, IF_NONE_MATCH);

/// `Content-Location` response header.
#[derive(Debug, Clone)]
pub struct ContentLocation(pub String);

impl Header for ContentLocation {
    fn name() -> &'static HeaderName {
        &CONTENT_LOCATION
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        let value = values.next().ok_or_else(headers::Error::invalid)?;
        let value = value.to_str().map_err(|_| headers::Error::invalid())?;
        Ok(ContentLocation(value.to_string()))
    }

    fn encode<E: Extend<HeaderValue>>(&self, values: &mut E) {
        if let Ok(value) = HeaderValue::try_from(self.0.clone()) {
            values.extend(std::iter::once(value));
        }
    }
}

/// `X-Litmus` test-identification header; logged for debugging runs of the
/// litmus compliance suite.
#[derive(Debug, Clone)]
pub struct XLitmus(pub String);

impl Header for XLitmus {
    fn name() -> &'static HeaderName {
        &X_LITMUS
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        let value = values.next().ok_or_else(headers::Error::invalid)?;
        let value = value.to_str().map_err(|_| headers::Error::invalid())?;
        Ok(XLitmus(value.to_string()))
    }

    fn encode<E: Extend<HeaderValue>>(&self, values: &mut E) {
        if let Ok(value) = HeaderValue::try_from(self.0.clone()) {
            values.extend(std::iter::once(value));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use headers::HeaderMapExt;
    use http::HeaderMap;

    fn map_with(name: &'static str, value: &str) -> HeaderMap {
        let mut map = HeaderMap::new();
        map.insert(name, HeaderValue::try_from(value).unwrap());
        map
    }

    #[test]
    fn timeout_parsing() {
        let map = map_with("timeout", "Second-3600, Infinite");
        let t: Timeout = map.typed_get().unwrap();
        assert_eq!(t.0, vec![DavTimeout::Seconds(3600), DavTimeout::Infinite]);

        // legacy "Second-n n seconds" form
        let map = map_with("timeout", "Second-120 120 seconds");
        let t: Timeout = map.typed_get().unwrap();
        assert_eq!(t.0, vec![DavTimeout::Seconds(120)]);

        // garbage yields an empty list, default applied by caller
        let map = map_with("timeout", "whenever");
        let t: Timeout = map.typed_get().unwrap();
        assert!(t.0.is_empty());
    }

    #[test]
    fn locktoken_tolerates_missing_brackets() {
        let t = LockToken("<opaquelocktoken:abc:me>".to_string());
        assert_eq!(t.opaque(), "opaquelocktoken:abc:me");
        let t = LockToken("opaquelocktoken:abc:me".to_string());
        assert_eq!(t.opaque(), "opaquelocktoken:abc:me");
    }

    #[test]
    fn etag_list_matching() {
        let map = map_with("if-match", "\"a\", \"b,c\"");
        let m: IfMatch = map.typed_get().unwrap();
        assert!(m.0.matches("\"a\""));
        assert!(m.0.matches("\"b,c\""));
        assert!(!m.0.matches("\"d\""));

        let map = map_with("if-none-match", "*");
        let m: IfNoneMatch = map.typed_get().unwrap();
        assert!(m.0.matches("\"anything\""));
    }

    #[test]
    fn overwrite_default_is_separate() {
        let map = map_with("overwrite", "F");
        let o: Overwrite = map.typed_get().unwrap();
        assert!(!o.0);
        let empty = HeaderMap::new();
        assert!(empty.typed_get::<Overwrite>().is_none());
    }
}
