//! Virtual path handling.
//!
//! A [`DavPath`] is the slash-separated path of a resource inside the
//! gateway's namespace, after the configured URL prefix has been stripped.
//! It is pure string manipulation; mapping a path to an actual repository
//! node is the job of [`DavRepository::resolve`][crate::repo::DavRepository].

use std::fmt;

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};

use crate::errors::DavError;
use crate::DavResult;

// Characters that must be escaped when a path is turned back into a URL.
const PATH_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}')
    .add(b'%');

/// A normalized webdav path.
///
/// Always starts with `/`. A trailing slash marks a collection; the root
/// path is just `/`.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct DavPath {
    path: String,
    prefix: String,
}

impl fmt::Display for DavPath {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.path)
    }
}

impl fmt::Debug for DavPath {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self.path)
    }
}

impl DavPath {
    /// Parse a raw, possibly percent-encoded path.
    pub fn new(src: &str) -> DavResult<DavPath> {
        DavPath::from_str_and_prefix(src, "")
    }

    /// Parse the path portion of a request URI, stripping `prefix`.
    pub fn from_uri_and_prefix(uri: &http::Uri, prefix: &str) -> DavResult<DavPath> {
        match uri.path() {
            "*" => Ok(DavPath {
                path: "*".to_string(),
                prefix: String::new(),
            }),
            path if path.starts_with('/') => DavPath::from_str_and_prefix(path, prefix),
            _ => Err(DavError::InvalidPath),
        }
    }

    fn from_str_and_prefix(src: &str, prefix: &str) -> DavResult<DavPath> {
        let decoded = percent_decode_str(src)
            .decode_utf8()
            .map_err(|_| DavError::InvalidPath)?;

        let mut rest: &str = &decoded;
        if !prefix.is_empty() {
            let pfx = prefix.trim_end_matches('/');
            rest = decoded.strip_prefix(pfx).ok_or(DavError::InvalidPath)?;
            if !rest.is_empty() && !rest.starts_with('/') {
                return Err(DavError::InvalidPath);
            }
        }

        let is_coll = rest.ends_with('/') || rest.is_empty();
        let mut path = String::with_capacity(rest.len() + 1);
        for seg in rest.split('/').filter(|s| !s.is_empty()) {
            if seg == "." || seg == ".." || seg.contains('\0') {
                return Err(DavError::InvalidPath);
            }
            path.push('/');
            path.push_str(seg);
        }
        if path.is_empty() {
            path.push('/');
        } else if is_coll {
            path.push('/');
        }
        Ok(DavPath {
            path,
            prefix: prefix.trim_end_matches('/').to_string(),
        })
    }

    /// Is this a request for `*` (OPTIONS *)?
    pub fn is_star(&self) -> bool {
        self.path == "*"
    }

    /// The root path?
    pub fn is_root(&self) -> bool {
        self.path == "/"
    }

    /// Does the path denote a collection (trailing slash)?
    pub fn is_collection(&self) -> bool {
        self.path.ends_with('/')
    }

    /// Add a trailing slash if not already present.
    pub fn add_slash(&mut self) {
        if !self.is_collection() {
            self.path.push('/');
        }
    }

    /// The ordered path segments. Empty for the root path.
    pub fn segments(&self) -> Vec<&str> {
        self.path.split('/').filter(|s| !s.is_empty()).collect()
    }

    /// The last non-empty segment, or "" for the root.
    pub fn file_name(&self) -> &str {
        self.segments().last().copied().unwrap_or("")
    }

    /// The parent path (always a collection).
    pub fn parent(&self) -> DavPath {
        let (parent, _) = self.split_last();
        parent
    }

    /// Split into (parent path, last segment name).
    pub fn split_last(&self) -> (DavPath, String) {
        let segs = self.segments();
        let name = segs.last().map(|s| s.to_string()).unwrap_or_default();
        let mut parent = String::new();
        for seg in &segs[..segs.len().saturating_sub(1)] {
            parent.push('/');
            parent.push_str(seg);
        }
        parent.push('/');
        (
            DavPath {
                path: parent,
                prefix: self.prefix.clone(),
            },
            name,
        )
    }

    /// Append a segment. The result is not a collection.
    pub fn push_segment(&mut self, seg: &str) {
        if !self.path.ends_with('/') {
            self.path.push('/');
        }
        self.path.push_str(seg);
    }

    /// The decoded path, without prefix.
    pub fn as_str(&self) -> &str {
        &self.path
    }

    /// The path as a percent-encoded URL string, without prefix.
    pub fn as_url_string(&self) -> String {
        let mut out = String::new();
        for seg in self.segments() {
            out.push('/');
            out.push_str(&utf8_percent_encode(seg, PATH_ENCODE_SET).to_string());
        }
        if out.is_empty() || self.is_collection() {
            out.push('/');
        }
        out
    }

    /// Like `as_url_string`, but with the prefix prepended.
    pub fn with_prefix(&self) -> String {
        format!("{}{}", self.prefix, self.as_url_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_and_normalization() {
        let p = DavPath::new("/").unwrap();
        assert!(p.is_root());
        assert!(p.is_collection());
        assert!(p.segments().is_empty());
        assert_eq!(p.file_name(), "");

        let p = DavPath::new("//a///b/").unwrap();
        assert_eq!(p.as_str(), "/a/b/");
        assert!(p.is_collection());
    }

    #[test]
    fn split_last_works() {
        let p = DavPath::new("/a/b/c.txt").unwrap();
        let (parent, name) = p.split_last();
        assert_eq!(parent.as_str(), "/a/b/");
        assert_eq!(name, "c.txt");

        let (root_parent, name) = DavPath::new("/x").unwrap().split_last();
        assert!(root_parent.is_root());
        assert_eq!(name, "x");
    }

    #[test]
    fn rejects_dot_segments() {
        assert!(DavPath::new("/a/../b").is_err());
        assert!(DavPath::new("/a/./b").is_err());
    }

    #[test]
    fn prefix_stripping() {
        let uri: http::Uri = "/dav/docs/file%20name.txt".parse().unwrap();
        let p = DavPath::from_uri_and_prefix(&uri, "/dav").unwrap();
        assert_eq!(p.as_str(), "/docs/file name.txt");
        assert_eq!(p.with_prefix(), "/dav/docs/file%20name.txt");

        let uri: http::Uri = "/other/x".parse().unwrap();
        assert!(DavPath::from_uri_and_prefix(&uri, "/dav").is_err());
    }

    #[test]
    fn url_roundtrip_encoding() {
        let p = DavPath::new("/a%20b/c").unwrap();
        assert_eq!(p.as_str(), "/a b/c");
        assert_eq!(p.as_url_string(), "/a%20b/c");
    }
}
