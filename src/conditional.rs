//! `If` header parsing and conditional request evaluation.
//!
//! The `If` request header (RFC 2518 section 9.4) is a list of OR'd
//! condition groups. Each group is an AND of state-token (lock token) and
//! entity-tag terms, each possibly negated with `Not`. The whole header
//! may be prefixed with a `<...>` resource tag restricting which resource
//! the conditions apply to.
//!
//! Weak entity tags (`W/"..."`) are not implemented; they are parsed as
//! ordinary text and will simply never match a strong ETag.

use std::time::SystemTime;

use headers::HeaderMapExt;
use http::{HeaderMap, StatusCode};

use crate::davheaders::{self, OPAQUE_LOCK_TOKEN};
use crate::errors::DavError;
use crate::DavResult;

/// One AND-group of conditions.
#[derive(Debug, Default, Clone)]
pub struct Condition {
    /// Lock tokens checked for equality against the node's token.
    pub lock_tokens_match: Vec<String>,
    /// Lock tokens checked for inequality.
    pub lock_tokens_not_match: Vec<String>,
    /// ETags checked for equality. `None` means "no etag terms".
    pub etags_match: Option<Vec<String>>,
    /// ETags checked for inequality.
    pub etags_not_match: Option<Vec<String>>,
}

impl Condition {
    fn is_empty(&self) -> bool {
        self.lock_tokens_match.is_empty()
            && self.lock_tokens_not_match.is_empty()
            && self.etags_match.is_none()
            && self.etags_not_match.is_none()
    }

    fn add_lock_token(&mut self, token: &str, not: bool) {
        if not {
            self.lock_tokens_not_match.push(token.to_string());
        } else {
            self.lock_tokens_match.push(token.to_string());
        }
    }

    fn add_etag(&mut self, etag: &str, not: bool) {
        let list = if not {
            self.etags_not_match.get_or_insert_with(Vec::new)
        } else {
            self.etags_match.get_or_insert_with(Vec::new)
        };
        list.push(etag.to_string());
    }

    /// Does this group hold for a node with the given etag and lock token?
    ///
    /// A lock-token match term holds vacuously when the node carries no
    /// lock token at all; this mirrors the fact that an unlocked resource
    /// cannot contradict a token assertion made about some other resource
    /// in a tagged list.
    pub fn matches(&self, node_etag: &str, node_lock_token: Option<&str>) -> bool {
        let mut etag_ok = true;
        let mut token_ok = true;

        if let Some(etags) = &self.etags_match {
            etag_ok = etags.iter().any(|t| t == node_etag);
        }
        if let Some(etags) = &self.etags_not_match {
            etag_ok = !etags.iter().any(|t| t == node_etag);
        }
        if !self.lock_tokens_match.is_empty() {
            token_ok = match node_lock_token {
                None => true,
                Some(t) => self.lock_tokens_match.iter().any(|x| x == t),
            };
        }
        if !self.lock_tokens_not_match.is_empty() {
            token_ok = match node_lock_token {
                None => true,
                Some(t) => !self.lock_tokens_not_match.iter().any(|x| x == t),
            };
        }

        etag_ok && token_ok
    }
}

/// The parsed `If` header.
#[derive(Debug, Default, Clone)]
pub struct IfHeader {
    /// Resource tag from a Tagged-list header, without the `<` `>`.
    pub resource_tag: Option<String>,
    /// OR'd condition groups.
    pub conditions: Vec<Condition>,
}

impl IfHeader {
    /// Parse the header value. Malformed segments fail the whole request
    /// with 412 Precondition Failed; no partial matching is attempted.
    pub fn parse(value: &str) -> DavResult<IfHeader> {
        debug!("parsing If header: {}", value);
        let precondition = || DavError::Status(StatusCode::PRECONDITION_FAILED);

        let mut hdr = IfHeader::default();
        let mut rest = value.trim();

        if rest.starts_with('<') {
            let end = rest.find('>').ok_or_else(precondition)?;
            hdr.resource_tag = Some(rest[1..end].to_string());
            rest = rest[end + 1..].trim_start();
        }

        for part in rest.split(") (") {
            let part = part.replace('(', "").replace(')', "");
            let mut cond = Condition::default();
            let words: Vec<&str> = part.split_whitespace().collect();

            let mut i = 0;
            while i < words.len() {
                let mut not = false;
                let mut word = words[i];
                if word == "Not" {
                    // "Not" must be followed by a state token or etag.
                    if i == words.len() - 1 {
                        return Err(precondition());
                    }
                    not = true;
                    i += 1;
                    word = words[i];
                }

                // state token: <...>
                if let Some(start) = word.find('<') {
                    let end = word.find('>').ok_or_else(precondition)?;
                    if end < start {
                        return Err(precondition());
                    }
                    let token = &word[start + 1..end];
                    if !token.starts_with(OPAQUE_LOCK_TOKEN) {
                        // Unsupported state token. Only acceptable when
                        // negated (it then trivially does not match).
                        if !not {
                            return Err(precondition());
                        }
                    } else {
                        cond.add_lock_token(token, not);
                    }
                }

                // entity tag: ["..."] or [...]
                if let Some(start) = word.find('[') {
                    let end = match word.find(']') {
                        Some(e) => e,
                        None => {
                            warn!("no closing ']': {}", word);
                            word.len()
                        }
                    };
                    if end < start + 1 {
                        return Err(precondition());
                    }
                    cond.add_etag(&word[start + 1..end], not);
                }

                i += 1;
            }

            if !cond.is_empty() {
                hdr.conditions.push(cond);
            }
        }

        Ok(hdr)
    }

    /// Evaluate against a node's current state: true iff at least one
    /// group's terms all hold. An empty header is vacuously true.
    pub fn matches(&self, node_etag: &str, node_lock_token: Option<&str>) -> bool {
        if self.conditions.is_empty() {
            return true;
        }
        self.conditions
            .iter()
            .any(|c| c.matches(node_etag, node_lock_token))
    }

    /// All positively asserted lock tokens, across groups.
    pub fn submitted_tokens(&self) -> Vec<&str> {
        self.conditions
            .iter()
            .flat_map(|c| c.lock_tokens_match.iter().map(|s| s.as_str()))
            .collect()
    }
}

/// Parse the `If` header out of a request header map, if present.
pub fn parse_if_header(headers: &HeaderMap) -> DavResult<Option<IfHeader>> {
    match headers.get("if") {
        None => Ok(None),
        Some(value) => {
            let value = value
                .to_str()
                .map_err(|_| DavError::Status(StatusCode::PRECONDITION_FAILED))?;
            if value.trim().is_empty() {
                return Ok(None);
            }
            IfHeader::parse(value).map(Some)
        }
    }
}

/// Outcome of the plain-HTTP conditional headers on GET/HEAD.
#[derive(Debug, PartialEq, Eq)]
pub enum HttpConditional {
    /// Proceed with the request.
    Pass,
    /// Short-circuit with this status (304 or 412).
    Fail(StatusCode),
}

/// Evaluate If-Match / If-None-Match / If-Modified-Since /
/// If-Unmodified-Since against the node's validators.
///
/// Precedence is fixed: If-Match first (412 on failure), then
/// If-None-Match (304), then If-Modified-Since but only when If-None-Match
/// was absent (the stronger validator wins), then If-Unmodified-Since
/// (412).
pub fn evaluate_http_conditionals(
    headers: &HeaderMap,
    etag: &str,
    modified: SystemTime,
) -> HttpConditional {
    if let Some(davheaders::IfMatch(list)) = headers.typed_get() {
        if !list.matches(etag) {
            return HttpConditional::Fail(StatusCode::PRECONDITION_FAILED);
        }
    }

    let mut none_match_present = false;
    if let Some(davheaders::IfNoneMatch(list)) = headers.typed_get() {
        none_match_present = true;
        if list.matches(etag) {
            return HttpConditional::Fail(StatusCode::NOT_MODIFIED);
        }
    }

    if !none_match_present {
        if let Some(ims) = headers.typed_get::<headers::IfModifiedSince>() {
            if !ims.is_modified(modified) {
                return HttpConditional::Fail(StatusCode::NOT_MODIFIED);
            }
        }
    }

    if let Some(ius) = headers.typed_get::<headers::IfUnmodifiedSince>() {
        if !ius.precondition_passes(modified) {
            return HttpConditional::Fail(StatusCode::PRECONDITION_FAILED);
        }
    }

    HttpConditional::Pass
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn parse_no_tag_list() {
        let hdr = IfHeader::parse("(<opaquelocktoken:node1:alice>)").unwrap();
        assert!(hdr.resource_tag.is_none());
        assert_eq!(hdr.conditions.len(), 1);
        assert_eq!(
            hdr.conditions[0].lock_tokens_match,
            vec!["opaquelocktoken:node1:alice"]
        );
    }

    #[test]
    fn parse_tagged_list_with_groups() {
        let hdr = IfHeader::parse("<urn:x> ([\"abc\"]) (Not <opaquelocktoken:foo>)").unwrap();
        assert_eq!(hdr.resource_tag.as_deref(), Some("urn:x"));
        assert_eq!(hdr.conditions.len(), 2);
        assert_eq!(
            hdr.conditions[0].etags_match.as_deref(),
            Some(&["\"abc\"".to_string()][..])
        );
        assert_eq!(
            hdr.conditions[1].lock_tokens_not_match,
            vec!["opaquelocktoken:foo"]
        );

        // a resource whose etag is "abc" matches the first group
        // regardless of its lock token.
        assert!(hdr.matches("\"abc\"", Some("opaquelocktoken:foo")));
        // a resource with a different lock token matches the second group.
        assert!(hdr.matches("\"xyz\"", Some("opaquelocktoken:bar")));
        // etag mismatch and token "foo": neither group holds.
        assert!(!hdr.matches("\"xyz\"", Some("opaquelocktoken:foo")));
    }

    #[test]
    fn not_and_negated_foreign_token() {
        // A non-opaquelocktoken state token is only allowed when negated.
        assert!(IfHeader::parse("(<urn:other-scheme:x>)").is_err());
        let hdr = IfHeader::parse("(Not <urn:other-scheme:x>)").unwrap();
        // the foreign token is dropped, leaving the group empty and the
        // header vacuously true.
        assert!(hdr.matches("\"e\"", None));
    }

    #[test]
    fn trailing_not_is_precondition_failed() {
        assert!(IfHeader::parse("([\"a\"] Not)").is_err());
    }

    #[test]
    fn truncated_state_token_fails() {
        assert!(IfHeader::parse("(<opaquelocktoken:x)").is_err());
    }

    #[test]
    fn unclosed_etag_is_tolerated() {
        let hdr = IfHeader::parse("([\"abc\")").unwrap();
        assert!(hdr.matches("\"abc\"", None));
    }

    #[test]
    fn and_within_group() {
        let hdr =
            IfHeader::parse("(<opaquelocktoken:n:me> [\"v1\"])").unwrap();
        assert!(hdr.matches("\"v1\"", Some("opaquelocktoken:n:me")));
        assert!(!hdr.matches("\"v2\"", Some("opaquelocktoken:n:me")));
        assert!(!hdr.matches("\"v1\"", Some("opaquelocktoken:n:you")));
    }

    #[test]
    fn unlocked_node_vacuous_token_match() {
        let hdr = IfHeader::parse("(<opaquelocktoken:n:me>)").unwrap();
        assert!(hdr.matches("\"v\"", None));
    }

    #[test]
    fn http_conditional_precedence() {
        use headers::HeaderMapExt;
        let now = SystemTime::now();
        let old = now - Duration::from_secs(3600);

        // If-None-Match present: If-Modified-Since must be ignored.
        let mut map = HeaderMap::new();
        map.insert("if-none-match", "\"other\"".parse().unwrap());
        map.typed_insert(headers::IfModifiedSince::from(now));
        assert_eq!(
            evaluate_http_conditionals(&map, "\"etag\"", old),
            HttpConditional::Pass
        );

        // Without If-None-Match the date header applies.
        let mut map = HeaderMap::new();
        map.typed_insert(headers::IfModifiedSince::from(now));
        assert_eq!(
            evaluate_http_conditionals(&map, "\"etag\"", old),
            HttpConditional::Fail(StatusCode::NOT_MODIFIED)
        );

        // If-Match checked first.
        let mut map = HeaderMap::new();
        map.insert("if-match", "\"nope\"".parse().unwrap());
        map.insert("if-none-match", "\"etag\"".parse().unwrap());
        assert_eq!(
            evaluate_http_conditionals(&map, "\"etag\"", old),
            HttpConditional::Fail(StatusCode::PRECONDITION_FAILED)
        );
    }
}
