use headers::HeaderMapExt;
use http::{Request, Response, StatusCode};

use crate::body::Body;
use crate::conditional::{evaluate_http_conditionals, HttpConditional};
use crate::util::systemtime_to_httpdate;
use crate::DavResult;

// Chunk size for streaming content out.
pub(crate) const READ_BUF_SIZE: usize = 16384;

// A single "bytes=start-end" range. Multipart ranges not supported.
#[derive(Debug, PartialEq, Eq)]
enum ByteRange {
    FromTo(u64, u64),
    From(u64),
    Last(u64),
}

fn parse_range(value: &str) -> Option<ByteRange> {
    let spec = value.strip_prefix("bytes=")?.trim();
    if spec.contains(',') {
        return None;
    }
    let (start, end) = spec.split_once('-')?;
    match (start.trim(), end.trim()) {
        ("", last) => last.parse().ok().map(ByteRange::Last),
        (start, "") => start.parse().ok().map(ByteRange::From),
        (start, end) => {
            let s: u64 = start.parse().ok()?;
            let e: u64 = end.parse().ok()?;
            if s > e {
                return None;
            }
            Some(ByteRange::FromTo(s, e))
        }
    }
}

impl crate::DavHandler {
    pub(crate) async fn handle_get(&self, req: &Request<()>) -> DavResult<Response<Body>> {
        let path = self.path(req);
        let head = req.method() == http::Method::HEAD;

        let node = self.repo.resolve(&path).await?;

        if node.is_dir {
            // Directory listings are not rendered; clients are expected
            // to PROPFIND instead.
            let mut res = Response::new(Body::empty());
            *res.status_mut() = StatusCode::METHOD_NOT_ALLOWED;
            res.headers_mut().insert(
                "allow",
                "OPTIONS,PROPFIND,PROPPATCH,COPY,MOVE,DELETE,LOCK,UNLOCK"
                    .parse()
                    .unwrap(),
            );
            return Ok(res);
        }

        let etag = node.etag();
        let len = node.len;

        let mut res = Response::new(Body::empty());
        res.headers_mut().insert("etag", etag.parse().unwrap());
        res.headers_mut().insert(
            "last-modified",
            systemtime_to_httpdate(node.modified).parse().unwrap(),
        );
        res.headers_mut()
            .insert("accept-ranges", "bytes".parse().unwrap());

        match evaluate_http_conditionals(req.headers(), &etag, node.modified) {
            HttpConditional::Pass => {}
            HttpConditional::Fail(status) => {
                *res.status_mut() = status;
                return Ok(res);
            }
        }

        let ctype = mime_guess::from_path(path.file_name())
            .first_or_octet_stream()
            .to_string();
        res.headers_mut()
            .insert("content-type", ctype.parse().unwrap());

        // Single-range support; an unsatisfiable range is a 416, a
        // syntactically broken one is ignored per RFC 7233.
        let mut span = (0, len);
        if let Some(value) = req.headers().get("range").and_then(|v| v.to_str().ok()) {
            if let Some(range) = parse_range(value) {
                let resolved = match range {
                    ByteRange::FromTo(s, e) if s < len => Some((s, e.saturating_add(1).min(len))),
                    ByteRange::From(s) if s < len => Some((s, len)),
                    ByteRange::Last(n) => Some((len.saturating_sub(n), len)),
                    _ => None,
                };
                // A span that selects no bytes (suffix range on an empty
                // file, "bytes=-0") is unsatisfiable as well.
                let resolved = resolved.filter(|(s, e)| s < e);
                match resolved {
                    Some(r) => {
                        span = r;
                        *res.status_mut() = StatusCode::PARTIAL_CONTENT;
                        res.headers_mut().insert(
                            "content-range",
                            format!("bytes {}-{}/{}", span.0, span.1 - 1, len)
                                .parse()
                                .unwrap(),
                        );
                    }
                    None => {
                        *res.status_mut() = StatusCode::RANGE_NOT_SATISFIABLE;
                        res.headers_mut().insert(
                            "content-range",
                            format!("bytes */{}", len).parse().unwrap(),
                        );
                        return Ok(res);
                    }
                }
            }
        }

        res.headers_mut()
            .typed_insert(headers::ContentLength(span.1 - span.0));

        if head {
            return Ok(res);
        }

        let range = if span == (0, len) { None } else { Some(span) };
        let content = self.repo.read_content(&node.id, range).await?;

        // Stream the content out in read_buf_size chunks.
        let bufsize = self.read_buf_size.max(1);
        *res.body_mut() = Body::stream(async_stream::try_stream! {
            let mut off = 0usize;
            while off < content.len() {
                let end = (off + bufsize).min(content.len());
                yield content.slice(off..end);
                off = end;
            }
        });

        Ok(res)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_parsing() {
        assert_eq!(parse_range("bytes=0-99"), Some(ByteRange::FromTo(0, 99)));
        assert_eq!(parse_range("bytes=100-"), Some(ByteRange::From(100)));
        assert_eq!(parse_range("bytes=-50"), Some(ByteRange::Last(50)));
        assert_eq!(parse_range("bytes=5-2"), None);
        assert_eq!(parse_range("bytes=0-1,5-9"), None);
        assert_eq!(parse_range("lines=1-2"), None);
    }
}
