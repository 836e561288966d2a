use std::io::{Cursor, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use bitflags::bitflags;
use bytes::Bytes;
use headers::Header;
use http::method::InvalidMethod;
use time::format_description::well_known::Rfc3339;
use time::macros::offset;

use crate::body::Body;
use crate::errors::DavError;
use crate::DavResult;

/// HTTP/WebDAV methods understood by the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DavMethod {
    Head,
    Get,
    Put,
    Post,
    Options,
    PropFind,
    PropPatch,
    MkCol,
    Copy,
    Move,
    Delete,
    Lock,
    Unlock,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    struct MethodFlags: u32 {
        const HEAD = 0x0001;
        const GET = 0x0002;
        const PUT = 0x0004;
        const POST = 0x0008;
        const OPTIONS = 0x0010;
        const PROPFIND = 0x0020;
        const PROPPATCH = 0x0040;
        const MKCOL = 0x0080;
        const COPY = 0x0100;
        const MOVE = 0x0200;
        const DELETE = 0x0400;
        const LOCK = 0x0800;
        const UNLOCK = 0x1000;

        const HTTP_RO = Self::HEAD.bits() | Self::GET.bits() | Self::OPTIONS.bits();
        const HTTP_RW = Self::HTTP_RO.bits() | Self::PUT.bits() | Self::POST.bits();
        const WEBDAV_RO = Self::HTTP_RO.bits() | Self::PROPFIND.bits();
    }
}

impl DavMethod {
    fn flag(self) -> MethodFlags {
        match self {
            DavMethod::Head => MethodFlags::HEAD,
            DavMethod::Get => MethodFlags::GET,
            DavMethod::Put => MethodFlags::PUT,
            DavMethod::Post => MethodFlags::POST,
            DavMethod::Options => MethodFlags::OPTIONS,
            DavMethod::PropFind => MethodFlags::PROPFIND,
            DavMethod::PropPatch => MethodFlags::PROPPATCH,
            DavMethod::MkCol => MethodFlags::MKCOL,
            DavMethod::Copy => MethodFlags::COPY,
            DavMethod::Move => MethodFlags::MOVE,
            DavMethod::Delete => MethodFlags::DELETE,
            DavMethod::Lock => MethodFlags::LOCK,
            DavMethod::Unlock => MethodFlags::UNLOCK,
        }
    }
}

/// A set of allowed methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DavMethodSet(MethodFlags);

impl DavMethodSet {
    /// All methods.
    pub fn all() -> DavMethodSet {
        DavMethodSet(MethodFlags::all())
    }

    /// No methods.
    pub fn none() -> DavMethodSet {
        DavMethodSet(MethodFlags::empty())
    }

    /// GET, HEAD, OPTIONS.
    pub fn http_ro() -> DavMethodSet {
        DavMethodSet(MethodFlags::HTTP_RO)
    }

    /// GET, HEAD, OPTIONS, PUT, POST.
    pub fn http_rw() -> DavMethodSet {
        DavMethodSet(MethodFlags::HTTP_RW)
    }

    /// GET, HEAD, OPTIONS, PROPFIND.
    pub fn webdav_ro() -> DavMethodSet {
        DavMethodSet(MethodFlags::WEBDAV_RO)
    }

    pub fn add(&mut self, m: DavMethod) -> &mut Self {
        self.0.insert(m.flag());
        self
    }

    pub fn remove(&mut self, m: DavMethod) -> &mut Self {
        self.0.remove(m.flag());
        self
    }

    pub fn contains(&self, m: DavMethod) -> bool {
        self.0.contains(m.flag())
    }
}

// translate method into our own enum that has webdav methods as well.
pub fn dav_method(m: &http::Method) -> DavResult<DavMethod> {
    let m = match *m {
        http::Method::HEAD => DavMethod::Head,
        http::Method::GET => DavMethod::Get,
        http::Method::PUT => DavMethod::Put,
        http::Method::POST => DavMethod::Post,
        http::Method::DELETE => DavMethod::Delete,
        http::Method::OPTIONS => DavMethod::Options,
        _ => match m.as_str() {
            "PROPFIND" => DavMethod::PropFind,
            "PROPPATCH" => DavMethod::PropPatch,
            "MKCOL" => DavMethod::MkCol,
            "COPY" => DavMethod::Copy,
            "MOVE" => DavMethod::Move,
            "LOCK" => DavMethod::Lock,
            "UNLOCK" => DavMethod::Unlock,
            _ => {
                return Err(DavError::UnknownDavMethod);
            }
        },
    };
    Ok(m)
}

// for external use.
impl std::convert::TryFrom<&http::Method> for DavMethod {
    type Error = InvalidMethod;

    fn try_from(value: &http::Method) -> Result<Self, Self::Error> {
        dav_method(value).map_err(|_| {
            // A trick to get at the value of http::method::InvalidMethod.
            http::method::Method::from_bytes(b"").unwrap_err()
        })
    }
}

pub fn dav_xml_error(body: &str) -> Body {
    let xml = format!(
        "<?xml version=\"1.0\" encoding=\"utf-8\" ?>\n\
        <D:error xmlns:D=\"DAV:\">\n\
        {body}\n\
        </D:error>\n"
    );
    Body::from(xml)
}

pub fn systemtime_to_offsetdatetime(t: SystemTime) -> time::OffsetDateTime {
    match t.duration_since(UNIX_EPOCH) {
        Ok(t) => {
            let tm = time::OffsetDateTime::from_unix_timestamp(t.as_secs() as i64).unwrap();
            tm.to_offset(offset!(UTC))
        }
        Err(_) => time::OffsetDateTime::UNIX_EPOCH.to_offset(offset!(UTC)),
    }
}

/// RFC1123 GMT date, as used in `Last-Modified` and lock expiry output.
pub fn systemtime_to_httpdate(t: SystemTime) -> String {
    let d = headers::Date::from(t);
    let mut v = Vec::new();
    d.encode(&mut v);
    v[0].to_str().unwrap().to_owned()
}

pub fn systemtime_to_rfc3339(t: SystemTime) -> String {
    // 1996-12-19T16:39:57Z
    systemtime_to_offsetdatetime(t).format(&Rfc3339).unwrap()
}

/// Milliseconds since the epoch. Used in ETags and the serialized lock record.
pub fn systemtime_to_millis(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// A buffer that implements "Write".
#[derive(Clone)]
pub struct MemBuffer(Cursor<Vec<u8>>);

impl MemBuffer {
    pub fn new() -> MemBuffer {
        MemBuffer(Cursor::new(Vec::new()))
    }

    pub fn take(&mut self) -> Bytes {
        let buf = std::mem::take(self.0.get_mut());
        self.0.set_position(0);
        Bytes::from(buf)
    }
}

impl Write for MemBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::UNIX_EPOCH;

    #[test]
    fn test_rfc3339() {
        assert!(systemtime_to_rfc3339(UNIX_EPOCH) == "1970-01-01T00:00:00Z");
    }

    #[test]
    fn test_httpdate() {
        assert_eq!(
            systemtime_to_httpdate(UNIX_EPOCH),
            "Thu, 01 Jan 1970 00:00:00 GMT"
        );
    }

    #[test]
    fn method_sets() {
        let mut set = DavMethodSet::webdav_ro();
        assert!(set.contains(DavMethod::PropFind));
        assert!(!set.contains(DavMethod::Put));
        set.add(DavMethod::Put);
        assert!(set.contains(DavMethod::Put));
        assert!(dav_method(&http::Method::POST).unwrap() == DavMethod::Post);
        assert!(dav_method(&http::Method::PATCH).is_err());
    }
}
