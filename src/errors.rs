//! Typed protocol errors.
//!
//! Every failure in the gateway is eventually expressed as a `DavError`
//! which carries the HTTP status code that goes on the wire. Method
//! handlers return `DavResult<T>` and the dispatcher maps the error to a
//! response at a single place.

use std::error::Error;
use std::fmt;
use std::io;

use http::StatusCode;

use crate::locks::LockError;
use crate::repo::RepoError;

pub type DavResult<T> = Result<T, DavError>;

/// WebDAV extension status codes, as literal numerics. `http::StatusCode`
/// knows about these, but we keep named constants so handler code reads
/// like the protocol text.
pub(crate) const SC_MULTI_STATUS: StatusCode = StatusCode::MULTI_STATUS;
pub(crate) const SC_LOCKED: StatusCode = StatusCode::LOCKED;
pub(crate) const SC_FAILED_DEPENDENCY: StatusCode = StatusCode::FAILED_DEPENDENCY;

#[derive(Debug)]
pub enum DavError {
    /// The request body was not well-formed XML.
    XmlReadError,
    /// The request body was well-formed, but invalid for the method.
    XmlParseError,
    /// The request path was not a valid webdav path.
    InvalidPath,
    /// HTTP method not known to this server.
    UnknownDavMethod,
    /// Plain status code error.
    Status(StatusCode),
    /// Status code error, and the connection should be closed.
    StatusClose(StatusCode),
    /// Error from the repository collaborator.
    Repo(RepoError),
    /// Error from the lock manager.
    Lock(LockError),
    /// I/O error while reading or writing a body.
    IoError(io::Error),
    /// XML serializer error.
    XmlWriteError(xml::writer::Error),
}

impl DavError {
    /// The HTTP status code this error maps to.
    pub fn statuscode(&self) -> StatusCode {
        match self {
            DavError::XmlReadError => StatusCode::BAD_REQUEST,
            DavError::XmlParseError => StatusCode::BAD_REQUEST,
            DavError::InvalidPath => StatusCode::BAD_REQUEST,
            DavError::UnknownDavMethod => StatusCode::NOT_IMPLEMENTED,
            DavError::Status(s) => *s,
            DavError::StatusClose(s) => *s,
            DavError::Repo(e) => e.statuscode(),
            DavError::Lock(e) => e.statuscode(),
            DavError::IoError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            DavError::XmlWriteError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the connection must be closed after this error. Set when we
    /// errored out without draining the request body.
    pub fn must_close(&self) -> bool {
        matches!(self, DavError::StatusClose(_))
    }

    /// Recognize a dropped client connection anywhere in the cause chain.
    /// The walk is bounded so a pathological self-referencing chain cannot
    /// loop forever.
    pub fn is_client_abort(&self) -> bool {
        let ioerr = match self {
            DavError::IoError(e) => e,
            _ => return false,
        };
        let mut err: &dyn Error = ioerr;
        for _ in 0..16 {
            if let Some(ioe) = err.downcast_ref::<io::Error>() {
                if matches!(
                    ioe.kind(),
                    io::ErrorKind::ConnectionReset
                        | io::ErrorKind::ConnectionAborted
                        | io::ErrorKind::BrokenPipe
                ) {
                    return true;
                }
                // source() on an io::Error delegates to the wrapped
                // error's own source, skipping the wrapped error itself,
                // so descend through get_ref() instead.
                if let Some(inner) = ioe.get_ref() {
                    err = inner;
                    continue;
                }
            }
            match err.source() {
                Some(s) => err = s,
                None => break,
            }
        }
        false
    }
}

impl fmt::Display for DavError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DavError::XmlReadError => write!(f, "XML read error"),
            DavError::XmlParseError => write!(f, "XML parse error"),
            DavError::InvalidPath => write!(f, "invalid path"),
            DavError::UnknownDavMethod => write!(f, "unknown HTTP method"),
            DavError::Status(s) => write!(f, "{}", s),
            DavError::StatusClose(s) => write!(f, "{}", s),
            DavError::Repo(e) => write!(f, "repository error: {}", e),
            DavError::Lock(e) => write!(f, "lock error: {}", e),
            DavError::IoError(e) => write!(f, "I/O error: {}", e),
            DavError::XmlWriteError(e) => write!(f, "XML write error: {}", e),
        }
    }
}

impl Error for DavError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            DavError::Repo(e) => Some(e),
            DavError::Lock(e) => Some(e),
            DavError::IoError(e) => Some(e),
            DavError::XmlWriteError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StatusCode> for DavError {
    fn from(s: StatusCode) -> Self {
        DavError::Status(s)
    }
}

impl From<RepoError> for DavError {
    fn from(e: RepoError) -> Self {
        DavError::Repo(e)
    }
}

impl From<LockError> for DavError {
    fn from(e: LockError) -> Self {
        DavError::Lock(e)
    }
}

impl From<io::Error> for DavError {
    fn from(e: io::Error) -> Self {
        DavError::IoError(e)
    }
}

impl From<xml::writer::Error> for DavError {
    fn from(e: xml::writer::Error) -> Self {
        match e {
            xml::writer::Error::Io(e) => DavError::IoError(e),
            e => DavError::XmlWriteError(e),
        }
    }
}

impl From<xmltree::ParseError> for DavError {
    fn from(_e: xmltree::ParseError) -> Self {
        DavError::XmlReadError
    }
}
