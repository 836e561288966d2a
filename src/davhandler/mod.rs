//
// This module contains the main entry point of the library,
// DavHandler.
//
use std::error::Error as StdError;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{buf::Buf, Bytes};
use futures_util::stream::Stream;
use headers::HeaderMapExt;
use http::header::HeaderMap;
use http::{Request, Response, StatusCode};
use http_body::Body as HttpBody;
use pin_project::pin_project;
use regex::Regex;

use crate::body::Body;
use crate::conditional::{parse_if_header, IfHeader};
use crate::davheaders;
use crate::davpath::DavPath;
use crate::locks::{
    make_lock_token, LockLookup, LockManager, LockRecord, LockStore, MemLockStore, Scheduler,
    SessionId, TokioScheduler,
};
use crate::repo::{DavRepository, NodeHandle, NodeId, RepoError};
use crate::util::{dav_method, dav_xml_error, DavMethod, DavMethodSet};

use crate::errors::{DavError, SC_LOCKED};
use crate::DavResult;

pub mod handle_copymove;
pub mod handle_delete;
pub mod handle_gethead;
use handle_copymove::ShufflePatterns;
use handle_gethead::READ_BUF_SIZE;
pub mod handle_lock;
pub mod handle_mkcol;
pub mod handle_options;
pub mod handle_props;
pub mod handle_put;

// Retries for handlers that hit an optimistic-concurrency conflict in
// the repository. The request body is fully buffered before dispatch,
// so re-running a handler is safe.
const ENVELOPE_RETRIES: u32 = 3;

// Upper bound on buffered XML request bodies.
const MAX_XML_BODY: usize = 65536;

lazy_static! {
    // Older Mac clients mishandle 403 on access-denied (the Finder
    // deletes its local copy of the file); they get a 500 instead.
    // Ordered, first match wins, catch-all maps everyone else to 403.
    static ref ACCESS_DENIED_STATUS: Vec<(Regex, StatusCode)> = vec![
        (
            Regex::new(r"^WebDAVLib/\d+\.\d+$").unwrap(),
            StatusCode::INTERNAL_SERVER_ERROR,
        ),
        (
            Regex::new(r"^WebDAVFS/\d+\.\d+(\.\d+)?\s+\(\d+\)\s+Darwin/.*").unwrap(),
            StatusCode::INTERNAL_SERVER_ERROR,
        ),
        (Regex::new(r".*").unwrap(), StatusCode::FORBIDDEN),
    ];
}

/// Configuration of the handler.
#[derive(Clone)]
pub struct DavBuilder {
    /// Prefix to be stripped off when handling request.
    prefix: String,
    /// Repository backend.
    repo: Arc<dyn DavRepository>,
    /// Lock record storage. Defaults to an in-memory store.
    store: Option<Arc<dyn LockStore>>,
    /// Timer backend for the deferred lock-cleanup tasks.
    scheduler: Option<Arc<dyn Scheduler>>,
    /// Set of allowed methods (Defaults to "all methods")
    allow: DavMethodSet,
    /// Principal is webdav speak for "user", used as lock owner.
    principal: Option<String>,
    /// read buffer size in bytes
    read_buf_size: usize,
    /// Override for the rename-shuffle detection patterns.
    shuffle_patterns: Option<Vec<String>>,
    /// Override for the maximum lock lifetime.
    lock_timeout_cap: Option<Duration>,
}

impl DavBuilder {
    /// Create a new configuration builder.
    pub fn new(repo: Arc<dyn DavRepository>) -> DavBuilder {
        Self {
            prefix: String::new(),
            repo,
            store: None,
            scheduler: None,
            allow: DavMethodSet::all(),
            principal: None,
            read_buf_size: READ_BUF_SIZE,
            shuffle_patterns: None,
            lock_timeout_cap: None,
        }
    }

    /// Use the configuration that was built to generate a DavHandler.
    pub fn build(self) -> DavHandler {
        self.into()
    }

    /// Prefix to be stripped off before translating the rest of
    /// the request path to a repository path.
    pub fn strip_prefix(self, prefix: impl Into<String>) -> Self {
        let mut this = self;
        this.prefix = prefix.into();
        this
    }

    /// Set the lock record store.
    pub fn lock_store(self, store: Arc<dyn LockStore>) -> Self {
        let mut this = self;
        this.store = Some(store);
        this
    }

    /// Set the timer backend. Defaults to tokio.
    pub fn scheduler(self, scheduler: Arc<dyn Scheduler>) -> Self {
        let mut this = self;
        this.scheduler = Some(scheduler);
        this
    }

    /// Which methods to allow (default is all methods).
    pub fn methods(self, allow: DavMethodSet) -> Self {
        let mut this = self;
        this.allow = allow;
        this
    }

    /// Set the name of the "webdav principal". This will be the owner of any created locks.
    pub fn principal(self, principal: impl Into<String>) -> Self {
        let mut this = self;
        this.principal = Some(principal.into());
        this
    }

    /// Read buffer size in bytes
    pub fn read_buf_size(self, size: usize) -> Self {
        let mut this = self;
        this.read_buf_size = size;
        this
    }

    /// Replace the built-in rename-shuffle detection patterns.
    pub fn shuffle_patterns(self, patterns: Vec<String>) -> Self {
        let mut this = self;
        this.shuffle_patterns = Some(patterns);
        this
    }

    /// Cap on any granted lock timeout (default 24 hours).
    pub fn lock_timeout_cap(self, cap: Duration) -> Self {
        let mut this = self;
        this.lock_timeout_cap = Some(cap);
        this
    }
}

/// The webdav handler struct.
///
/// The `new` and `build` etc methods are used to instantiate a handler.
///
/// The `handle` and `handle_with` methods are the methods that do the actual work.
#[derive(Clone)]
pub struct DavHandler {
    pub(crate) prefix: Arc<String>,
    pub(crate) repo: Arc<dyn DavRepository>,
    pub(crate) locks: Arc<LockManager>,
    pub(crate) allow: DavMethodSet,
    pub(crate) principal: Option<Arc<String>>,
    pub(crate) session: SessionId,
    pub(crate) read_buf_size: usize,
    pub(crate) shuffle: Arc<ShufflePatterns>,
}

impl From<DavBuilder> for DavHandler {
    fn from(cfg: DavBuilder) -> Self {
        let store = cfg.store.unwrap_or_else(|| Arc::new(MemLockStore::new()));
        let scheduler: Arc<dyn Scheduler> =
            cfg.scheduler.unwrap_or_else(|| Arc::new(TokioScheduler));
        let mut locks = LockManager::new(store, scheduler);
        if let Some(cap) = cfg.lock_timeout_cap {
            locks = locks.with_timeout_cap(cap);
        }
        let shuffle = match cfg.shuffle_patterns {
            Some(p) => Arc::new(ShufflePatterns::from_patterns(&p)),
            None => Arc::new(ShufflePatterns::default()),
        };
        Self {
            prefix: Arc::new(cfg.prefix),
            repo: cfg.repo,
            locks: Arc::new(locks),
            allow: cfg.allow,
            principal: cfg.principal.map(Arc::new),
            session: SessionId("default".to_string()),
            read_buf_size: cfg.read_buf_size,
            shuffle,
        }
    }
}

impl DavHandler {
    /// Return a configuration builder.
    pub fn builder(repo: Arc<dyn DavRepository>) -> DavBuilder {
        DavBuilder::new(repo)
    }

    /// Handle a webdav request.
    pub async fn handle<ReqBody, ReqData, ReqError>(&self, req: Request<ReqBody>) -> Response<Body>
    where
        ReqData: Buf + Send + 'static,
        ReqError: StdError + Send + Sync + 'static,
        ReqBody: HttpBody<Data = ReqData, Error = ReqError>,
    {
        self.handle_inner(req).await
    }

    /// Handle a webdav request, overriding parts of the config.
    ///
    /// The `principal` can be set for this request, as can the client
    /// `session` the request belongs to. Locks whose timeout gets
    /// clamped to the maximum are force-released when that session is
    /// reported closed via [`session_closed`](DavHandler::session_closed).
    pub async fn handle_with<ReqBody, ReqData, ReqError>(
        &self,
        req: Request<ReqBody>,
        prefix: Option<String>,
        principal: Option<String>,
        session: Option<SessionId>,
    ) -> Response<Body>
    where
        ReqData: Buf + Send + 'static,
        ReqError: StdError + Send + Sync + 'static,
        ReqBody: HttpBody<Data = ReqData, Error = ReqError>,
    {
        let mut this = self.clone();
        if let Some(prefix) = prefix {
            this.prefix = Arc::new(format!(
                "{}/{}",
                this.prefix.strip_suffix('/').unwrap_or(&this.prefix),
                prefix.strip_prefix('/').unwrap_or(&prefix)
            ));
        }
        if let Some(principal) = principal {
            this.principal = Some(Arc::new(principal));
        }
        if let Some(session) = session {
            this.session = session;
        }
        this.handle_inner(req).await
    }

    /// Handles a request with a `Stream` body instead of a `HttpBody`.
    /// Used with webserver frameworks that have not
    /// opted to use the `http_body` crate just yet.
    #[doc(hidden)]
    pub async fn handle_stream<ReqBody, ReqData, ReqError>(
        &self,
        req: Request<ReqBody>,
    ) -> Response<Body>
    where
        ReqData: Buf + Send + 'static,
        ReqError: StdError + Send + Sync + 'static,
        ReqBody: Stream<Item = Result<ReqData, ReqError>>,
    {
        let req = {
            let (parts, body) = req.into_parts();
            Request::from_parts(parts, StreamBody::new(body))
        };
        self.handle_inner(req).await
    }

    /// Report a client session as gone. Any clamped-timeout locks the
    /// session still holds are force-released on behalf of their owner.
    pub async fn session_closed(&self, session: &SessionId) {
        self.locks.session_closed(session, &*self.repo).await;
    }
}

impl DavHandler {
    // helper.
    pub(crate) async fn has_parent<'a>(&'a self, path: &'a DavPath) -> bool {
        let p = path.parent();
        self.repo
            .resolve(&p)
            .await
            .map(|h| h.is_dir)
            .unwrap_or(false)
    }

    // helper.
    pub(crate) fn path(&self, req: &Request<()>) -> DavPath {
        // This never fails (has been checked before)
        DavPath::from_uri_and_prefix(req.uri(), &self.prefix).unwrap()
    }

    pub(crate) fn owner(&self) -> &str {
        self.principal.as_ref().map(|s| s.as_str()).unwrap_or("")
    }

    // drain request body and return it buffered. The buffer doubles as
    // the retry spool for the execution envelope.
    pub(crate) async fn read_request<ReqBody, ReqData, ReqError>(
        &self,
        body: ReqBody,
        max_size: usize,
    ) -> DavResult<Vec<u8>>
    where
        ReqBody: HttpBody<Data = ReqData, Error = ReqError>,
        ReqData: Buf + Send + 'static,
        ReqError: StdError + Send + Sync + 'static,
    {
        let mut data = Vec::new();
        pin_utils::pin_mut!(body);
        while let Some(res) = body.data().await {
            let mut buf = res.map_err(|_| {
                DavError::IoError(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "UnexpectedEof",
                ))
            })?;
            while buf.has_remaining() {
                if data.len() + buf.remaining() > max_size {
                    return Err(StatusCode::PAYLOAD_TOO_LARGE.into());
                }
                let b = buf.chunk();
                let l = b.len();
                data.extend_from_slice(b);
                buf.advance(l);
            }
        }
        Ok(data)
    }

    // Turn any DavError results into a HTTP error response.
    async fn handle_inner<ReqBody, ReqData, ReqError>(
        &self,
        req: Request<ReqBody>,
    ) -> Response<Body>
    where
        ReqBody: HttpBody<Data = ReqData, Error = ReqError>,
        ReqData: Buf + Send + 'static,
        ReqError: StdError + Send + Sync + 'static,
    {
        let user_agent = req
            .headers()
            .get("user-agent")
            .and_then(|s| s.to_str().ok())
            .unwrap_or("")
            .to_string();
        let is_ms = user_agent.contains("Microsoft");
        let href = req.uri().path().replace('&', "&amp;").replace('<', "&lt;");

        match self.handle2(req).await {
            Ok(resp) => {
                debug!("== END REQUEST result OK");
                resp
            }
            Err(err) => {
                if err.is_client_abort() {
                    // The client went away mid-transfer. Nobody is
                    // listening for this response anymore.
                    debug!("== END REQUEST client disconnected: {}", err);
                } else {
                    debug!("== END REQUEST result {:?}", err);
                }
                let status = self.map_error_status(&err, &user_agent);
                let mut resp = Response::builder();
                if is_ms && status == StatusCode::NOT_FOUND {
                    // Try to keep Windows from caching a NOT_FOUND for
                    // 30-60 seconds. The mini-redirector caches it
                    // case-insensitively, so after "dir www" fails once,
                    // "dir WWW" fails too even if that one exists.
                    resp = resp
                        .header("Cache-Control", "no-store, no-cache, must-revalidate")
                        .header("Progma", "no-cache")
                        .header("Expires", "0")
                        .header("Vary", "*");
                }
                resp = resp.status(status);
                if err.must_close() {
                    resp = resp.header("connection", "close");
                }
                if status == SC_LOCKED {
                    // RFC 4918 precondition body naming the resource
                    // whose token was missing from the If header.
                    resp = resp.header("Content-Type", "application/xml; charset=utf-8");
                    let body = dav_xml_error(&format!(
                        "<D:lock-token-submitted><D:href>{}</D:href></D:lock-token-submitted>",
                        href
                    ));
                    resp.body(body).unwrap()
                } else {
                    resp.header("Content-Length", "0")
                        .body(Body::empty())
                        .unwrap()
                }
            }
        }
    }

    // The single error-to-status mapping site.
    fn map_error_status(&self, err: &DavError, user_agent: &str) -> StatusCode {
        if let DavError::Repo(RepoError::AccessDenied) = err {
            for (re, status) in ACCESS_DENIED_STATUS.iter() {
                if re.is_match(user_agent) {
                    return *status;
                }
            }
        }
        err.statuscode()
    }

    // internal dispatcher part 2.
    async fn handle2<ReqBody, ReqData, ReqError>(
        &self,
        req: Request<ReqBody>,
    ) -> DavResult<Response<Body>>
    where
        ReqBody: HttpBody<Data = ReqData, Error = ReqError>,
        ReqData: Buf + Send + 'static,
        ReqError: StdError + Send + Sync + 'static,
    {
        let (req, body) = {
            let (parts, body) = req.into_parts();
            (Request::from_parts(parts, ()), body)
        };

        // debug when running the webdav litmus tests.
        if log_enabled!(log::Level::Debug) {
            if let Some(t) = req.headers().typed_get::<davheaders::XLitmus>() {
                debug!("X-Litmus: {}", t.0);
            }
        }

        // translate HTTP method to Webdav method.
        let method = match dav_method(req.method()) {
            Ok(m) => m,
            Err(e) => {
                debug!("refusing method {} request {}", req.method(), req.uri());
                return Err(e);
            }
        };

        // see if method is allowed.
        if !self.allow.contains(method) {
            debug!(
                "method {} not allowed on request {}",
                req.method(),
                req.uri()
            );
            return Err(DavError::StatusClose(StatusCode::METHOD_NOT_ALLOWED));
        }

        // make sure the request path is valid.
        DavPath::from_uri_and_prefix(req.uri(), &self.prefix)?;

        // The entire body is buffered up-front. This is what makes the
        // retry loop below safe: a handler can always be re-run against
        // the same bytes.
        let body_data = match method {
            DavMethod::Put => self.read_request(body, usize::MAX).await?,
            _ => self.read_request(body, MAX_XML_BODY).await?,
        };

        // Not all methods accept a body.
        match method {
            DavMethod::Put | DavMethod::PropFind | DavMethod::PropPatch | DavMethod::Lock => {}
            _ => {
                if !body_data.is_empty() {
                    return Err(StatusCode::UNSUPPORTED_MEDIA_TYPE.into());
                }
            }
        }

        debug!("== START REQUEST {:?} {}", method, req.uri());

        let read_only = matches!(
            method,
            DavMethod::Options
                | DavMethod::Get
                | DavMethod::Head
                | DavMethod::Post
                | DavMethod::PropFind
        );

        let body_data = Bytes::from(body_data);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = self.dispatch(method, &req, &body_data).await;
            match result {
                Err(DavError::Repo(RepoError::ConcurrentUpdate))
                    if !read_only && attempt < ENVELOPE_RETRIES =>
                {
                    debug!("concurrent update, retrying (attempt {})", attempt);
                    continue;
                }
                other => return other,
            }
        }
    }

    async fn dispatch(
        &self,
        method: DavMethod,
        req: &Request<()>,
        body: &Bytes,
    ) -> DavResult<Response<Body>> {
        match method {
            DavMethod::Options => self.handle_options(req).await,
            DavMethod::PropFind => self.handle_propfind(req, body).await,
            DavMethod::PropPatch => self.handle_proppatch(req, body).await,
            DavMethod::MkCol => self.handle_mkcol(req).await,
            DavMethod::Delete => self.handle_delete(req).await,
            DavMethod::Lock => self.handle_lock(req, body).await,
            DavMethod::Unlock => self.handle_unlock(req).await,
            // POST on a dav resource behaves like GET.
            DavMethod::Head | DavMethod::Get | DavMethod::Post => self.handle_get(req).await,
            DavMethod::Copy | DavMethod::Move => self.handle_copymove(req, method).await,
            DavMethod::Put => self.handle_put(req, body).await,
        }
    }

    // Lock and conditional checking before a mutating operation on a
    // node. Finds the governing lock (the node's own, or the nearest
    // depth-infinity ancestor's) and verifies the request's If header
    // against it and the node's ETag.
    pub(crate) async fn check_locked_node(
        &self,
        req: &Request<()>,
        node: &NodeHandle,
        lookup: &mut LockLookup,
    ) -> DavResult<()> {
        let if_header = parse_if_header(req.headers())?;

        // Direct lock first; fall back to indirect coverage.
        let mut record = self.locks.get_lock_info(&node.id)?;
        let mut holder = node.id.clone();
        if !record.is_locked() || record.is_expired() {
            match self
                .locks
                .indirect_lock_info(&node.id, &*self.repo, lookup)
                .await?
            {
                Some((h, r)) => {
                    holder = h;
                    record = r;
                }
                None => record = LockRecord::default(),
            }
        }

        let etag = node.etag();

        if !record.is_locked() || record.is_expired() {
            // Unlocked: only the If conditions themselves can fail.
            if let Some(ih) = &if_header {
                if !ih.matches(&etag, None) {
                    return Err(DavError::Status(StatusCode::PRECONDITION_FAILED));
                }
            }
            return Ok(());
        }

        if record.is_shared() {
            // A shared lock admits holders of any member token.
            match &if_header {
                Some(ih) => {
                    let submitted = ih.submitted_tokens();
                    if submitted
                        .iter()
                        .any(|t| record.shared_tokens().contains(*t))
                    {
                        return Ok(());
                    }
                    Err(DavError::Status(SC_LOCKED))
                }
                None => Err(DavError::Status(SC_LOCKED)),
            }
        } else {
            // An exclusive lock demands its token in the If header. Even
            // the owner gets a 423 without it; identity alone is not a
            // lock claim. Conditions are evaluated only after the token
            // requirement holds.
            let token = make_lock_token(&holder, &record.owner);
            match &if_header {
                None => Err(DavError::Status(SC_LOCKED)),
                Some(ih) => {
                    if !ih.submitted_tokens().contains(&token.as_str()) {
                        Err(DavError::Status(SC_LOCKED))
                    } else if ih.matches(&etag, Some(&token)) {
                        Ok(())
                    } else {
                        Err(DavError::Status(StatusCode::PRECONDITION_FAILED))
                    }
                }
            }
        }
    }

    // Token verification used by LOCK refresh and UNLOCK: the presented
    // token must belong to the stored record.
    pub(crate) fn check_lock_token(
        &self,
        record: &LockRecord,
        holder: &NodeId,
        token: &str,
    ) -> DavResult<()> {
        if record.is_exclusive() {
            let expect = make_lock_token(holder, &record.owner);
            if token == expect {
                return Ok(());
            }
            return Err(DavError::Status(StatusCode::PRECONDITION_FAILED));
        }
        if record.shared_tokens().contains(token) {
            return Ok(());
        }
        Err(DavError::Status(StatusCode::PRECONDITION_FAILED))
    }

    pub(crate) fn if_header(&self, req: &Request<()>) -> DavResult<Option<IfHeader>> {
        parse_if_header(req.headers())
    }
}

// Adapts a plain `Stream` of buffers to the `http_body::Body` interface
// that `read_request` consumes.
#[pin_project]
pub(crate) struct StreamBody<B> {
    #[pin]
    body: B,
}

impl<B> StreamBody<B> {
    fn new(body: B) -> StreamBody<B> {
        StreamBody { body }
    }
}

impl<ReqBody, ReqData, ReqError> HttpBody for StreamBody<ReqBody>
where
    ReqData: Buf + Send,
    ReqError: StdError + Send + Sync + 'static,
    ReqBody: Stream<Item = Result<ReqData, ReqError>>,
{
    type Data = ReqData;
    type Error = ReqError;

    fn poll_data(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Self::Data, Self::Error>>> {
        self.project().body.poll_next(cx)
    }

    fn poll_trailers(
        self: Pin<&mut Self>,
        _cx: &mut Context,
    ) -> Poll<Result<Option<HeaderMap>, Self::Error>> {
        Poll::Ready(Ok(None))
    }
}
