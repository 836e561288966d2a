//! The repository collaborator.
//!
//! The gateway talks to the backing document repository through the
//! narrow [`DavRepository`] trait: resolve a virtual path to a node,
//! create/delete/rename/copy nodes, read and write content, get and set
//! dead properties, and flip a handful of per-node flags the webdav layer
//! needs (hidden, no-content, version suppression). Everything else the
//! repository does (versioning internals, permissions, search) stays a
//! black box; permission failures surface as [`RepoError::AccessDenied`]
//! from any call.

pub(crate) mod memrepo;

pub use memrepo::MemRepo;

use std::error::Error;
use std::fmt;
use std::time::SystemTime;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::StatusCode;

use crate::davpath::DavPath;
use crate::util::systemtime_to_millis;

pub type RepoResult<T> = Result<T, RepoError>;
pub type RepoFuture<'a, T> = BoxFuture<'a, RepoResult<T>>;

/// Errors from the repository collaborator.
#[derive(Debug)]
pub enum RepoError {
    /// The path or node does not exist.
    NotFound,
    /// The target already exists.
    Exists,
    /// The parent of a create/move target is missing, or the request is
    /// structurally impossible (copy a collection into itself, ...).
    Conflict,
    /// The authenticated principal may not perform this operation.
    AccessDenied,
    /// An optimistic-concurrency conflict; the operation may succeed when
    /// retried. The execution envelope retries these.
    ConcurrentUpdate,
    /// Anything else.
    Other(std::io::Error),
}

impl RepoError {
    pub fn statuscode(&self) -> StatusCode {
        match self {
            RepoError::NotFound => StatusCode::NOT_FOUND,
            RepoError::Exists => StatusCode::METHOD_NOT_ALLOWED,
            RepoError::Conflict => StatusCode::CONFLICT,
            RepoError::AccessDenied => StatusCode::FORBIDDEN,
            RepoError::ConcurrentUpdate => StatusCode::CONFLICT,
            RepoError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl fmt::Display for RepoError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RepoError::NotFound => write!(f, "not found"),
            RepoError::Exists => write!(f, "already exists"),
            RepoError::Conflict => write!(f, "conflict"),
            RepoError::AccessDenied => write!(f, "access denied"),
            RepoError::ConcurrentUpdate => write!(f, "concurrent update"),
            RepoError::Other(e) => write!(f, "{}", e),
        }
    }
}

impl Error for RepoError {}

/// Identity of a repository node. Stable for the life of the node,
/// independent of its path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub String);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A resolved node plus the metadata the webdav layer cares about.
#[derive(Debug, Clone)]
pub struct NodeHandle {
    pub id: NodeId,
    pub name: String,
    pub is_dir: bool,
    pub len: u64,
    pub created: SystemTime,
    pub modified: SystemTime,
    /// Hidden by the webdav layer itself (rename-shuffle bookkeeping).
    pub hidden: bool,
    /// Provisionally created by LOCK, content not yet uploaded.
    pub no_content: bool,
}

impl NodeHandle {
    /// The quoted strong ETag: `"<node-id>_<modified-epoch-millis>"`.
    pub fn etag(&self) -> String {
        format!("\"{}_{}\"", self.id.0, systemtime_to_millis(self.modified))
    }
}

/// A dead property stored in the repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DavProp {
    pub name: String,
    pub prefix: Option<String>,
    pub namespace: Option<String>,
    /// Full serialized XML of the property element, if carried.
    pub xml: Option<Vec<u8>>,
}

/// The narrow set of repository operations the gateway relies on.
pub trait DavRepository: Send + Sync {
    /// Map a virtual path to a node. The root path resolves to the root
    /// node itself.
    fn resolve<'a>(&'a self, path: &'a DavPath) -> RepoFuture<'a, NodeHandle>;

    /// Re-read a node's metadata by identity.
    fn node<'a>(&'a self, id: &'a NodeId) -> RepoFuture<'a, NodeHandle>;

    /// Primary parent of a node; `None` for the root.
    fn parent_of<'a>(&'a self, id: &'a NodeId) -> RepoFuture<'a, Option<NodeId>>;

    /// Immediate children of a collection.
    fn children<'a>(&'a self, id: &'a NodeId) -> RepoFuture<'a, Vec<NodeHandle>>;

    /// Create an empty content node under `parent`.
    fn create_file<'a>(&'a self, parent: &'a NodeId, name: &'a str) -> RepoFuture<'a, NodeHandle>;

    /// Create a collection under `parent`.
    fn create_collection<'a>(
        &'a self,
        parent: &'a NodeId,
        name: &'a str,
    ) -> RepoFuture<'a, NodeHandle>;

    /// Remove a node (recursively for collections).
    fn remove<'a>(&'a self, id: &'a NodeId) -> RepoFuture<'a, ()>;

    /// Move a node to a new parent and/or name, keeping its identity.
    fn rename<'a>(
        &'a self,
        id: &'a NodeId,
        new_parent: &'a NodeId,
        new_name: &'a str,
    ) -> RepoFuture<'a, ()>;

    /// Deep-copy a node to a new parent/name; the copy gets fresh
    /// identities.
    fn copy<'a>(
        &'a self,
        id: &'a NodeId,
        new_parent: &'a NodeId,
        new_name: &'a str,
    ) -> RepoFuture<'a, NodeHandle>;

    /// Read content, optionally a byte range (inclusive start, exclusive
    /// end).
    fn read_content<'a>(
        &'a self,
        id: &'a NodeId,
        range: Option<(u64, u64)>,
    ) -> RepoFuture<'a, Bytes>;

    /// Replace content.
    fn write_content<'a>(&'a self, id: &'a NodeId, data: Bytes) -> RepoFuture<'a, ()>;

    /// Hide or unhide a node from listings.
    fn set_hidden<'a>(&'a self, id: &'a NodeId, hidden: bool) -> RepoFuture<'a, ()>;

    /// Set or clear the "no content yet" marker on a provisional node.
    fn set_no_content<'a>(&'a self, id: &'a NodeId, no_content: bool) -> RepoFuture<'a, ()>;

    /// Tell the repository not to create a new version for the next
    /// content write to this node.
    fn suppress_next_version<'a>(&'a self, id: &'a NodeId) -> RepoFuture<'a, ()>;

    /// Whether the node is part of an active checkout (black-box
    /// versioning query; used by session-teardown lock cleanup).
    fn is_checked_out<'a>(&'a self, id: &'a NodeId) -> RepoFuture<'a, bool>;

    /// All dead properties of a node.
    fn get_props<'a>(&'a self, id: &'a NodeId) -> RepoFuture<'a, Vec<DavProp>>;

    /// One dead property's serialized XML.
    fn get_prop<'a>(&'a self, id: &'a NodeId, prop: DavProp) -> RepoFuture<'a, Vec<u8>>;

    /// Apply a batch of set/remove property actions. Per-item results;
    /// one item failing does not abort the rest.
    fn patch_props<'a>(
        &'a self,
        id: &'a NodeId,
        set: Vec<DavProp>,
        remove: Vec<DavProp>,
    ) -> RepoFuture<'a, Vec<(StatusCode, DavProp)>>;
}
