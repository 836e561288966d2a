//! ## Async WebDAV gateway for a document repository
//!
//! [`Webdav`] (RFC4918) is defined as HTTP (GET/HEAD/PUT/DELETE) plus a
//! bunch of extension methods (PROPFIND, etc). These extension methods
//! are used to manage collections, get information on them, rename and
//! copy items, lock/unlock items, etc.
//!
//! This library is a `handler` that maps the HTTP/Webdav protocol onto
//! a node-based document repository: it takes a `http::Request`,
//! translates the path to a repository node, runs the operation through
//! lock and conditional checking, and generates a `http::Response`. The
//! repository is abstracted behind the [`DavRepository`] trait; an
//! in-memory implementation ([`MemRepo`]) is included and doubles as
//! the test backend.
//!
//! Because the handler works with the standard types from the `http`
//! and `http_body` crates, it can be used straight away with http
//! libraries and frameworks that also work with those types, like
//! hyper.
//!
//! A few behaviors are specific to fronting a versioned repository
//! rather than a plain filesystem:
//!
//! - writes run inside a retry envelope that re-executes the handler
//!   when the repository reports a concurrent-update conflict;
//! - LOCK on an unmapped path creates a provisional node that is
//!   deleted again if no PUT follows before the lock times out;
//! - MOVEs that match the temp-file rename dance of office suites are
//!   detected and turned into in-place content updates, so documents
//!   keep their identity, version history and properties.
//!
//! ## Example.
//!
//! ```no_run
//! use std::convert::Infallible;
//! use dav_gateway::{DavHandler, MemRepo};
//!
//! #[tokio::main]
//! async fn main() {
//!     let addr = ([127, 0, 0, 1], 4918).into();
//!
//!     let dav_server = DavHandler::builder(MemRepo::new())
//!         .strip_prefix("/webdav")
//!         .build();
//!
//!     let make_service = hyper::service::make_service_fn(move |_| {
//!         let dav_server = dav_server.clone();
//!         async move {
//!             let func = move |req| {
//!                 let dav_server = dav_server.clone();
//!                 async move {
//!                     Ok::<_, Infallible>(dav_server.handle(req).await)
//!                 }
//!             };
//!             Ok::<_, Infallible>(hyper::service::service_fn(func))
//!         }
//!     });
//!
//!     let _ = hyper::Server::bind(&addr)
//!         .serve(make_service)
//!         .await
//!         .map_err(|e| eprintln!("server error: {}", e));
//! }
//! ```

#[macro_use]
extern crate log;
#[macro_use]
extern crate lazy_static;

mod conditional;
mod davhandler;
mod davheaders;
mod errors;
mod multierror;
mod util;
mod xmltree_ext;

pub mod body;
pub mod davpath;
pub mod locks;
pub mod repo;

pub use crate::body::Body;
pub use crate::davhandler::{DavBuilder, DavHandler};
pub use crate::errors::{DavError, DavResult};
pub use crate::locks::{LockManager, LockStore, MemLockStore, Scheduler, SessionId};
pub use crate::repo::{DavRepository, MemRepo};
pub use crate::util::{DavMethod, DavMethodSet};
