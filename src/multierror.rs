//! Multistatus (207) responses for partial failures.
//!
//! DELETE, COPY and MOVE on collections can fail for a subset of the
//! members. Those failures are collected here and rendered as one
//! `D:multistatus` document. A single failure on the request path
//! itself collapses to a plain status response.

use std::borrow::Cow;

use http::{Response, StatusCode};
use xml::common::XmlVersion;
use xml::writer::EventWriter;
use xml::writer::XmlEvent as XmlWEvent;
use xml::EmitterConfig;
use xmltree::Element;

use crate::body::Body;
use crate::davpath::DavPath;
use crate::errors::{DavError, DavResult, SC_MULTI_STATUS};
use crate::util::MemBuffer;
use crate::xmltree_ext::ElementExt;

pub(crate) struct MultiError {
    path: DavPath,
    errors: Vec<(DavPath, StatusCode)>,
}

impl MultiError {
    pub fn new(path: DavPath) -> MultiError {
        MultiError {
            path,
            errors: Vec::new(),
        }
    }

    pub fn add_status(&mut self, path: &DavPath, status: StatusCode) {
        debug!("multistatus: {} -> {}", path, status);
        self.errors.push((path.clone(), status));
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Build the final response. `success_status` is what goes on the
    /// wire when every member succeeded.
    pub fn finalstatus(self, success_status: StatusCode) -> DavResult<Response<Body>> {
        if self.errors.is_empty() {
            let resp = Response::builder()
                .status(success_status)
                .body(Body::empty())
                .map_err(|_| DavError::Status(StatusCode::INTERNAL_SERVER_ERROR))?;
            return Ok(resp);
        }

        // One error on the request path itself: no point in a 207.
        if self.errors.len() == 1 && self.errors[0].0.as_str() == self.path.as_str() {
            let resp = Response::builder()
                .status(self.errors[0].1)
                .body(Body::empty())
                .map_err(|_| DavError::Status(StatusCode::INTERNAL_SERVER_ERROR))?;
            return Ok(resp);
        }

        let mut buffer = MemBuffer::new();
        {
            let mut emitter = EventWriter::new_with_config(
                &mut buffer,
                EmitterConfig {
                    normalize_empty_elements: false,
                    perform_indent: false,
                    indent_string: Cow::Borrowed(""),
                    ..Default::default()
                },
            );
            emitter.write(XmlWEvent::StartDocument {
                version: XmlVersion::Version10,
                encoding: Some("utf-8"),
                standalone: None,
            })?;
            emitter.write(XmlWEvent::start_element("D:multistatus").ns("D", "DAV:"))?;
            for (path, status) in &self.errors {
                emitter.write(XmlWEvent::start_element("D:response"))?;
                Element::new2("D:href")
                    .text(path.as_url_string())
                    .write_ev(&mut emitter)?;
                Element::new2("D:status")
                    .text(format!("HTTP/1.1 {}", status))
                    .write_ev(&mut emitter)?;
                emitter.write(XmlWEvent::end_element())?;
            }
            emitter.write(XmlWEvent::end_element())?;
        }

        let resp = Response::builder()
            .status(SC_MULTI_STATUS)
            .header("content-type", "application/xml; charset=utf-8")
            .body(Body::from(buffer.take()))
            .map_err(|_| DavError::Status(StatusCode::INTERNAL_SERVER_ERROR))?;
        Ok(resp)
    }
}
