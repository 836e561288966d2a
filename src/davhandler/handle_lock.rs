use std::borrow::Cow;
use std::io::Cursor;
use std::time::Duration;

use bytes::Bytes;
use headers::HeaderMapExt;
use http::{Request, Response, StatusCode};
use xml::common::XmlVersion;
use xml::writer::EventWriter;
use xml::writer::XmlEvent as XmlWEvent;
use xml::EmitterConfig;
use xmltree::{Element, XMLNode};

use crate::body::Body;
use crate::davheaders::{self, OPAQUE_LOCK_TOKEN};
use crate::errors::DavError;
use crate::locks::{
    make_lock_token, LockDepth, LockLookup, LockRecord, LockScope,
};
use crate::repo::{NodeHandle, RepoError};
use crate::util::MemBuffer;
use crate::xmltree_ext::ElementExt;
use crate::DavResult;

// Build `<name>` or `<D:name>` depending on the agent variant.
fn elem(name: &str, prefixed: bool) -> Element {
    if prefixed {
        Element::new2(&format!("D:{}", name))
    } else {
        Element::new(name)
    }
}

/// The static `D:supportedlock` property value.
pub(crate) fn supportedlock_element() -> Element {
    let mut sl = Element::new2("D:supportedlock");
    for scope in ["exclusive", "shared"] {
        let mut entry = Element::new2("D:lockentry");
        let mut ls = Element::new2("D:lockscope");
        ls.children
            .push(XMLNode::Element(Element::new2(&format!("D:{}", scope))));
        let mut lt = Element::new2("D:locktype");
        lt.children
            .push(XMLNode::Element(Element::new2("D:write")));
        entry.children.push(XMLNode::Element(ls));
        entry.children.push(XMLNode::Element(lt));
        sl.children.push(XMLNode::Element(entry));
    }
    sl
}

/// The `D:lockdiscovery` property value for a node's current lock.
pub(crate) fn lockdiscovery_element(
    record: &LockRecord,
    token: Option<&str>,
    prefixed: bool,
) -> Element {
    let mut ld = elem("lockdiscovery", prefixed);
    if !record.is_locked() || record.is_expired() {
        return ld;
    }

    let mut active = elem("activelock", prefixed);

    let mut lt = elem("locktype", prefixed);
    lt.children.push(XMLNode::Element(elem("write", prefixed)));
    active.children.push(XMLNode::Element(lt));

    let scope = match record.scope {
        LockScope::Exclusive => "exclusive",
        LockScope::Shared => "shared",
    };
    let mut ls = elem("lockscope", prefixed);
    ls.children.push(XMLNode::Element(elem(scope, prefixed)));
    active.children.push(XMLNode::Element(ls));

    let depth = match record.depth {
        LockDepth::Zero => "0",
        LockDepth::Infinity => "infinity",
    };
    active
        .children
        .push(XMLNode::Element(elem("depth", prefixed).text(depth)));

    if !record.owner.is_empty() {
        active
            .children
            .push(XMLNode::Element(elem("owner", prefixed).text(record.owner.clone())));
    }

    let timeout = match record.remaining_timeout_seconds() {
        None => "Infinite".to_string(),
        Some(secs) => format!("Second-{}", secs),
    };
    active
        .children
        .push(XMLNode::Element(elem("timeout", prefixed).text(timeout)));

    if let Some(token) = token {
        let mut lt = elem("locktoken", prefixed);
        lt.children
            .push(XMLNode::Element(elem("href", prefixed).text(token.to_string())));
        active.children.push(XMLNode::Element(lt));
    }

    ld.children.push(XMLNode::Element(active));
    ld
}

fn is_ms_agent(req: &Request<()>) -> bool {
    req.headers()
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .map(|ua| ua.contains("Microsoft"))
        .unwrap_or(false)
}

// <D:prop><D:lockdiscovery>...</D:lockdiscovery></D:prop> response body.
// Microsoft agents get the same document in the default namespace; their
// mini-redirector chokes on prefixed names here.
fn lock_response_body(record: &LockRecord, token: &str, ms: bool) -> DavResult<Body> {
    let prefixed = !ms;
    let mut prop = if prefixed {
        Element::new2("D:prop")
    } else {
        Element::new("prop")
    };
    prop.namespace = Some("DAV:".to_string());
    prop.children.push(XMLNode::Element(lockdiscovery_element(
        record,
        Some(token),
        prefixed,
    )));

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
        prop.write_ev(&mut emitter)?;
    }
    Ok(Body::from(buffer.take()))
}

impl crate::DavHandler {
    pub(crate) async fn handle_lock(
        &self,
        req: &Request<()>,
        body: &Bytes,
    ) -> DavResult<Response<Body>> {
        let path = self.path(req);

        let depth = match req.headers().typed_get::<davheaders::Depth>() {
            Some(davheaders::Depth::Zero) => LockDepth::Zero,
            Some(davheaders::Depth::Infinity) | None => LockDepth::Infinity,
            // Depth: 1 makes no sense for LOCK.
            Some(davheaders::Depth::One) => {
                return Err(DavError::Status(StatusCode::BAD_REQUEST));
            }
        };

        let timeout = req
            .headers()
            .typed_get::<davheaders::Timeout>()
            .and_then(|t| t.0.into_iter().next())
            .and_then(|t| t.as_duration());

        if body.is_empty() {
            return self.lock_refresh(req, timeout).await;
        }

        // Parse the lockinfo body.
        let mut lockinfo = Element::parse2(Cursor::new(body.to_vec()))?;
        if lockinfo.name != "lockinfo" {
            return Err(DavError::XmlParseError);
        }
        let scope = lockinfo
            .take_elem("lockscope")
            .and_then(|e| e.elements().first().map(|c| c.name.clone()))
            .ok_or(DavError::XmlParseError)?;
        match scope.as_str() {
            "exclusive" => {}
            // Shared locks exist in the data model for interop, but
            // handing out new ones is refused by policy.
            "shared" => return Err(DavError::Status(StatusCode::PRECONDITION_FAILED)),
            _ => return Err(DavError::XmlParseError),
        }

        let mut created = false;
        let node = match self.repo.resolve(&path).await {
            Ok(node) => node,
            Err(RepoError::NotFound) => {
                // Lock-null resource: create a provisional node that a
                // PUT is expected to fill in shortly.
                let parent = self
                    .repo
                    .resolve(&path.parent())
                    .await
                    .map_err(|_| DavError::Status(StatusCode::CONFLICT))?;
                let node = self.repo.create_file(&parent.id, path.file_name()).await?;
                self.repo.set_no_content(&node.id, true).await?;
                created = true;
                node
            }
            Err(e) => return Err(e.into()),
        };

        // Refuse if already locked by someone we cannot satisfy.
        let mut lookup = LockLookup::new();
        if let Err(e) = self.check_locked_node(req, &node, &mut lookup).await {
            if created {
                let _ = self.repo.remove(&node.id).await;
            }
            return Err(e);
        }

        let owner = self.owner().to_string();
        let token = make_lock_token(&node.id, &owner);
        let mut record = LockRecord::new(owner, depth);
        record
            .set_exclusive_token(token.clone())
            .map_err(DavError::Lock)?;

        let stored = self
            .locks
            .lock(&node.id, record, timeout, &self.session)
            .map_err(DavError::Lock)?;

        if created {
            // If no PUT arrives before the lock runs out, the
            // provisional node is deleted again.
            let delay = stored
                .remaining_timeout_seconds()
                .map(Duration::from_secs)
                .unwrap_or(self.locks.timeout_cap());
            self.locks
                .schedule_provisional_delete(node.id.clone(), delay, self.repo.clone());
        }

        self.lock_response(req, &stored, &token, created)
    }

    async fn lock_refresh(
        &self,
        req: &Request<()>,
        timeout: Option<Duration>,
    ) -> DavResult<Response<Body>> {
        let path = self.path(req);
        let node = self.repo.resolve(&path).await?;

        let record = self.locks.get_lock_info(&node.id).map_err(DavError::Lock)?;
        if !record.is_locked() || record.is_expired() {
            // A body-less LOCK is a refresh; refreshing nothing is a
            // client error.
            return Err(DavError::Status(StatusCode::BAD_REQUEST));
        }

        let if_header = self
            .if_header(req)?
            .ok_or(DavError::Status(StatusCode::BAD_REQUEST))?;
        let token = make_lock_token(&node.id, &record.owner);
        if !if_header.submitted_tokens().contains(&token.as_str()) {
            return Err(DavError::Status(StatusCode::PRECONDITION_FAILED));
        }

        let refreshed = self
            .locks
            .refresh(&node.id, timeout, &self.session)
            .map_err(DavError::Lock)?;

        self.lock_response(req, &refreshed, &token, false)
    }

    fn lock_response(
        &self,
        req: &Request<()>,
        record: &LockRecord,
        token: &str,
        created: bool,
    ) -> DavResult<Response<Body>> {
        let body = lock_response_body(record, token, is_ms_agent(req))?;
        let mut res = Response::new(body);
        *res.status_mut() = if created {
            StatusCode::CREATED
        } else {
            StatusCode::OK
        };
        res.headers_mut().insert(
            "content-type",
            "application/xml; charset=utf-8".parse().unwrap(),
        );
        res.headers_mut()
            .insert("lock-token", format!("<{}>", token).parse().unwrap());
        Ok(res)
    }

    pub(crate) async fn handle_unlock(&self, req: &Request<()>) -> DavResult<Response<Body>> {
        let path = self.path(req);

        let token_hdr = req
            .headers()
            .typed_get::<davheaders::LockToken>()
            .ok_or(DavError::Status(StatusCode::BAD_REQUEST))?;
        // Some clients send the token without the angle brackets;
        // opaque() tolerates both forms.
        let token = token_hdr.opaque().to_string();
        if !token.starts_with(OPAQUE_LOCK_TOKEN) {
            return Err(DavError::Status(StatusCode::BAD_REQUEST));
        }

        let node = self.repo.resolve(&path).await?;
        let record = self.locks.get_lock_info(&node.id).map_err(DavError::Lock)?;

        if !record.is_locked() {
            return Err(DavError::Status(StatusCode::CONFLICT));
        }

        if record.is_expired() {
            // The expiry already "morally" unlocked it; clean up the
            // leftover record and report success.
            debug!("unlock of expired lock on {}, cleaning up", path);
            self.locks.unlock(&node.id).map_err(DavError::Lock)?;
            return self.unlock_ok(&node).await;
        }

        self.check_lock_token(&record, &node.id, &token)?;

        if record.is_shared() {
            self.locks
                .remove_shared_token(&node.id, &token)
                .map_err(DavError::Lock)?;
        } else {
            self.locks.unlock(&node.id).map_err(DavError::Lock)?;
        }

        self.unlock_ok(&node).await
    }

    async fn unlock_ok(&self, node: &NodeHandle) -> DavResult<Response<Body>> {
        // The node is no longer a provisional lock-null resource.
        if node.no_content {
            self.repo.set_no_content(&node.id, false).await?;
        }
        let mut res = Response::new(Body::empty());
        *res.status_mut() = StatusCode::NO_CONTENT;
        Ok(res)
    }
}
