//! PROPFIND and PROPPATCH.
//!
//! Both methods answer with a `D:multistatus` document. The response is
//! buffered in full before it goes on the wire, so a mid-walk failure
//! never truncates an already-started 207.

use std::borrow::Cow;
use std::collections::HashMap;
use std::io::Cursor;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use headers::HeaderMapExt;
use http::{Request, Response, StatusCode};
use xml::common::XmlVersion;
use xml::writer::EventWriter;
use xml::writer::XmlEvent as XmlWEvent;
use xml::EmitterConfig;
use xmltree::{Element, XMLNode};

use crate::body::Body;
use crate::davheaders;
use crate::davpath::DavPath;
use crate::errors::{DavError, SC_FAILED_DEPENDENCY, SC_MULTI_STATUS};
use crate::locks::LockLookup;
use crate::repo::{DavProp, NodeHandle};
use crate::util::{systemtime_to_httpdate, systemtime_to_rfc3339, MemBuffer};
use crate::xmltree_ext::ElementExt;
use crate::DavResult;

use super::handle_lock::{lockdiscovery_element, supportedlock_element};

const NS_DAV_URI: &str = "DAV:";
const NS_MS_URI: &str = "urn:schemas-microsoft-com:";

// names reported by PROPFIND <propname/>.
const PROPNAME_STR: &[&str] = &[
    "D:creationdate",
    "D:displayname",
    "D:getcontentlength",
    "D:getcontenttype",
    "D:getetag",
    "D:getlastmodified",
    "D:lockdiscovery",
    "D:resourcetype",
    "D:supportedlock",
];

// values returned by PROPFIND <allprop/> or an empty body.
const ALLPROP_STR: &[&str] = &[
    "D:creationdate",
    "D:displayname",
    "D:getcontentlength",
    "D:getcontenttype",
    "D:getetag",
    "D:getlastmodified",
    "D:lockdiscovery",
    "D:resourcetype",
    "D:supportedlock",
];

lazy_static! {
    static ref ALLPROP: Vec<Element> = init_staticprop(ALLPROP_STR);
    static ref PROPNAME: Vec<Element> = init_staticprop(PROPNAME_STR);
}

fn init_staticprop(p: &[&str]) -> Vec<Element> {
    let mut v = Vec::new();
    for a in p {
        let mut e = Element::new2(a);
        e.namespace = match e.prefix.as_deref() {
            Some("D") => Some(NS_DAV_URI.to_string()),
            Some("M") => Some(NS_MS_URI.to_string()),
            _ => None,
        };
        v.push(e);
    }
    v
}

struct StatusElement {
    status: StatusCode,
    element: Element,
}

/// Incrementally emits `D:response` blocks into one buffered
/// multistatus document.
struct PropWriter {
    emitter: EventWriter<MemBuffer>,
    name: String,
    props: Vec<Element>,
}

impl PropWriter {
    fn new(name: &str, mut props: Vec<Element>) -> DavResult<PropWriter> {
        let mut emitter = EventWriter::new_with_config(
            MemBuffer::new(),
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

        // allprop/propname get the static tables merged in.
        if name != "prop" && name != "propertyupdate" {
            let table = if name == "propname" { &*PROPNAME } else { &*ALLPROP };
            for a in table {
                if !props
                    .iter()
                    .any(|e| a.namespace == e.namespace && a.name == e.name)
                {
                    props.push(a.clone());
                }
            }
        }

        let mut ev = XmlWEvent::start_element("D:multistatus").ns("D", NS_DAV_URI);
        if props
            .iter()
            .any(|p| p.namespace.as_deref() == Some(NS_MS_URI))
        {
            ev = ev.ns("M", NS_MS_URI);
        }
        emitter.write(ev)?;

        Ok(PropWriter {
            emitter,
            name: name.to_string(),
            props,
        })
    }

    fn build_elem(
        &self,
        content: bool,
        e: &Element,
        text: impl Into<String>,
    ) -> StatusElement {
        let mut elem = Element::new(&e.name);
        elem.prefix = Some("D".to_string());
        if content {
            let t = text.into();
            if !t.is_empty() {
                elem.children.push(XMLNode::Text(t));
            }
        }
        StatusElement {
            status: StatusCode::OK,
            element: elem,
        }
    }

    async fn build_prop(
        &self,
        handler: &crate::DavHandler,
        prop: &Element,
        node: &NodeHandle,
        docontent: bool,
    ) -> DavResult<StatusElement> {
        let mut try_deadprop = false;
        let mut fallback: Option<String> = None;

        if prop.namespace.as_deref() == Some(NS_DAV_URI) {
            match prop.name.as_str() {
                "creationdate" => {
                    let tm = systemtime_to_rfc3339(node.created);
                    return Ok(self.build_elem(docontent, prop, tm));
                }
                "displayname" => {
                    // PROPPATCH may have stored an override.
                    try_deadprop = true;
                    fallback = Some(node.name.clone());
                }
                "getetag" => {
                    return Ok(self.build_elem(docontent, prop, node.etag()));
                }
                "getcontentlength" => {
                    if !node.is_dir {
                        return Ok(self.build_elem(docontent, prop, node.len.to_string()));
                    }
                }
                "getcontenttype" => {
                    let ct = if node.is_dir {
                        "httpd/unix-directory".to_string()
                    } else {
                        mime_guess::from_path(&node.name)
                            .first_or_octet_stream()
                            .to_string()
                    };
                    return Ok(self.build_elem(docontent, prop, ct));
                }
                "getlastmodified" => {
                    let tm = systemtime_to_httpdate(node.modified);
                    return Ok(self.build_elem(docontent, prop, tm));
                }
                "resourcetype" => {
                    let mut elem = Element::new("resourcetype");
                    elem.prefix = Some("D".to_string());
                    if node.is_dir && docontent {
                        elem.children
                            .push(XMLNode::Element(Element::new2("D:collection")));
                    }
                    return Ok(StatusElement {
                        status: StatusCode::OK,
                        element: elem,
                    });
                }
                "supportedlock" => {
                    return Ok(StatusElement {
                        status: StatusCode::OK,
                        element: supportedlock_element(),
                    });
                }
                "lockdiscovery" => {
                    return Ok(StatusElement {
                        status: StatusCode::OK,
                        element: handler.lockdiscovery_for(node)?,
                    });
                }
                _ => {}
            }
        } else {
            try_deadprop = true;
        }

        if try_deadprop && self.name == "prop" {
            let dprop = element_to_davprop(prop);
            if let Ok(xml) = handler.repo.get_prop(&node.id, dprop).await {
                if let Ok(e) = Element::parse(Cursor::new(xml)) {
                    return Ok(StatusElement {
                        status: StatusCode::OK,
                        element: e,
                    });
                }
            }
        }

        if let Some(text) = fallback {
            return Ok(self.build_elem(docontent, prop, text));
        }

        let elem = if prop.namespace.as_deref() == Some(NS_DAV_URI) {
            self.build_elem(false, prop, "").element
        } else {
            prop.clone()
        };
        Ok(StatusElement {
            status: StatusCode::NOT_FOUND,
            element: elem,
        })
    }

    async fn write_props(
        &mut self,
        handler: &crate::DavHandler,
        path: &DavPath,
        node: &NodeHandle,
    ) -> DavResult<()> {
        let mut props: HashMap<StatusCode, Vec<Element>> = HashMap::new();
        let do_content = self.name != "propname";

        for p in &self.props {
            let res = self.build_prop(handler, p, node, do_content).await?;
            // allprop/propname only report what exists; an explicit
            // prop request reports 404 entries as well.
            if res.status == StatusCode::OK || self.name == "prop" {
                props.entry(res.status).or_default().push(res.element);
            }
        }

        if self.name == "propname" || self.name == "allprop" {
            if let Ok(v) = handler.repo.get_props(&node.id).await {
                for e in v.into_iter().map(davprop_to_element) {
                    props.entry(StatusCode::OK).or_default().push(e);
                }
            }
        }

        self.write_propresponse(path, props)
    }

    fn write_propresponse(
        &mut self,
        path: &DavPath,
        props: HashMap<StatusCode, Vec<Element>>,
    ) -> DavResult<()> {
        self.emitter.write(XmlWEvent::start_element("D:response"))?;
        Element::new2("D:href")
            .text(path.with_prefix())
            .write_ev(&mut self.emitter)?;

        let mut keys = props.keys().collect::<Vec<_>>();
        keys.sort();
        for status in keys {
            self.emitter.write(XmlWEvent::start_element("D:propstat"))?;
            self.emitter.write(XmlWEvent::start_element("D:prop"))?;
            for e in &props[status] {
                e.write_ev(&mut self.emitter)?;
            }
            self.emitter.write(XmlWEvent::end_element())?;
            Element::new2("D:status")
                .text(format!("HTTP/1.1 {}", status))
                .write_ev(&mut self.emitter)?;
            if self.name == "propertyupdate" && *status == StatusCode::FORBIDDEN {
                // Refused live-property updates carry the RFC 4918
                // precondition element.
                let mut err = Element::new2("D:error");
                err.children.push(XMLNode::Element(Element::new2(
                    "D:cannot-modify-protected-property",
                )));
                err.write_ev(&mut self.emitter)?;
            }
            self.emitter.write(XmlWEvent::end_element())?;
        }

        self.emitter.write(XmlWEvent::end_element())?;
        Ok(())
    }

    fn finish(mut self) -> DavResult<Bytes> {
        self.emitter.write(XmlWEvent::end_element())?;
        Ok(self.emitter.into_inner().take())
    }
}

impl crate::DavHandler {
    fn lockdiscovery_for(&self, node: &NodeHandle) -> DavResult<Element> {
        let record = self.locks.get_lock_info(&node.id).map_err(DavError::Lock)?;
        let token = record
            .exclusive_token()
            .map(|t| t.to_string())
            .or_else(|| record.shared_tokens().iter().next().cloned());
        Ok(lockdiscovery_element(&record, token.as_deref(), true))
    }

    pub(crate) async fn handle_propfind(
        &self,
        req: &Request<()>,
        body: &Bytes,
    ) -> DavResult<Response<Body>> {
        let path = self.path(req);
        let node = self.repo.resolve(&path).await?;

        let depth = req
            .headers()
            .typed_get::<davheaders::Depth>()
            .unwrap_or(davheaders::Depth::Infinity);

        let mut root = None;
        if !body.is_empty() {
            let tree = Element::parse2(Cursor::new(body.to_vec()))?;
            if tree.name != "propfind" || tree.namespace.as_deref() != Some(NS_DAV_URI) {
                return Err(DavError::XmlParseError);
            }
            root = Some(tree);
        }

        let (name, props) = match root {
            None => ("allprop", Vec::new()),
            Some(mut elem) => match elem
                .take_elem("propname")
                .map(|_| ("propname", Vec::new()))
                .or_else(|| {
                    elem.take_elem("prop")
                        .map(|p| ("prop", p.elements().into_iter().cloned().collect()))
                })
                .or_else(|| elem.take_elem("allprop").map(|_| ("allprop", Vec::new())))
            {
                Some(t) => t,
                None => return Err(DavError::XmlParseError),
            },
        };

        debug!("propfind: type request: {}", name);

        let mut pw = PropWriter::new(name, props)?;
        let mut rpath = path.clone();
        if node.is_dir {
            rpath.add_slash();
        }
        pw.write_props(self, &rpath, &node).await?;

        if node.is_dir && depth != davheaders::Depth::Zero {
            self.propfind_collection(&mut pw, rpath, node, depth).await?;
        }

        let resp = Response::builder()
            .status(SC_MULTI_STATUS)
            .header("content-type", "application/xml; charset=utf-8")
            .header("cache-control", "no-store, no-cache, must-revalidate")
            .header("pragma", "no-cache")
            .body(Body::from(pw.finish()?))
            .map_err(|_| DavError::Status(StatusCode::INTERNAL_SERVER_ERROR))?;
        Ok(resp)
    }

    fn propfind_collection<'a>(
        &'a self,
        pw: &'a mut PropWriter,
        path: DavPath,
        node: NodeHandle,
        depth: davheaders::Depth,
    ) -> BoxFuture<'a, DavResult<()>> {
        async move {
            let children = match self.repo.children(&node.id).await {
                Ok(c) => c,
                Err(e) => {
                    // an unreadable collection is skipped, not fatal.
                    debug!("propfind: cannot list {}: {}", path, e);
                    return Ok(());
                }
            };
            for child in children {
                let mut cpath = path.clone();
                cpath.push_segment(&child.name);
                if child.is_dir {
                    cpath.add_slash();
                }
                pw.write_props(self, &cpath, &child).await?;
                if child.is_dir && depth == davheaders::Depth::Infinity {
                    self.propfind_collection(&mut *pw, cpath, child, depth).await?;
                }
            }
            Ok(())
        }
        .boxed()
    }

    // set/change a live property. CONTINUE means "not live, store it
    // as a dead property".
    fn liveprop_set(&self, prop: &Element) -> StatusCode {
        match prop.namespace.as_deref() {
            Some(NS_DAV_URI) => match prop.name.as_str() {
                "displayname" | "getcontentlanguage" => StatusCode::CONTINUE,
                _ => StatusCode::FORBIDDEN,
            },
            Some(NS_MS_URI) => match prop.name.as_str() {
                // Claim success so the Windows client keeps working;
                // the values themselves are not stored.
                "Win32CreationTime"
                | "Win32FileAttributes"
                | "Win32LastAccessTime"
                | "Win32LastModifiedTime" => StatusCode::OK,
                _ => StatusCode::FORBIDDEN,
            },
            _ => StatusCode::CONTINUE,
        }
    }

    fn liveprop_remove(&self, prop: &Element) -> StatusCode {
        match prop.namespace.as_deref() {
            Some(NS_DAV_URI) => match prop.name.as_str() {
                "displayname" | "getcontentlanguage" => StatusCode::OK,
                _ => StatusCode::FORBIDDEN,
            },
            Some(NS_MS_URI) => StatusCode::FORBIDDEN,
            _ => StatusCode::CONTINUE,
        }
    }

    pub(crate) async fn handle_proppatch(
        &self,
        req: &Request<()>,
        body: &Bytes,
    ) -> DavResult<Response<Body>> {
        let path = self.path(req);
        let node = self.repo.resolve(&path).await?;

        let mut lookup = LockLookup::new();
        self.check_locked_node(req, &node, &mut lookup).await?;

        let tree = Element::parse2(Cursor::new(body.to_vec()))?;
        if tree.name != "propertyupdate" {
            return Err(DavError::XmlParseError);
        }

        let mut set = Vec::new();
        let mut rem = Vec::new();
        let mut ret = Vec::new();

        for elem in tree.elements() {
            for n in elem
                .elements()
                .into_iter()
                .filter(|f| f.name == "prop")
                .flat_map(|f| f.elements())
            {
                match elem.name.as_str() {
                    "set" => match self.liveprop_set(n) {
                        StatusCode::CONTINUE => set.push(element_to_davprop_full(n)),
                        s => ret.push((s, element_to_davprop(n))),
                    },
                    "remove" => match self.liveprop_remove(n) {
                        StatusCode::CONTINUE => rem.push(element_to_davprop(n)),
                        s => ret.push((s, element_to_davprop(n))),
                    },
                    _ => {}
                }
            }
        }

        // any failure poisons the whole batch: everything else gets
        // 424 Failed Dependency and nothing is applied.
        if ret.iter().any(|(s, _)| s != &StatusCode::OK) {
            ret = ret
                .into_iter()
                .map(|(s, p)| {
                    if s == StatusCode::OK {
                        (SC_FAILED_DEPENDENCY, p)
                    } else {
                        (s, p)
                    }
                })
                .collect();
            ret.extend(
                set.into_iter()
                    .chain(rem)
                    .map(|p| (SC_FAILED_DEPENDENCY, p)),
            );
        } else if !set.is_empty() || !rem.is_empty() {
            let applied = self.repo.patch_props(&node.id, set, rem).await?;
            ret.extend(applied);
        }

        let mut hm: HashMap<StatusCode, Vec<Element>> = HashMap::new();
        for (code, prop) in ret {
            hm.entry(code).or_default().push(davprop_to_element(prop));
        }

        let mut pw = PropWriter::new("propertyupdate", Vec::new())?;
        let mut rpath = path.clone();
        if node.is_dir {
            rpath.add_slash();
        }
        pw.write_propresponse(&rpath, hm)?;

        let resp = Response::builder()
            .status(SC_MULTI_STATUS)
            .header("content-type", "application/xml; charset=utf-8")
            .body(Body::from(pw.finish()?))
            .map_err(|_| DavError::Status(StatusCode::INTERNAL_SERVER_ERROR))?;
        Ok(resp)
    }
}

fn element_to_davprop_full(elem: &Element) -> DavProp {
    let mut emitter = EventWriter::new(Cursor::new(Vec::new()));
    elem.write_ev(&mut emitter).ok();
    let xml = emitter.into_inner().into_inner();
    DavProp {
        name: elem.name.clone(),
        prefix: elem.prefix.clone(),
        namespace: elem.namespace.clone(),
        xml: Some(xml),
    }
}

fn element_to_davprop(elem: &Element) -> DavProp {
    DavProp {
        name: elem.name.clone(),
        prefix: elem.prefix.clone(),
        namespace: elem.namespace.clone(),
        xml: None,
    }
}

fn davprop_to_element(prop: DavProp) -> Element {
    if let Some(xml) = prop.xml {
        if let Ok(e) = Element::parse(Cursor::new(xml)) {
            return e;
        }
    }
    let mut elem = Element::new(&prop.name);
    elem.prefix = prop.prefix;
    elem.namespace = prop.namespace;
    elem
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_tables_carry_dav_namespace() {
        assert!(ALLPROP
            .iter()
            .all(|e| e.namespace.as_deref() == Some("DAV:")));
        assert!(PROPNAME.iter().any(|e| e.name == "lockdiscovery"));
    }

    #[test]
    fn davprop_roundtrip_without_xml() {
        let mut e = Element::new("author");
        e.namespace = Some("urn:example:".to_string());
        let p = element_to_davprop(&e);
        let back = davprop_to_element(p);
        assert_eq!(back.name, "author");
        assert_eq!(back.namespace.as_deref(), Some("urn:example:"));
    }
}
