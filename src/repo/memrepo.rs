//! Ephemeral in-memory repository.
//!
//! This implementation has state: create one instance with `MemRepo::new`
//! and clone the handle wherever it is needed (an instance is just an
//! `Arc`). Used by the test suite and useful for demos; not meant as a
//! production backend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use bytes::Bytes;
use futures_util::future;
use http::StatusCode;
use uuid::Uuid;

use crate::davpath::DavPath;
use crate::repo::{
    DavProp, DavRepository, NodeHandle, NodeId, RepoError, RepoFuture, RepoResult,
};

#[derive(Debug, Clone)]
pub struct MemRepo(Arc<Mutex<Inner>>);

#[derive(Debug)]
struct Inner {
    root: NodeId,
    nodes: HashMap<NodeId, Node>,
}

#[derive(Debug, Clone)]
struct Node {
    id: NodeId,
    parent: Option<NodeId>,
    name: String,
    is_dir: bool,
    content: Bytes,
    created: SystemTime,
    modified: SystemTime,
    hidden: bool,
    no_content: bool,
    version_suppressed: bool,
    checked_out: bool,
    versions: u32,
    children: Vec<NodeId>,
    props: HashMap<(Option<String>, String), DavProp>,
}

impl Node {
    fn new(parent: Option<NodeId>, name: &str, is_dir: bool) -> Node {
        let now = SystemTime::now();
        Node {
            id: NodeId(Uuid::new_v4().simple().to_string()),
            parent,
            name: name.to_string(),
            is_dir,
            content: Bytes::new(),
            created: now,
            modified: now,
            hidden: false,
            no_content: false,
            version_suppressed: false,
            checked_out: false,
            versions: 0,
            children: Vec::new(),
            props: HashMap::new(),
        }
    }

    fn handle(&self) -> NodeHandle {
        NodeHandle {
            id: self.id.clone(),
            name: self.name.clone(),
            is_dir: self.is_dir,
            len: self.content.len() as u64,
            created: self.created,
            modified: self.modified,
            hidden: self.hidden,
            no_content: self.no_content,
        }
    }
}

impl MemRepo {
    /// Create a new, empty in-memory repository.
    pub fn new() -> Arc<MemRepo> {
        let root = Node::new(None, "", true);
        let root_id = root.id.clone();
        let mut nodes = HashMap::new();
        nodes.insert(root_id.clone(), root);
        Arc::new(MemRepo(Arc::new(Mutex::new(Inner {
            root: root_id,
            nodes,
        }))))
    }

    /// Test helper: the number of versions written to a node.
    pub fn version_count(&self, id: &NodeId) -> u32 {
        let inner = self.0.lock().unwrap();
        inner.nodes.get(id).map(|n| n.versions).unwrap_or(0)
    }

    /// Test helper: flag a node as checked out.
    pub fn set_checked_out(&self, id: &NodeId, checked_out: bool) {
        let mut inner = self.0.lock().unwrap();
        if let Some(n) = inner.nodes.get_mut(id) {
            n.checked_out = checked_out;
        }
    }
}

impl Inner {
    fn get(&self, id: &NodeId) -> RepoResult<&Node> {
        self.nodes.get(id).ok_or(RepoError::NotFound)
    }

    fn get_mut(&mut self, id: &NodeId) -> RepoResult<&mut Node> {
        self.nodes.get_mut(id).ok_or(RepoError::NotFound)
    }

    fn lookup(&self, path: &DavPath) -> RepoResult<&Node> {
        let mut node = self.get(&self.root.clone())?;
        for seg in path.segments() {
            if !node.is_dir {
                return Err(RepoError::NotFound);
            }
            let next = node
                .children
                .iter()
                .find(|c| self.nodes.get(c).map(|n| n.name == seg).unwrap_or(false))
                .ok_or(RepoError::NotFound)?;
            node = self.get(next)?;
        }
        Ok(node)
    }

    fn child_by_name(&self, parent: &NodeId, name: &str) -> Option<NodeId> {
        let p = self.nodes.get(parent)?;
        p.children
            .iter()
            .find(|c| {
                self.nodes
                    .get(c)
                    .map(|n| n.name == name)
                    .unwrap_or(false)
            })
            .cloned()
    }

    fn create(&mut self, parent: &NodeId, name: &str, is_dir: bool) -> RepoResult<NodeHandle> {
        {
            let p = self.get(parent)?;
            if !p.is_dir {
                return Err(RepoError::Conflict);
            }
        }
        if self.child_by_name(parent, name).is_some() {
            return Err(RepoError::Exists);
        }
        let node = Node::new(Some(parent.clone()), name, is_dir);
        let id = node.id.clone();
        let handle = node.handle();
        self.nodes.insert(id.clone(), node);
        self.get_mut(parent)?.children.push(id);
        Ok(handle)
    }

    fn remove_recursive(&mut self, id: &NodeId) {
        if let Some(node) = self.nodes.remove(id) {
            for child in node.children {
                self.remove_recursive(&child);
            }
            if let Some(parent) = node.parent {
                if let Some(p) = self.nodes.get_mut(&parent) {
                    p.children.retain(|c| c != id);
                }
            }
        }
    }

    fn copy_recursive(
        &mut self,
        id: &NodeId,
        new_parent: &NodeId,
        new_name: &str,
    ) -> RepoResult<NodeHandle> {
        let src = self.get(id)?.clone();
        let mut copy = Node::new(Some(new_parent.clone()), new_name, src.is_dir);
        copy.content = src.content.clone();
        copy.props = src.props.clone();
        let copy_id = copy.id.clone();
        let handle = copy.handle();
        self.nodes.insert(copy_id.clone(), copy);
        self.get_mut(new_parent)?.children.push(copy_id.clone());
        for child in src.children {
            let child_name = self.get(&child)?.name.clone();
            self.copy_recursive(&child, &copy_id, &child_name)?;
        }
        Ok(handle)
    }

    // is `candidate` equal to or a descendant of `ancestor`?
    fn is_descendant(&self, ancestor: &NodeId, candidate: &NodeId) -> bool {
        let mut cur = Some(candidate.clone());
        while let Some(id) = cur {
            if &id == ancestor {
                return true;
            }
            cur = self.nodes.get(&id).and_then(|n| n.parent.clone());
        }
        false
    }
}

fn ready<'a, T: Send + 'a>(res: RepoResult<T>) -> RepoFuture<'a, T> {
    Box::pin(future::ready(res))
}

impl DavRepository for MemRepo {
    fn resolve<'a>(&'a self, path: &'a DavPath) -> RepoFuture<'a, NodeHandle> {
        let inner = self.0.lock().unwrap();
        ready(inner.lookup(path).map(|n| n.handle()))
    }

    fn node<'a>(&'a self, id: &'a NodeId) -> RepoFuture<'a, NodeHandle> {
        let inner = self.0.lock().unwrap();
        ready(inner.get(id).map(|n| n.handle()))
    }

    fn parent_of<'a>(&'a self, id: &'a NodeId) -> RepoFuture<'a, Option<NodeId>> {
        let inner = self.0.lock().unwrap();
        ready(inner.get(id).map(|n| n.parent.clone()))
    }

    fn children<'a>(&'a self, id: &'a NodeId) -> RepoFuture<'a, Vec<NodeHandle>> {
        let inner = self.0.lock().unwrap();
        let res = inner.get(id).map(|n| {
            n.children
                .iter()
                .filter_map(|c| inner.nodes.get(c))
                .filter(|n| !n.hidden)
                .map(|n| n.handle())
                .collect()
        });
        ready(res)
    }

    fn create_file<'a>(&'a self, parent: &'a NodeId, name: &'a str) -> RepoFuture<'a, NodeHandle> {
        let mut inner = self.0.lock().unwrap();
        ready(inner.create(parent, name, false))
    }

    fn create_collection<'a>(
        &'a self,
        parent: &'a NodeId,
        name: &'a str,
    ) -> RepoFuture<'a, NodeHandle> {
        let mut inner = self.0.lock().unwrap();
        ready(inner.create(parent, name, true))
    }

    fn remove<'a>(&'a self, id: &'a NodeId) -> RepoFuture<'a, ()> {
        let mut inner = self.0.lock().unwrap();
        let res = if inner.nodes.contains_key(id) {
            inner.remove_recursive(id);
            Ok(())
        } else {
            Err(RepoError::NotFound)
        };
        ready(res)
    }

    fn rename<'a>(
        &'a self,
        id: &'a NodeId,
        new_parent: &'a NodeId,
        new_name: &'a str,
    ) -> RepoFuture<'a, ()> {
        let mut inner = self.0.lock().unwrap();
        let res = (|| {
            if inner.is_descendant(id, new_parent) {
                return Err(RepoError::Conflict);
            }
            if !inner.get(new_parent)?.is_dir {
                return Err(RepoError::Conflict);
            }
            if let Some(existing) = inner.child_by_name(new_parent, new_name) {
                if &existing != id {
                    return Err(RepoError::Exists);
                }
            }
            let old_parent = inner.get(id)?.parent.clone().ok_or(RepoError::Conflict)?;
            inner.get_mut(&old_parent)?.children.retain(|c| c != id);
            inner.get_mut(new_parent)?.children.push(id.clone());
            let node = inner.get_mut(id)?;
            node.parent = Some(new_parent.clone());
            node.name = new_name.to_string();
            node.modified = SystemTime::now();
            Ok(())
        })();
        ready(res)
    }

    fn copy<'a>(
        &'a self,
        id: &'a NodeId,
        new_parent: &'a NodeId,
        new_name: &'a str,
    ) -> RepoFuture<'a, NodeHandle> {
        let mut inner = self.0.lock().unwrap();
        let res = (|| {
            if inner.is_descendant(id, new_parent) {
                return Err(RepoError::Conflict);
            }
            if !inner.get(new_parent)?.is_dir {
                return Err(RepoError::Conflict);
            }
            if inner.child_by_name(new_parent, new_name).is_some() {
                return Err(RepoError::Exists);
            }
            inner.copy_recursive(id, new_parent, new_name)
        })();
        ready(res)
    }

    fn read_content<'a>(
        &'a self,
        id: &'a NodeId,
        range: Option<(u64, u64)>,
    ) -> RepoFuture<'a, Bytes> {
        let inner = self.0.lock().unwrap();
        let res = inner.get(id).and_then(|n| {
            if n.is_dir {
                return Err(RepoError::Conflict);
            }
            match range {
                None => Ok(n.content.clone()),
                Some((start, end)) => {
                    let len = n.content.len() as u64;
                    if start >= len || end > len || start >= end {
                        return Err(RepoError::Conflict);
                    }
                    Ok(n.content.slice(start as usize..end as usize))
                }
            }
        });
        ready(res)
    }

    fn write_content<'a>(&'a self, id: &'a NodeId, data: Bytes) -> RepoFuture<'a, ()> {
        let mut inner = self.0.lock().unwrap();
        let res = inner.get_mut(id).map(|n| {
            n.content = data;
            n.modified = SystemTime::now();
            if n.version_suppressed {
                n.version_suppressed = false;
            } else {
                n.versions += 1;
            }
        });
        ready(res)
    }

    fn set_hidden<'a>(&'a self, id: &'a NodeId, hidden: bool) -> RepoFuture<'a, ()> {
        let mut inner = self.0.lock().unwrap();
        ready(inner.get_mut(id).map(|n| n.hidden = hidden))
    }

    fn set_no_content<'a>(&'a self, id: &'a NodeId, no_content: bool) -> RepoFuture<'a, ()> {
        let mut inner = self.0.lock().unwrap();
        ready(inner.get_mut(id).map(|n| n.no_content = no_content))
    }

    fn suppress_next_version<'a>(&'a self, id: &'a NodeId) -> RepoFuture<'a, ()> {
        let mut inner = self.0.lock().unwrap();
        ready(inner.get_mut(id).map(|n| n.version_suppressed = true))
    }

    fn is_checked_out<'a>(&'a self, id: &'a NodeId) -> RepoFuture<'a, bool> {
        let inner = self.0.lock().unwrap();
        ready(inner.get(id).map(|n| n.checked_out))
    }

    fn get_props<'a>(&'a self, id: &'a NodeId) -> RepoFuture<'a, Vec<DavProp>> {
        let inner = self.0.lock().unwrap();
        ready(inner.get(id).map(|n| n.props.values().cloned().collect()))
    }

    fn get_prop<'a>(&'a self, id: &'a NodeId, prop: DavProp) -> RepoFuture<'a, Vec<u8>> {
        let inner = self.0.lock().unwrap();
        let res = inner.get(id).and_then(|n| {
            n.props
                .get(&(prop.namespace.clone(), prop.name.clone()))
                .and_then(|p| p.xml.clone())
                .ok_or(RepoError::NotFound)
        });
        ready(res)
    }

    fn patch_props<'a>(
        &'a self,
        id: &'a NodeId,
        set: Vec<DavProp>,
        remove: Vec<DavProp>,
    ) -> RepoFuture<'a, Vec<(StatusCode, DavProp)>> {
        let mut inner = self.0.lock().unwrap();
        let res = inner.get_mut(id).map(|n| {
            let mut out = Vec::new();
            for p in set {
                let key = (p.namespace.clone(), p.name.clone());
                n.props.insert(key, p.clone());
                out.push((
                    StatusCode::OK,
                    DavProp {
                        xml: None,
                        ..p
                    },
                ));
            }
            for p in remove {
                let key = (p.namespace.clone(), p.name.clone());
                n.props.remove(&key);
                out.push((StatusCode::OK, p));
            }
            out
        });
        ready(res)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(s: &str) -> DavPath {
        DavPath::new(s).unwrap()
    }

    #[tokio::test]
    async fn create_resolve_remove() {
        let repo = MemRepo::new();
        let root = repo.resolve(&path("/")).await.unwrap();
        let dir = repo.create_collection(&root.id, "docs").await.unwrap();
        let file = repo.create_file(&dir.id, "a.txt").await.unwrap();
        repo.write_content(&file.id, Bytes::from_static(b"hello"))
            .await
            .unwrap();

        let found = repo.resolve(&path("/docs/a.txt")).await.unwrap();
        assert_eq!(found.id, file.id);
        assert_eq!(found.len, 5);

        repo.remove(&dir.id).await.unwrap();
        assert!(matches!(
            repo.resolve(&path("/docs/a.txt")).await,
            Err(RepoError::NotFound)
        ));
    }

    #[tokio::test]
    async fn rename_keeps_identity() {
        let repo = MemRepo::new();
        let root = repo.resolve(&path("/")).await.unwrap();
        let file = repo.create_file(&root.id, "x.txt").await.unwrap();
        repo.rename(&file.id, &root.id, "y.txt").await.unwrap();
        let found = repo.resolve(&path("/y.txt")).await.unwrap();
        assert_eq!(found.id, file.id);
    }

    #[tokio::test]
    async fn version_suppression_is_one_shot() {
        let repo = MemRepo::new();
        let root = repo.resolve(&path("/")).await.unwrap();
        let file = repo.create_file(&root.id, "v.txt").await.unwrap();
        repo.suppress_next_version(&file.id).await.unwrap();
        repo.write_content(&file.id, Bytes::from_static(b"one"))
            .await
            .unwrap();
        repo.write_content(&file.id, Bytes::from_static(b"two"))
            .await
            .unwrap();
        assert_eq!(repo.version_count(&file.id), 1);
    }

    #[tokio::test]
    async fn range_read() {
        let repo = MemRepo::new();
        let root = repo.resolve(&path("/")).await.unwrap();
        let file = repo.create_file(&root.id, "r.txt").await.unwrap();
        repo.write_content(&file.id, Bytes::from_static(b"0123456789"))
            .await
            .unwrap();
        let part = repo.read_content(&file.id, Some((2, 5))).await.unwrap();
        assert_eq!(&part[..], b"234");
    }
}
