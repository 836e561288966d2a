use http::{Request, Response, StatusCode};

use crate::body::Body;
use crate::davpath::DavPath;
use crate::errors::{DavError, SC_LOCKED};
use crate::locks::LockLookup;
use crate::multierror::MultiError;
use crate::repo::NodeId;
use crate::DavResult;

impl crate::DavHandler {
    pub(crate) async fn handle_delete(&self, req: &Request<()>) -> DavResult<Response<Body>> {
        let mut path = self.path(req);
        let node = self.repo.resolve(&path).await?;
        if node.is_dir {
            path.add_slash();
        }

        let mut lookup = LockLookup::new();
        self.check_locked_node(req, &node, &mut lookup).await?;

        // For a collection, every member with its own live lock must be
        // satisfiable too; failures are reported per-member in a 207.
        let mut errors = MultiError::new(path.clone());
        let mut visited: Vec<NodeId> = vec![node.id.clone()];
        if node.is_dir {
            self.check_members(req, &path, &node.id, &mut lookup, &mut errors, &mut visited)
                .await?;
        }
        if !errors.is_empty() {
            return errors.finalstatus(StatusCode::NO_CONTENT);
        }

        self.repo.remove(&node.id).await?;

        // Drop the lock records of everything that went away.
        for id in &visited {
            if let Err(e) = self.locks.unlock(id) {
                warn!("delete: releasing lock on {} failed: {}", id, e);
            }
        }

        errors.finalstatus(StatusCode::NO_CONTENT)
    }

    fn check_members<'a>(
        &'a self,
        req: &'a Request<()>,
        path: &'a DavPath,
        id: &'a NodeId,
        lookup: &'a mut LockLookup,
        errors: &'a mut MultiError,
        visited: &'a mut Vec<NodeId>,
    ) -> futures_util::future::BoxFuture<'a, DavResult<()>> {
        Box::pin(async move {
            for child in self.repo.children(id).await? {
                let mut cpath = path.clone();
                cpath.push_segment(&child.name);
                if child.is_dir {
                    cpath.add_slash();
                }
                visited.push(child.id.clone());
                if let Err(err) = self.check_locked_node(req, &child, lookup).await {
                    let status = match err {
                        DavError::Status(s) => s,
                        other => other.statuscode(),
                    };
                    if status == SC_LOCKED || status == StatusCode::PRECONDITION_FAILED {
                        errors.add_status(&cpath, status);
                        continue;
                    }
                    return Err(DavError::Status(status));
                }
                if child.is_dir {
                    self.check_members(req, &cpath, &child.id, lookup, errors, visited)
                        .await?;
                }
            }
            Ok(())
        })
    }
}
