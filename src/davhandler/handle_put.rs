use bytes::Bytes;
use headers::HeaderMapExt;
use http::{Request, Response, StatusCode};

use crate::body::Body;
use crate::davheaders;
use crate::errors::DavError;
use crate::locks::LockLookup;
use crate::repo::RepoError;
use crate::DavResult;

impl crate::DavHandler {
    pub(crate) async fn handle_put(&self, req: &Request<()>, body: &Bytes) -> DavResult<Response<Body>> {
        let path = self.path(req);

        if path.is_collection() {
            return Err(DavError::Status(StatusCode::METHOD_NOT_ALLOWED));
        }

        // Partial PUT is not supported.
        if req.headers().contains_key("content-range") {
            return Err(DavError::Status(StatusCode::BAD_REQUEST));
        }

        let mut lookup = LockLookup::new();
        let existing = match self.repo.resolve(&path).await {
            Ok(node) => Some(node),
            Err(RepoError::NotFound) => None,
            Err(e) => return Err(e.into()),
        };

        let mut res = Response::new(Body::empty());

        let node = match existing {
            Some(node) => {
                if node.is_dir {
                    return Err(DavError::Status(StatusCode::METHOD_NOT_ALLOWED));
                }

                // HTTP preconditions against the current content.
                let etag = node.etag();
                if let Some(davheaders::IfMatch(list)) = req.headers().typed_get() {
                    if !list.matches(&etag) {
                        return Err(DavError::Status(StatusCode::PRECONDITION_FAILED));
                    }
                }
                if let Some(davheaders::IfNoneMatch(list)) = req.headers().typed_get() {
                    if list.matches(&etag) {
                        return Err(DavError::Status(StatusCode::PRECONDITION_FAILED));
                    }
                }

                self.check_locked_node(req, &node, &mut lookup).await?;

                // A LOCK-created placeholder getting its first content
                // still counts as resource creation for the client.
                if node.no_content {
                    *res.status_mut() = StatusCode::CREATED;
                } else {
                    *res.status_mut() = StatusCode::NO_CONTENT;
                }

                // Content hidden by a rename-shuffle becomes visible
                // again as soon as it gets fresh content.
                if node.hidden {
                    self.repo.set_hidden(&node.id, false).await?;
                }

                // Overwriting an empty placeholder must not burn a
                // version: the zero-byte state was never real content.
                if node.len == 0 {
                    self.repo.suppress_next_version(&node.id).await?;
                }

                node
            }
            None => {
                if let Some(davheaders::IfMatch(davheaders::ETagList::Star)) =
                    req.headers().typed_get()
                {
                    return Err(DavError::Status(StatusCode::PRECONDITION_FAILED));
                }

                let parent_path = path.parent();
                let parent = self
                    .repo
                    .resolve(&parent_path)
                    .await
                    .map_err(|_| DavError::Status(StatusCode::CONFLICT))?;
                if !parent.is_dir {
                    return Err(DavError::Status(StatusCode::CONFLICT));
                }

                // A depth-infinity lock on an ancestor covers creation
                // of new children.
                self.check_locked_node(req, &parent, &mut lookup).await?;

                let node = self.repo.create_file(&parent.id, path.file_name()).await?;
                *res.status_mut() = StatusCode::CREATED;
                node
            }
        };

        let was_placeholder = node.no_content;
        let created = res.status() == StatusCode::CREATED;
        match self.repo.write_content(&node.id, body.clone()).await {
            Ok(()) => {}
            Err(e) => {
                // Failed upload into a placeholder or a node we just
                // created: remove it rather than leave a zero-byte ghost.
                if created {
                    let _ = self.repo.remove(&node.id).await;
                }
                return Err(e.into());
            }
        }
        if was_placeholder {
            self.repo.set_no_content(&node.id, false).await?;
        }

        let updated = self.repo.node(&node.id).await?;
        res.headers_mut()
            .insert("etag", updated.etag().parse().unwrap());

        Ok(res)
    }
}
