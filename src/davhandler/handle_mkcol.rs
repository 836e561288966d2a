use headers::HeaderMapExt;
use http::{Request, Response, StatusCode};

use crate::body::Body;
use crate::davheaders;
use crate::errors::DavError;
use crate::locks::LockLookup;
use crate::repo::RepoError;
use crate::DavResult;

impl crate::DavHandler {
    pub(crate) async fn handle_mkcol(&self, req: &Request<()>) -> DavResult<Response<Body>> {
        let mut path = self.path(req);

        if self.repo.resolve(&path).await.is_ok() {
            return Err(DavError::Status(StatusCode::METHOD_NOT_ALLOWED));
        }

        let parent = self
            .repo
            .resolve(&path.parent())
            .await
            .map_err(|_| DavError::Status(StatusCode::CONFLICT))?;
        if !parent.is_dir {
            return Err(DavError::Status(StatusCode::CONFLICT));
        }

        let mut lookup = LockLookup::new();
        self.check_locked_node(req, &parent, &mut lookup).await?;

        match self.repo.create_collection(&parent.id, path.file_name()).await {
            Ok(_) => {
                let mut res = Response::new(Body::empty());
                *res.status_mut() = StatusCode::CREATED;
                if !path.is_collection() {
                    // The new collection's canonical URL carries the
                    // trailing slash the request left off.
                    path.add_slash();
                    res.headers_mut()
                        .typed_insert(davheaders::ContentLocation(path.with_prefix()));
                }
                Ok(res)
            }
            Err(RepoError::Exists) => Err(DavError::Status(StatusCode::METHOD_NOT_ALLOWED)),
            Err(e) => Err(e.into()),
        }
    }
}
