use headers::HeaderMapExt;
use http::{Request, Response, StatusCode};
use regex::RegexSet;
use url::Url;

use crate::body::Body;
use crate::davheaders;
use crate::davpath::DavPath;
use crate::errors::DavError;
use crate::locks::LockLookup;
use crate::repo::{NodeHandle, RepoError};
use crate::util::DavMethod;
use crate::DavResult;

// Office clients save documents via a "rename shuffle": write the new
// content to a temp name, move the original away (or to a backup name),
// move the temp into place. Names matching these patterns are treated
// as the temporary/backup halves of such a shuffle.
const DEFAULT_SHUFFLE_PATTERNS: &[&str] = &[
    r"(?i)^.*\.tmp$",
    r"(?i)^.*\.wbk$",
    r"(?i)^.*\.bak$",
    r"^.*~$",
    r"(?i)^backup.*\.docx?m?$",
    r"^\..*",
    r"^[0-9a-fA-F]{8}$",
];

pub struct ShufflePatterns {
    set: RegexSet,
}

impl Default for ShufflePatterns {
    fn default() -> ShufflePatterns {
        ShufflePatterns {
            set: RegexSet::new(DEFAULT_SHUFFLE_PATTERNS).unwrap(),
        }
    }
}

impl ShufflePatterns {
    /// Build from custom patterns; invalid patterns fall back to the
    /// built-in set with a warning.
    pub fn from_patterns(patterns: &[String]) -> ShufflePatterns {
        match RegexSet::new(patterns) {
            Ok(set) => ShufflePatterns { set },
            Err(e) => {
                warn!("invalid shuffle patterns, using defaults: {}", e);
                ShufflePatterns::default()
            }
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        self.set.is_match(name)
    }
}

impl crate::DavHandler {
    // Parse the Destination header into a DavPath within our namespace.
    fn destination_path(&self, req: &Request<()>) -> DavResult<DavPath> {
        let dest = req
            .headers()
            .typed_get::<davheaders::Destination>()
            .ok_or(DavError::Status(StatusCode::BAD_REQUEST))?;

        let path = if let Ok(url) = Url::parse(&dest.0) {
            // Absolute URL: only same-host destinations are handled.
            let req_host = req
                .headers()
                .get("host")
                .and_then(|h| h.to_str().ok())
                .unwrap_or("");
            let dest_host = url.host_str().unwrap_or("");
            let dest_authority = match url.port() {
                Some(p) => format!("{}:{}", dest_host, p),
                None => dest_host.to_string(),
            };
            if !req_host.is_empty() && req_host != dest_authority && req_host != dest_host {
                return Err(DavError::Status(StatusCode::BAD_GATEWAY));
            }
            url.path().to_string()
        } else {
            dest.0.clone()
        };

        let uri = path
            .parse::<http::Uri>()
            .map_err(|_| DavError::Status(StatusCode::BAD_REQUEST))?;
        DavPath::from_uri_and_prefix(&uri, &self.prefix)
            .map_err(|_| DavError::Status(StatusCode::BAD_GATEWAY))
    }

    pub(crate) async fn handle_copymove(
        &self,
        req: &Request<()>,
        method: DavMethod,
    ) -> DavResult<Response<Body>> {
        let path = self.path(req);
        let dest = self.destination_path(req)?;

        if dest.as_str() == path.as_str() {
            return Err(DavError::Status(StatusCode::FORBIDDEN));
        }

        let overwrite = req
            .headers()
            .typed_get::<davheaders::Overwrite>()
            .map(|o| o.0)
            .unwrap_or(true);

        let source = self.repo.resolve(&path).await?;

        let mut lookup = LockLookup::new();
        if method == DavMethod::Move {
            self.check_locked_node(req, &source, &mut lookup).await?;
        }

        let dest_node = match self.repo.resolve(&dest).await {
            Ok(node) => Some(node),
            Err(RepoError::NotFound) => None,
            Err(e) => return Err(e.into()),
        };

        if let Some(d) = &dest_node {
            if !overwrite {
                return Err(DavError::Status(StatusCode::PRECONDITION_FAILED));
            }
            self.check_locked_node(req, d, &mut lookup).await?;
        }

        let dest_parent = self
            .repo
            .resolve(&dest.parent())
            .await
            .map_err(|_| DavError::Status(StatusCode::CONFLICT))?;
        if !dest_parent.is_dir {
            return Err(DavError::Status(StatusCode::CONFLICT));
        }
        self.check_locked_node(req, &dest_parent, &mut lookup).await?;

        let mut res = Response::new(Body::empty());
        *res.status_mut() = if dest_node.is_some() {
            StatusCode::NO_CONTENT
        } else {
            StatusCode::CREATED
        };

        if method == DavMethod::Copy {
            if let Some(d) = &dest_node {
                self.repo.remove(&d.id).await?;
            }
            self.repo
                .copy(&source.id, &dest_parent.id, dest.file_name())
                .await?;
            return Ok(res);
        }

        self.do_move(&path, &dest, source, dest_node, &dest_parent)
            .await?;
        Ok(res)
    }

    async fn do_move(
        &self,
        path: &DavPath,
        dest: &DavPath,
        source: NodeHandle,
        dest_node: Option<NodeHandle>,
        dest_parent: &NodeHandle,
    ) -> DavResult<()> {
        let src_shuffle = !source.is_dir && self.shuffle.matches(path.file_name());
        let dst_shuffle = !source.is_dir && self.shuffle.matches(dest.file_name());

        if dst_shuffle && !src_shuffle {
            // First half of a save shuffle: the real document is moved
            // out of the way to a temp/backup name. Copy the bytes to
            // the new name and merely hide the original, so that its
            // node identity and version history survive the shuffle.
            debug!("shuffle: hiding {} behind {}", path, dest);
            let content = self.repo.read_content(&source.id, None).await?;
            if let Some(d) = &dest_node {
                self.repo.remove(&d.id).await?;
            }
            let temp = self
                .repo
                .create_file(&dest_parent.id, dest.file_name())
                .await?;
            self.repo.suppress_next_version(&temp.id).await?;
            self.repo.write_content(&temp.id, content).await?;
            self.repo.set_hidden(&source.id, true).await?;
            return Ok(());
        }

        if src_shuffle && !dst_shuffle {
            if let Some(d) = dest_node {
                // Second half of the shuffle: the temp file moves onto
                // the (possibly hidden) original. Move the content into
                // the existing node so its history continues, and drop
                // the temp.
                debug!("shuffle: completing {} -> {}", path, dest);
                let content = self.repo.read_content(&source.id, None).await?;
                self.repo.write_content(&d.id, content).await?;
                if d.hidden {
                    self.repo.set_hidden(&d.id, false).await?;
                }
                self.repo.remove(&source.id).await?;
                if let Err(e) = self.locks.unlock(&source.id) {
                    warn!("move: releasing lock on {} failed: {}", source.id, e);
                }
                return Ok(());
            }
        }

        // Plain rename/move.
        if let Some(d) = dest_node {
            self.repo.remove(&d.id).await?;
        }
        self.repo
            .rename(&source.id, &dest_parent.id, dest.file_name())
            .await?;
        Ok(())
    }
}
