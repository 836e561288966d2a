//! Lock lifecycle: tokens, records, timeouts, indirect coverage.
//!
//! A lock is persisted as a [`LockRecord`] keyed by node id in a
//! [`LockStore`]. Timeouts are wall-clock timestamps checked lazily on
//! access; the only active timers are the provisional-node deletion task
//! and the forced unlock on session teardown, both of which run through
//! the injected [`Scheduler`].

use std::collections::{BTreeSet, HashMap};
use std::error::Error;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use http::StatusCode;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};

use crate::davheaders::OPAQUE_LOCK_TOKEN;
use crate::repo::{DavRepository, NodeId, RepoError};

pub(crate) mod memstore;
pub(crate) mod scheduler;

pub use memstore::{LockStore, MemLockStore};
pub use scheduler::{ScheduledTask, Scheduler, TokioScheduler};

/// Maximum lifetime granted to any lock, infinite requests included.
pub const LOCK_TIMEOUT_CAP: Duration = Duration::from_secs(24 * 60 * 60);

/// How many parent links the indirect-lock walk will follow before
/// giving up. A well-formed tree never gets near this; a cyclic one
/// must not hang the request.
pub(crate) const ANCESTOR_WALK_CAP: usize = 128;

// '-', '_', '.' stay readable in tokens; everything else escapes.
const TOKEN_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.');

#[derive(Debug)]
pub enum LockError {
    /// Refresh or unlock addressed a node that holds no lock.
    NotLocked,
    /// The presented token does not match the stored lock.
    TokenMismatch,
    /// Creation of new shared locks is refused by policy.
    SharedNotSupported,
    /// The underlying store or repository refused to release the lock.
    UnableToRelease,
    /// Record mutation violated the exclusive-xor-shared invariant.
    ScopeConflict,
    /// Token did not parse as an `opaquelocktoken:` URI.
    InvalidToken,
    /// The persisted record failed to (de)serialize.
    Storage(String),
}

impl LockError {
    pub fn statuscode(&self) -> StatusCode {
        match self {
            LockError::NotLocked => StatusCode::BAD_REQUEST,
            LockError::TokenMismatch => StatusCode::PRECONDITION_FAILED,
            LockError::SharedNotSupported => StatusCode::PRECONDITION_FAILED,
            LockError::UnableToRelease => StatusCode::PRECONDITION_FAILED,
            LockError::ScopeConflict => StatusCode::PRECONDITION_FAILED,
            LockError::InvalidToken => StatusCode::BAD_REQUEST,
            LockError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LockError::NotLocked => write!(f, "node is not locked"),
            LockError::TokenMismatch => write!(f, "lock token does not match"),
            LockError::SharedNotSupported => write!(f, "shared lock creation not supported"),
            LockError::UnableToRelease => write!(f, "unable to release lock"),
            LockError::ScopeConflict => write!(f, "lock record scope conflict"),
            LockError::InvalidToken => write!(f, "invalid lock token"),
            LockError::Storage(e) => write!(f, "lock storage error: {}", e),
        }
    }
}

impl Error for LockError {}

pub type LockResult<T> = Result<T, LockError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockScope {
    Exclusive,
    Shared,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockDepth {
    Zero,
    Infinity,
}

/// One outstanding lock claim on a node. Exclusive XOR shared XOR
/// unlocked; the mutators enforce the invariant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRecord {
    exclusive_token: Option<String>,
    shared_tokens: BTreeSet<String>,
    pub scope: LockScope,
    pub depth: LockDepth,
    pub owner: String,
    #[serde(with = "epoch_millis")]
    pub expires: Option<SystemTime>,
}

impl Default for LockRecord {
    fn default() -> LockRecord {
        LockRecord {
            exclusive_token: None,
            shared_tokens: BTreeSet::new(),
            scope: LockScope::Exclusive,
            depth: LockDepth::Zero,
            owner: String::new(),
            expires: None,
        }
    }
}

impl LockRecord {
    /// A fresh, unlocked record for `owner` at the given depth.
    pub fn new(owner: impl Into<String>, depth: LockDepth) -> LockRecord {
        LockRecord {
            owner: owner.into(),
            depth,
            ..LockRecord::default()
        }
    }

    pub fn is_locked(&self) -> bool {
        self.exclusive_token.is_some() || !self.shared_tokens.is_empty()
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive_token.is_some()
    }

    pub fn is_shared(&self) -> bool {
        !self.shared_tokens.is_empty()
    }

    pub fn is_expired(&self) -> bool {
        match self.expires {
            None => false,
            Some(t) => SystemTime::now() >= t,
        }
    }

    pub fn exclusive_token(&self) -> Option<&str> {
        self.exclusive_token.as_deref()
    }

    pub fn shared_tokens(&self) -> &BTreeSet<String> {
        &self.shared_tokens
    }

    /// Remaining lifetime in whole seconds; `None` means infinite.
    pub fn remaining_timeout_seconds(&self) -> Option<u64> {
        self.expires.map(|t| {
            t.duration_since(SystemTime::now())
                .map(|d| d.as_secs())
                .unwrap_or(0)
        })
    }

    pub fn set_exclusive_token(&mut self, token: String) -> LockResult<()> {
        if !self.shared_tokens.is_empty() {
            return Err(LockError::ScopeConflict);
        }
        self.exclusive_token = Some(token);
        self.scope = LockScope::Exclusive;
        Ok(())
    }

    /// Add a token to the shared set. Idempotent.
    pub fn add_shared_token(&mut self, token: String) -> LockResult<()> {
        if self.exclusive_token.is_some() {
            return Err(LockError::ScopeConflict);
        }
        self.shared_tokens.insert(token);
        self.scope = LockScope::Shared;
        Ok(())
    }

}

mod epoch_millis {
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(t: &Option<SystemTime>, s: S) -> Result<S::Ok, S::Error> {
        t.map(|t| {
            t.duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0)
        })
        .serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<SystemTime>, D::Error> {
        let millis = Option::<u64>::deserialize(d)?;
        Ok(millis.map(|m| UNIX_EPOCH + Duration::from_millis(m)))
    }
}

/// Build the wire token for a (node, owner) pair. Deterministic, so the
/// pair can be recovered from the token alone.
pub fn make_lock_token(id: &NodeId, owner: &str) -> String {
    format!(
        "{}{}:{}",
        OPAQUE_LOCK_TOKEN,
        id.0,
        utf8_percent_encode(owner, TOKEN_ENCODE_SET)
    )
}

/// Inverse of [`make_lock_token`].
pub fn parse_lock_token(token: &str) -> LockResult<(NodeId, String)> {
    let rest = token
        .strip_prefix(OPAQUE_LOCK_TOKEN)
        .ok_or(LockError::InvalidToken)?;
    let (id, owner) = rest.split_once(':').ok_or(LockError::InvalidToken)?;
    if id.is_empty() {
        return Err(LockError::InvalidToken);
    }
    let owner = percent_decode_str(owner)
        .decode_utf8()
        .map_err(|_| LockError::InvalidToken)?;
    Ok((NodeId(id.to_string()), owner.into_owned()))
}

/// Identifies the client session a lock was issued under, for forced
/// cleanup when the session goes away.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(pub String);

pub struct LockManager {
    store: Arc<dyn LockStore>,
    scheduler: Arc<dyn Scheduler>,
    timeout_cap: Duration,
    // (owner, node) pairs registered for forced cleanup per session.
    sessions: Mutex<HashMap<SessionId, Vec<(String, NodeId)>>>,
}

impl fmt::Debug for LockManager {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("LockManager")
            .field("timeout_cap", &self.timeout_cap)
            .finish()
    }
}

impl LockManager {
    pub fn new(store: Arc<dyn LockStore>, scheduler: Arc<dyn Scheduler>) -> LockManager {
        LockManager {
            store,
            scheduler,
            timeout_cap: LOCK_TIMEOUT_CAP,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_timeout_cap(mut self, cap: Duration) -> LockManager {
        self.timeout_cap = cap;
        self
    }

    pub fn timeout_cap(&self) -> Duration {
        self.timeout_cap
    }

    fn load(&self, id: &NodeId) -> LockResult<Option<LockRecord>> {
        match self.store.get(id) {
            None => Ok(None),
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| LockError::Storage(e.to_string())),
        }
    }

    fn save(&self, id: &NodeId, record: &LockRecord) -> LockResult<()> {
        let json =
            serde_json::to_string(record).map_err(|e| LockError::Storage(e.to_string()))?;
        self.store.put(id, json);
        Ok(())
    }

    /// Persist a lock. `timeout` of `None` means the client asked for
    /// an infinite lock; anything at or above the cap, infinite
    /// included, is clamped to the cap and the (session, owner, node)
    /// triple is registered for forced cleanup on session teardown.
    pub fn lock(
        &self,
        id: &NodeId,
        mut record: LockRecord,
        timeout: Option<Duration>,
        session: &SessionId,
    ) -> LockResult<LockRecord> {
        let clamped = match timeout {
            Some(t) if t < self.timeout_cap => t,
            _ => {
                self.register_cleanup(session, &record.owner, id);
                self.timeout_cap
            }
        };
        record.expires = Some(SystemTime::now() + clamped);
        self.save(id, &record)?;
        Ok(record)
    }

    /// Reload an existing lock, re-clamp the timeout, re-persist.
    pub fn refresh(
        &self,
        id: &NodeId,
        timeout: Option<Duration>,
        session: &SessionId,
    ) -> LockResult<LockRecord> {
        let record = self.load(id)?.ok_or(LockError::NotLocked)?;
        if !record.is_locked() || record.is_expired() {
            return Err(LockError::NotLocked);
        }
        self.lock(id, record, timeout, session)
    }

    /// Drop the lock record for a node entirely.
    pub fn unlock(&self, id: &NodeId) -> LockResult<()> {
        self.store.remove(id);
        Ok(())
    }

    /// Remove one token from a shared lock; deleting the record when the
    /// set empties. Idempotent: an absent record or token is success.
    pub fn remove_shared_token(&self, id: &NodeId, token: &str) -> LockResult<()> {
        let mut record = match self.load(id)? {
            Some(r) => r,
            None => return Ok(()),
        };
        record.shared_tokens.remove(token);
        if record.shared_tokens.is_empty() && record.exclusive_token.is_none() {
            self.store.remove(id);
        } else {
            self.save(id, &record)?;
        }
        Ok(())
    }

    /// The lock record for a node. Never-null: no persisted state yields
    /// a default unlocked record, so callers can always ask `is_locked`.
    pub fn get_lock_info(&self, id: &NodeId) -> LockResult<LockRecord> {
        Ok(self.load(id)?.unwrap_or_default())
    }

    /// Walk ancestors looking for a live depth-infinity lock that covers
    /// `id` indirectly. Returns the holder node and its record, or `None`
    /// if nothing up the tree covers this node. Results are memoized in
    /// `lookup` for the duration of a request.
    pub async fn indirect_lock_info(
        &self,
        id: &NodeId,
        repo: &dyn DavRepository,
        lookup: &mut LockLookup,
    ) -> Result<Option<(NodeId, LockRecord)>, RepoError> {
        let mut current = id.clone();
        for _ in 0..ANCESTOR_WALK_CAP {
            let parent = match lookup.parents.get(&current) {
                Some(p) => p.clone(),
                None => {
                    let p = repo.parent_of(&current).await?;
                    lookup.parents.insert(current.clone(), p.clone());
                    p
                }
            };
            let parent = match parent {
                Some(p) => p,
                None => return Ok(None),
            };
            let record = match lookup.records.get(&parent) {
                Some(r) => r.clone(),
                None => {
                    let r = self.get_lock_info(&parent).unwrap_or_default();
                    lookup.records.insert(parent.clone(), r.clone());
                    r
                }
            };
            if record.is_locked() && !record.is_expired() && record.depth == LockDepth::Infinity
            {
                return Ok(Some((parent, record)));
            }
            current = parent;
        }
        warn!("indirect lock walk exceeded {} ancestors", ANCESTOR_WALK_CAP);
        Ok(None)
    }

    fn register_cleanup(&self, session: &SessionId, owner: &str, id: &NodeId) {
        let mut sessions = self.sessions.lock().unwrap();
        let entries = sessions.entry(session.clone()).or_default();
        let entry = (owner.to_string(), id.clone());
        if !entries.contains(&entry) {
            entries.push(entry);
        }
    }

    #[cfg(test)]
    fn registered_count(&self, session: &SessionId) -> usize {
        self.sessions
            .lock()
            .unwrap()
            .get(session)
            .map(|v| v.len())
            .unwrap_or(0)
    }

    /// Forced cleanup when a client session goes away: every lock the
    /// session registered is released, acting as the original owner,
    /// unless the node is gone, relocked by someone else, or checked out.
    pub async fn session_closed(&self, session: &SessionId, repo: &dyn DavRepository) {
        let entries = match self.sessions.lock().unwrap().remove(session) {
            Some(e) => e,
            None => return,
        };
        for (owner, id) in entries {
            if repo.node(&id).await.is_err() {
                continue;
            }
            let record = match self.get_lock_info(&id) {
                Ok(r) => r,
                Err(e) => {
                    warn!("session cleanup: cannot read lock on {}: {}", id, e);
                    continue;
                }
            };
            if !record.is_locked() || record.owner != owner {
                continue;
            }
            match repo.is_checked_out(&id).await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(_) => continue,
            }
            debug!("session {:?} closed, releasing lock on {} for {}", session, id, owner);
            if let Err(e) = self.unlock(&id) {
                warn!("session cleanup: unlock of {} failed: {}", id, e);
            }
        }
    }

    /// Schedule deletion of a provisional node created by LOCK. The task
    /// fires at lock timeout and deletes the node only if it still
    /// carries the no-content flag, i.e. no PUT arrived in time.
    pub fn schedule_provisional_delete(
        &self,
        id: NodeId,
        delay: Duration,
        repo: Arc<dyn DavRepository>,
    ) {
        self.scheduler.schedule_once(
            delay,
            Box::pin(async move {
                match repo.node(&id).await {
                    Ok(handle) if handle.no_content => {
                        debug!("deleting abandoned provisional node {}", id);
                        if let Err(e) = repo.remove(&id).await {
                            warn!("provisional delete of {} failed: {}", id, e);
                        }
                    }
                    _ => {}
                }
            }),
        );
    }
}

/// Request-scoped memoization for the indirect-lock ancestor walk.
#[derive(Debug, Default)]
pub struct LockLookup {
    parents: HashMap<NodeId, Option<NodeId>>,
    records: HashMap<NodeId, LockRecord>,
}

impl LockLookup {
    pub fn new() -> LockLookup {
        LockLookup::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopScheduler;
    impl Scheduler for NoopScheduler {
        fn schedule_once(&self, _delay: Duration, _task: ScheduledTask) {}
    }

    fn manager() -> LockManager {
        LockManager::new(Arc::new(MemLockStore::new()), Arc::new(NoopScheduler))
    }

    fn session() -> SessionId {
        SessionId("sess-1".to_string())
    }

    fn exclusive_record(owner: &str, id: &NodeId) -> LockRecord {
        let mut r = LockRecord {
            owner: owner.to_string(),
            depth: LockDepth::Infinity,
            ..LockRecord::default()
        };
        r.set_exclusive_token(make_lock_token(id, owner)).unwrap();
        r
    }

    #[test]
    fn token_round_trip() {
        let id = NodeId("4fc1a2b3".to_string());
        for owner in ["alice", "a b/c", "ünïcode", "x:y"] {
            let token = make_lock_token(&id, owner);
            assert!(token.starts_with(OPAQUE_LOCK_TOKEN));
            let (pid, powner) = parse_lock_token(&token).unwrap();
            assert_eq!(pid, id);
            assert_eq!(powner, owner);
        }
        assert!(parse_lock_token("urn:uuid:whatever").is_err());
        assert!(parse_lock_token("opaquelocktoken:noseparator").is_err());
    }

    #[test]
    fn new_record_starts_unlocked() {
        let r = LockRecord::new("alice", LockDepth::Infinity);
        assert!(!r.is_locked());
        assert_eq!(r.owner, "alice");
        assert_eq!(r.depth, LockDepth::Infinity);
        assert!(r.exclusive_token().is_none());
    }

    #[test]
    fn exclusive_xor_shared() {
        let id = NodeId("n1".to_string());
        let mut r = LockRecord::default();
        r.set_exclusive_token(make_lock_token(&id, "alice")).unwrap();
        assert!(matches!(
            r.add_shared_token("t".to_string()),
            Err(LockError::ScopeConflict)
        ));

        let mut r = LockRecord::default();
        r.add_shared_token("t1".to_string()).unwrap();
        r.add_shared_token("t1".to_string()).unwrap(); // idempotent
        assert_eq!(r.shared_tokens().len(), 1);
        assert!(matches!(
            r.set_exclusive_token("x".to_string()),
            Err(LockError::ScopeConflict)
        ));
    }

    #[test]
    fn timeout_clamp_and_registration() {
        let mgr = manager();
        let sess = session();
        let id = NodeId("n1".to_string());

        // Short timeout: stored as-is, no cleanup registration.
        let r = mgr
            .lock(&id, exclusive_record("alice", &id), Some(Duration::from_secs(60)), &sess)
            .unwrap();
        let remaining = r.remaining_timeout_seconds().unwrap();
        assert!(remaining >= 59 && remaining <= 60);
        assert_eq!(mgr.registered_count(&sess), 0);

        // Infinite: clamped to the cap, registered.
        let r = mgr
            .lock(&id, exclusive_record("alice", &id), None, &sess)
            .unwrap();
        let remaining = r.remaining_timeout_seconds().unwrap();
        let cap = LOCK_TIMEOUT_CAP.as_secs();
        assert!(remaining >= cap - 1 && remaining <= cap);
        assert_eq!(mgr.registered_count(&sess), 1);

        // At or above the cap: same treatment, idempotent registration.
        mgr.lock(
            &id,
            exclusive_record("alice", &id),
            Some(LOCK_TIMEOUT_CAP + Duration::from_secs(5)),
            &sess,
        )
        .unwrap();
        assert_eq!(mgr.registered_count(&sess), 1);
    }

    #[test]
    fn get_lock_info_never_null() {
        let mgr = manager();
        let r = mgr.get_lock_info(&NodeId("missing".to_string())).unwrap();
        assert!(!r.is_locked());
    }

    #[test]
    fn record_survives_json_round_trip() {
        let id = NodeId("n1".to_string());
        let mgr = manager();
        let stored = mgr
            .lock(
                &id,
                exclusive_record("alice", &id),
                Some(Duration::from_secs(600)),
                &session(),
            )
            .unwrap();
        let loaded = mgr.get_lock_info(&id).unwrap();
        assert_eq!(loaded.exclusive_token(), stored.exclusive_token());
        assert_eq!(loaded.owner, "alice");
        assert_eq!(loaded.depth, LockDepth::Infinity);
        assert!(!loaded.is_expired());
    }

    #[test]
    fn shared_token_removal_is_idempotent() {
        let mgr = manager();
        let sess = session();
        let id = NodeId("n1".to_string());
        let mut r = LockRecord {
            owner: "alice".to_string(),
            ..LockRecord::default()
        };
        r.add_shared_token("tok-1".to_string()).unwrap();
        mgr.lock(&id, r, Some(Duration::from_secs(60)), &sess).unwrap();

        mgr.remove_shared_token(&id, "tok-1").unwrap();
        assert!(!mgr.get_lock_info(&id).unwrap().is_locked());
        // Second removal: record already gone, still success.
        mgr.remove_shared_token(&id, "tok-1").unwrap();
    }

    #[test]
    fn refresh_requires_existing_lock() {
        let mgr = manager();
        let res = mgr.refresh(
            &NodeId("missing".to_string()),
            Some(Duration::from_secs(60)),
            &session(),
        );
        assert!(matches!(res, Err(LockError::NotLocked)));
    }

    #[tokio::test]
    async fn indirect_lock_found_on_infinity_ancestor() {
        use crate::repo::MemRepo;

        let repo = MemRepo::new();
        let root = repo.resolve(&crate::davpath::DavPath::new("/").unwrap()).await.unwrap();
        let dir = repo.create_collection(&root.id, "d").await.unwrap();
        let file = repo.create_file(&dir.id, "f.txt").await.unwrap();

        let mgr = manager();
        mgr.lock(
            &dir.id,
            exclusive_record("alice", &dir.id),
            Some(Duration::from_secs(600)),
            &session(),
        )
        .unwrap();

        let mut lookup = LockLookup::new();
        let found = mgr
            .indirect_lock_info(&file.id, repo.as_ref(), &mut lookup)
            .await
            .unwrap();
        let (holder, record) = found.unwrap();
        assert_eq!(holder, dir.id);
        assert_eq!(record.owner, "alice");

        // Depth-zero ancestor locks do not cover children.
        let mut r = exclusive_record("alice", &dir.id);
        r.depth = LockDepth::Zero;
        mgr.lock(&dir.id, r, Some(Duration::from_secs(600)), &session()).unwrap();
        let mut lookup = LockLookup::new();
        let found = mgr
            .indirect_lock_info(&file.id, repo.as_ref(), &mut lookup)
            .await
            .unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn session_close_releases_registered_locks() {
        use crate::repo::MemRepo;

        let repo = MemRepo::new();
        let root = repo.resolve(&crate::davpath::DavPath::new("/").unwrap()).await.unwrap();
        let file = repo.create_file(&root.id, "f.txt").await.unwrap();

        let mgr = manager();
        let sess = session();
        // Infinite timeout registers for cleanup.
        mgr.lock(&file.id, exclusive_record("alice", &file.id), None, &sess)
            .unwrap();
        assert!(mgr.get_lock_info(&file.id).unwrap().is_locked());

        mgr.session_closed(&sess, repo.as_ref()).await;
        assert!(!mgr.get_lock_info(&file.id).unwrap().is_locked());
    }

    #[tokio::test]
    async fn session_close_skips_checked_out_nodes() {
        use crate::repo::MemRepo;

        let repo = MemRepo::new();
        let root = repo.resolve(&crate::davpath::DavPath::new("/").unwrap()).await.unwrap();
        let file = repo.create_file(&root.id, "f.txt").await.unwrap();
        repo.set_checked_out(&file.id, true);

        let mgr = manager();
        let sess = session();
        mgr.lock(&file.id, exclusive_record("alice", &file.id), None, &sess)
            .unwrap();
        mgr.session_closed(&sess, repo.as_ref()).await;
        assert!(mgr.get_lock_info(&file.id).unwrap().is_locked());
    }
}
