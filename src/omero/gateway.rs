use async_trait::async_trait;
use std::fmt;

use crate::error::Result;
use crate::models::DestinationType;

/// A live repository session opened for a specific user and group.
#[derive(Debug, Clone)]
pub struct OmeroSession {
    pub key: String,
    pub host: String,
    pub port: u16,
    pub user_name: String,
    pub group_name: String,
}

/// A reference to an imported repository object, e.g. `Image:151`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRef {
    pub class: String,
    pub id: i64,
}

impl ObjectRef {
    pub fn new(class: impl Into<String>, id: i64) -> Self {
        Self {
            class: class.into(),
            id,
        }
    }

    /// Parse an identifier line of the import CLI (`Image:12` or
    /// `Image:12,13` — multi-id lines yield the ids of the same class).
    pub fn parse_line(line: &str) -> Vec<ObjectRef> {
        let line = line.trim();
        let Some((class, ids)) = line.split_once(':') else {
            return Vec::new();
        };
        if !matches!(class, "Image" | "Plate" | "Fileset") {
            return Vec::new();
        }
        ids.split(',')
            .filter_map(|id| id.trim().parse::<i64>().ok())
            .map(|id| ObjectRef::new(class, id))
            .collect()
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.class, self.id)
    }
}

/// Operations the order pipeline needs from the repository.
#[async_trait]
pub trait OmeroGateway: Send + Sync {
    /// Resolve a login name to an experimenter id.
    async fn resolve_user(&self, user_name: &str) -> Result<Option<i64>>;

    /// Resolve a group name to a group id.
    async fn resolve_group(&self, group_name: &str) -> Result<Option<i64>>;

    /// Whether the user is a member of the group.
    async fn is_member(&self, user_name: &str, group_name: &str) -> Result<bool>;

    /// Whether the destination dataset/screen exists.
    async fn destination_exists(&self, destination: DestinationType, id: i64) -> Result<bool>;

    /// Open a session as `user_name` in `group_name`, sudo'd from the
    /// service's root credentials. `ttl_ms` bounds the session lifetime.
    async fn open_session(
        &self,
        user_name: &str,
        group_name: &str,
        ttl_ms: u64,
    ) -> Result<OmeroSession>;

    /// Close a session opened by [`open_session`](Self::open_session).
    async fn close_session(&self, session: &OmeroSession) -> Result<()>;

    /// Attach a map annotation to an imported object.
    async fn annotate(
        &self,
        session: &OmeroSession,
        object: &ObjectRef,
        namespace: &str,
        pairs: &[(String, String)],
    ) -> Result<()>;
}
