//! `omero` CLI backed gateway.
//!
//! Identity and existence checks run HQL projections through `omero hql
//! --style plain`; sessions are opened with `omero sessions login --sudo`
//! from the service's root credentials and handed to the import CLI by key.
//! Root credentials come from `OMERO_HOST` / `OMERO_USER` /
//! `OMERO_PASSWORD` / `OMERO_PORT` at construction time.

use async_trait::async_trait;
use tracing::{debug, warn};
use uuid::Uuid;

use super::gateway::{ObjectRef, OmeroGateway, OmeroSession};
use crate::error::{AdiError, Result};
use crate::execution::CapturedCommand;
use crate::models::DestinationType;

const DEFAULT_PORT: u16 = 4064;

#[derive(Debug, Clone)]
pub struct OmeroCliGateway {
    host: String,
    port: u16,
    root_user: String,
    root_password: String,
}

impl OmeroCliGateway {
    /// Build from the `OMERO_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let host = required_env("OMERO_HOST")?;
        let root_user = required_env("OMERO_USER")?;
        let root_password = required_env("OMERO_PASSWORD")?;
        let port = match std::env::var("OMERO_PORT") {
            Ok(value) => value.parse::<u16>().map_err(|_| {
                AdiError::Configuration(format!("OMERO_PORT must be a port number, got '{value}'"))
            })?,
            Err(_) => DEFAULT_PORT,
        };

        Ok(Self {
            host,
            port,
            root_user,
            root_password,
        })
    }

    /// Run an HQL projection as the service account; returns the plain-style
    /// output rows.
    async fn hql(&self, query: &str) -> Result<Vec<String>> {
        let output = CapturedCommand::new("omero")
            .args(["hql", "--style", "plain", "-q"])
            .arg(query)
            .args(["-s", &self.host, "-p", &self.port.to_string()])
            .args(["-u", &self.root_user, "-w", &self.root_password])
            .run()
            .await?;

        if !output.success() {
            return Err(AdiError::Gateway(format!(
                "hql query failed (exit {:?}): {}",
                output.status_code,
                output.stderr.trim()
            )));
        }

        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Single scalar result of an HQL projection, if any. Plain-style rows
    /// are `index,value`.
    async fn hql_scalar(&self, query: &str) -> Result<Option<i64>> {
        let rows = self.hql(query).await?;
        Ok(rows
            .first()
            .and_then(|row| row.rsplit(',').next())
            .and_then(|field| field.trim().parse::<i64>().ok()))
    }

}

/// Connection arguments appended to a subcommand running inside an open
/// session.
fn session_args(session: &OmeroSession) -> [String; 6] {
    [
        "-s".to_string(),
        session.host.clone(),
        "-p".to_string(),
        session.port.to_string(),
        "-k".to_string(),
        session.key.clone(),
    ]
}

/// HQL string literals take single quotes; names containing one are not
/// valid OMERO logins and are rejected rather than escaped.
fn hql_literal(value: &str) -> Result<String> {
    if value.contains('\'') || value.contains('\\') {
        return Err(AdiError::Gateway(format!(
            "name '{value}' contains characters not allowed in identifiers"
        )));
    }
    Ok(format!("'{value}'"))
}

fn required_env(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| AdiError::Configuration(format!("{name} must be set in the environment")))
}

/// Find the first token that parses as a session uuid in the login output.
fn parse_session_key(stdout: &str) -> Option<String> {
    stdout
        .split_whitespace()
        .map(|token| token.trim_matches(|c: char| !c.is_ascii_alphanumeric() && c != '-'))
        .find(|token| Uuid::parse_str(token).is_ok())
        .map(str::to_string)
}

#[async_trait]
impl OmeroGateway for OmeroCliGateway {
    async fn resolve_user(&self, user_name: &str) -> Result<Option<i64>> {
        let literal = hql_literal(user_name)?;
        self.hql_scalar(&format!(
            "select e.id from Experimenter e where e.omeName = {literal}"
        ))
        .await
    }

    async fn resolve_group(&self, group_name: &str) -> Result<Option<i64>> {
        let literal = hql_literal(group_name)?;
        self.hql_scalar(&format!(
            "select g.id from ExperimenterGroup g where g.name = {literal}"
        ))
        .await
    }

    async fn is_member(&self, user_name: &str, group_name: &str) -> Result<bool> {
        let user = hql_literal(user_name)?;
        let group = hql_literal(group_name)?;
        let count = self
            .hql_scalar(&format!(
                "select count(m) from GroupExperimenterMap m \
                 where m.parent.name = {group} and m.child.omeName = {user}"
            ))
            .await?;
        Ok(count.unwrap_or(0) > 0)
    }

    async fn destination_exists(&self, destination: DestinationType, id: i64) -> Result<bool> {
        let query = match destination {
            DestinationType::Dataset => {
                format!("select d.id from Dataset d where d.id = {id}")
            }
            DestinationType::Screen => {
                format!("select s.id from Screen s where s.id = {id}")
            }
        };
        Ok(self.hql_scalar(&query).await?.is_some())
    }

    async fn open_session(
        &self,
        user_name: &str,
        group_name: &str,
        ttl_ms: u64,
    ) -> Result<OmeroSession> {
        // The sessions CLI takes its timeout in seconds.
        let ttl_secs = (ttl_ms / 1000).max(1).to_string();

        let output = CapturedCommand::new("omero")
            .args(["sessions", "login"])
            .args(["--sudo", &self.root_user])
            .args(["-u", user_name, "-g", group_name])
            .args(["-s", &self.host, "-p", &self.port.to_string()])
            .args(["-w", &self.root_password])
            .args(["--timeout", &ttl_secs])
            .run()
            .await?;

        if !output.success() {
            return Err(AdiError::Gateway(format!(
                "session login for user '{user_name}' in group '{group_name}' failed: {}",
                output.stderr.trim()
            )));
        }

        let key = parse_session_key(&output.stdout).ok_or_else(|| {
            AdiError::Gateway("session login produced no session key".to_string())
        })?;

        debug!(user = user_name, group = group_name, "session opened");
        Ok(OmeroSession {
            key,
            host: self.host.clone(),
            port: self.port,
            user_name: user_name.to_string(),
            group_name: group_name.to_string(),
        })
    }

    async fn close_session(&self, session: &OmeroSession) -> Result<()> {
        let output = CapturedCommand::new("omero")
            .args(["sessions", "logout"])
            .args(session_args(session))
            .run()
            .await?;
        if !output.success() {
            // The session expires on its own TTL; log and move on.
            warn!(
                user = %session.user_name,
                "session logout failed: {}",
                output.stderr.trim()
            );
        }
        Ok(())
    }

    async fn annotate(
        &self,
        session: &OmeroSession,
        object: &ObjectRef,
        namespace: &str,
        pairs: &[(String, String)],
    ) -> Result<()> {
        if pairs.is_empty() {
            return Ok(());
        }

        let created = CapturedCommand::new("omero")
            .args(["obj", "new", "MapAnnotation"])
            .arg(format!("ns={namespace}"))
            .args(session_args(session))
            .run()
            .await?;
        if !created.success() {
            return Err(AdiError::Gateway(format!(
                "creating map annotation failed: {}",
                created.stderr.trim()
            )));
        }
        let annotation = created
            .stdout_tail()
            .map(str::to_string)
            .ok_or_else(|| AdiError::Gateway("obj new produced no annotation id".to_string()))?;

        for (key, value) in pairs {
            let set = CapturedCommand::new("omero")
                .args(["obj", "map-set", &annotation, "mapValue", key, value])
                .args(session_args(session))
                .run()
                .await?;
            if !set.success() {
                return Err(AdiError::Gateway(format!(
                    "setting map value '{key}' failed: {}",
                    set.stderr.trim()
                )));
            }
        }

        let link_class = format!("{}AnnotationLink", object.class);
        let linked = CapturedCommand::new("omero")
            .args(["obj", "new", &link_class])
            .arg(format!("parent={object}"))
            .arg(format!("child={annotation}"))
            .args(session_args(session))
            .run()
            .await?;
        if !linked.success() {
            return Err(AdiError::Gateway(format!(
                "linking annotation to {object} failed: {}",
                linked.stderr.trim()
            )));
        }

        debug!(object = %object, pairs = pairs.len(), "annotations attached");
        Ok(())
    }
}
