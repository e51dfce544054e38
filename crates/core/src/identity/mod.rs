//! Credential verification.
//!
//! The verifier holds an immutable [`IdentityDirectory`] snapshot behind an
//! `ArcSwap`; revocation and reload publish a new snapshot and never block
//! in-flight authentication. The nonce replay cache is the only mutable state.

mod replay;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Duration, Utc};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::IdentityConfig;
use crate::digest::{hmac_hex, hmac_matches, sha256_hex};
use crate::domain::identity::{
    AgentCredential, AgentId, AgentIdentity, RoleName, Scope, Sensitivity,
};
use crate::errors::AuthError;

use replay::ReplayGuard;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoleDefinition {
    pub scopes: BTreeSet<Scope>,
    pub clearance: Sensitivity,
    /// Admission limit; zero means unlimited.
    pub requests_per_minute: u32,
}

#[derive(Clone, Debug)]
pub struct AgentRecord {
    pub role: RoleName,
    pub secret: SecretString,
}

#[derive(Clone, Debug, Default)]
pub struct IdentityDirectory {
    agents: HashMap<AgentId, AgentRecord>,
    roles: HashMap<RoleName, RoleDefinition>,
    revoked: BTreeSet<AgentId>,
}

impl IdentityDirectory {
    pub fn new(
        agents: HashMap<AgentId, AgentRecord>,
        roles: HashMap<RoleName, RoleDefinition>,
        revoked: BTreeSet<AgentId>,
    ) -> Self {
        Self { agents, roles, revoked }
    }

    pub fn role(&self, role: &RoleName) -> Option<&RoleDefinition> {
        self.roles.get(role)
    }

    pub fn agent(&self, agent_id: &AgentId) -> Option<&AgentRecord> {
        self.agents.get(agent_id)
    }

    pub fn is_revoked(&self, agent_id: &AgentId) -> bool {
        self.revoked.contains(agent_id)
    }

    pub fn revoked(&self) -> &BTreeSet<AgentId> {
        &self.revoked
    }

    fn with_revoked(&self, agent_id: &AgentId) -> Self {
        let mut next = self.clone();
        next.revoked.insert(agent_id.clone());
        next
    }
}

pub struct IdentityVerifier {
    directory: ArcSwap<IdentityDirectory>,
    replay: ReplayGuard,
    max_lifetime: Duration,
    clock_skew: Duration,
}

impl IdentityVerifier {
    pub fn new(directory: IdentityDirectory, config: &IdentityConfig) -> Self {
        Self {
            directory: ArcSwap::from_pointee(directory),
            replay: ReplayGuard::default(),
            max_lifetime: Duration::seconds(
                i64::try_from(config.max_credential_lifetime_secs).unwrap_or(i64::MAX / 1000),
            ),
            clock_skew: Duration::seconds(
                i64::try_from(config.clock_skew_secs).unwrap_or_default(),
            ),
        }
    }

    pub fn authenticate(&self, credential: &AgentCredential) -> Result<AgentIdentity, AuthError> {
        self.authenticate_at(credential, Utc::now())
    }

    pub fn authenticate_at(
        &self,
        credential: &AgentCredential,
        now: DateTime<Utc>,
    ) -> Result<AgentIdentity, AuthError> {
        self.authenticate_in(&self.directory.load_full(), credential, now)
    }

    /// Authenticates against a directory snapshot the caller already holds,
    /// so role resolution matches a policy table read alongside it.
    pub fn authenticate_in(
        &self,
        directory: &IdentityDirectory,
        credential: &AgentCredential,
        now: DateTime<Utc>,
    ) -> Result<AgentIdentity, AuthError> {
        let Some(record) = directory.agent(&credential.agent_id) else {
            debug!(agent_id = %credential.agent_id, "credential presented for unknown agent");
            return Err(AuthError::InvalidCredential);
        };

        let material = credential_material(
            &credential.agent_id,
            credential.issued_at,
            credential.expires_at,
            &credential.nonce,
        );
        if !hmac_matches(
            record.secret.expose_secret().as_bytes(),
            material.as_bytes(),
            &credential.signature,
        ) {
            warn!(agent_id = %credential.agent_id, "credential signature mismatch");
            return Err(AuthError::InvalidCredential);
        }

        let lifetime = credential.expires_at - credential.issued_at;
        if lifetime <= Duration::zero() || lifetime > self.max_lifetime {
            return Err(AuthError::InvalidCredential);
        }
        if credential.issued_at > now + self.clock_skew {
            return Err(AuthError::InvalidCredential);
        }

        if directory.is_revoked(&credential.agent_id) {
            return Err(AuthError::RevokedAgent);
        }
        if now > credential.expires_at {
            return Err(AuthError::Expired);
        }

        let fresh = self.replay.register(
            &credential.agent_id,
            &credential.nonce,
            credential.expires_at,
            now,
        );
        if !fresh {
            warn!(agent_id = %credential.agent_id, "credential nonce replayed");
            return Err(AuthError::InvalidCredential);
        }

        let Some(role) = directory.role(&record.role) else {
            return Err(AuthError::InvalidCredential);
        };

        Ok(AgentIdentity::new(
            credential.agent_id.clone(),
            record.role.clone(),
            role.scopes.clone(),
            role.clearance,
            credential_ref(&credential.agent_id, &credential.nonce),
            credential.expires_at,
        ))
    }

    /// Adds the agent to the revocation list. Returns false when it was
    /// already revoked.
    pub fn revoke(&self, agent_id: &AgentId) -> bool {
        let previous = self.directory.rcu(|current| current.with_revoked(agent_id));
        !previous.is_revoked(agent_id)
    }

    /// Publishes a freshly compiled directory. Revocations already applied at
    /// runtime carry over.
    pub fn replace_directory(&self, directory: IdentityDirectory) {
        self.directory.rcu(|current| {
            let mut next = directory.clone();
            next.revoked.extend(current.revoked.iter().cloned());
            next
        });
    }

    pub fn snapshot(&self) -> Arc<IdentityDirectory> {
        self.directory.load_full()
    }
}

fn credential_material(
    agent_id: &AgentId,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    nonce: &str,
) -> String {
    format!("{}|{}|{}|{}", agent_id, issued_at.timestamp(), expires_at.timestamp(), nonce)
}

fn credential_ref(agent_id: &AgentId, nonce: &str) -> String {
    let fingerprint = sha256_hex(format!("{agent_id}:{nonce}").as_bytes());
    fingerprint[..16].to_owned()
}

/// Signs a credential for `agent_id`. Used by credential issuers and tests.
pub fn sign_credential(
    agent_id: &AgentId,
    secret: &str,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    nonce: impl Into<String>,
) -> AgentCredential {
    let nonce = nonce.into();
    let material = credential_material(agent_id, issued_at, expires_at, &nonce);
    AgentCredential {
        agent_id: agent_id.clone(),
        issued_at,
        expires_at,
        nonce,
        signature: hmac_hex(secret.as_bytes(), material.as_bytes()),
    }
}

/// Issues a credential valid from now for `lifetime`, with a random nonce.
pub fn issue_credential(agent_id: &AgentId, secret: &str, lifetime: Duration) -> AgentCredential {
    let issued_at = Utc::now();
    sign_credential(agent_id, secret, issued_at, issued_at + lifetime, Uuid::new_v4().to_string())
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeSet, HashMap};

    use chrono::{Duration, TimeZone, Utc};
    use secrecy::SecretString;

    use super::{
        issue_credential, sign_credential, AgentRecord, IdentityDirectory, IdentityVerifier,
        RoleDefinition,
    };
    use crate::config::IdentityConfig;
    use crate::domain::identity::{Action, AgentId, RoleName, Scope, Sensitivity};
    use crate::errors::AuthError;

    const SECRET: &str = "agent-101-shared-secret";

    fn directory() -> IdentityDirectory {
        let mut agents = HashMap::new();
        agents.insert(
            AgentId("agent-101".to_owned()),
            AgentRecord {
                role: RoleName("maintainer".to_owned()),
                secret: SecretString::from(SECRET.to_owned()),
            },
        );
        let mut roles = HashMap::new();
        roles.insert(
            RoleName("maintainer".to_owned()),
            RoleDefinition {
                scopes: BTreeSet::from([
                    Scope::Action(Action::Create),
                    Scope::Intent("repository_maintenance".to_owned()),
                ]),
                clearance: Sensitivity::Internal,
                requests_per_minute: 0,
            },
        );
        IdentityDirectory::new(agents, roles, BTreeSet::new())
    }

    fn verifier() -> IdentityVerifier {
        IdentityVerifier::new(
            directory(),
            &IdentityConfig { max_credential_lifetime_secs: 900, clock_skew_secs: 30 },
        )
    }

    fn agent() -> AgentId {
        AgentId("agent-101".to_owned())
    }

    #[test]
    fn valid_credential_resolves_role_scopes() {
        let verifier = verifier();
        let credential = issue_credential(&agent(), SECRET, Duration::minutes(5));

        let identity = verifier.authenticate(&credential).expect("authenticated");
        assert_eq!(identity.role(), &RoleName("maintainer".to_owned()));
        assert!(identity.permits_action(Action::Create));
        assert!(!identity.permits_action(Action::Update));
        assert_eq!(identity.clearance(), Sensitivity::Internal);
        assert_eq!(identity.credential_ref().len(), 16);
    }

    #[test]
    fn tampered_or_foreign_credentials_are_invalid() {
        let verifier = verifier();
        let mut credential = issue_credential(&agent(), SECRET, Duration::minutes(5));
        credential.expires_at += Duration::minutes(1);
        assert_eq!(verifier.authenticate(&credential), Err(AuthError::InvalidCredential));

        let forged = issue_credential(&agent(), "guessed-secret", Duration::minutes(5));
        assert_eq!(verifier.authenticate(&forged), Err(AuthError::InvalidCredential));

        let unknown =
            issue_credential(&AgentId("agent-404".to_owned()), SECRET, Duration::minutes(5));
        assert_eq!(verifier.authenticate(&unknown), Err(AuthError::InvalidCredential));
    }

    #[test]
    fn expiry_and_lifetime_bounds_are_enforced() {
        let verifier = verifier();
        let issued = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().expect("time");
        let credential =
            sign_credential(&agent(), SECRET, issued, issued + Duration::minutes(5), "n-1");

        assert_eq!(
            verifier.authenticate_at(&credential, issued + Duration::minutes(6)),
            Err(AuthError::Expired)
        );

        let too_long =
            sign_credential(&agent(), SECRET, issued, issued + Duration::hours(2), "n-2");
        assert_eq!(
            verifier.authenticate_at(&too_long, issued + Duration::minutes(1)),
            Err(AuthError::InvalidCredential)
        );

        let from_future =
            sign_credential(&agent(), SECRET, issued, issued + Duration::minutes(5), "n-3");
        assert_eq!(
            verifier.authenticate_at(&from_future, issued - Duration::minutes(2)),
            Err(AuthError::InvalidCredential)
        );
    }

    #[test]
    fn replayed_nonce_is_rejected() {
        let verifier = verifier();
        let credential = issue_credential(&agent(), SECRET, Duration::minutes(5));

        assert!(verifier.authenticate(&credential).is_ok());
        assert_eq!(verifier.authenticate(&credential), Err(AuthError::InvalidCredential));
    }

    #[test]
    fn revocation_applies_to_the_next_authentication() {
        let verifier = verifier();
        assert!(verifier.revoke(&agent()));
        assert!(!verifier.revoke(&agent()));

        let credential = issue_credential(&agent(), SECRET, Duration::minutes(5));
        assert_eq!(verifier.authenticate(&credential), Err(AuthError::RevokedAgent));

        verifier.replace_directory(directory());
        assert!(verifier.snapshot().is_revoked(&agent()));
    }
}
