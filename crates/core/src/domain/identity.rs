use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub String);

impl AgentId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoleName(pub String);

impl fmt::Display for RoleName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ScopeParseError {
    #[error("scope `{0}` must be one of intent:<name>, action:<action>, visibility:<level>")]
    UnknownKind(String),
    #[error("unknown action `{0}`")]
    UnknownAction(String),
    #[error("unknown visibility `{0}`")]
    UnknownVisibility(String),
    #[error("unknown sensitivity `{0}`")]
    UnknownSensitivity(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Read,
    Create,
    Update,
    Delete,
    Assess,
    Recommend,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Assess => "assess",
            Self::Recommend => "recommend",
        }
    }
}

impl FromStr for Action {
    type Err = ScopeParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "read" => Ok(Self::Read),
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            "assess" => Ok(Self::Assess),
            "recommend" => Ok(Self::Recommend),
            _ => Err(ScopeParseError::UnknownAction(value.to_owned())),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Public,
    Internal,
    Private,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Internal => "internal",
            Self::Private => "private",
        }
    }
}

impl FromStr for Visibility {
    type Err = ScopeParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "public" => Ok(Self::Public),
            "internal" => Ok(Self::Internal),
            "private" => Ok(Self::Private),
            _ => Err(ScopeParseError::UnknownVisibility(value.to_owned())),
        }
    }
}

/// Field sensitivity, ordered from least to most sensitive. A role's clearance
/// is the highest sensitivity it may receive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sensitivity {
    Public,
    Internal,
    Confidential,
    Restricted,
}

impl Sensitivity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Internal => "internal",
            Self::Confidential => "confidential",
            Self::Restricted => "restricted",
        }
    }
}

impl FromStr for Sensitivity {
    type Err = ScopeParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "public" => Ok(Self::Public),
            "internal" => Ok(Self::Internal),
            "confidential" => Ok(Self::Confidential),
            "restricted" => Ok(Self::Restricted),
            _ => Err(ScopeParseError::UnknownSensitivity(value.to_owned())),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Scope {
    Intent(String),
    Action(Action),
    Visibility(Visibility),
}

impl FromStr for Scope {
    type Err = ScopeParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let Some((kind, target)) = value.trim().split_once(':') else {
            return Err(ScopeParseError::UnknownKind(value.to_owned()));
        };
        match kind {
            "intent" if !target.trim().is_empty() => Ok(Self::Intent(target.trim().to_owned())),
            "action" => Ok(Self::Action(target.parse()?)),
            "visibility" => Ok(Self::Visibility(target.parse()?)),
            _ => Err(ScopeParseError::UnknownKind(value.to_owned())),
        }
    }
}

impl TryFrom<String> for Scope {
    type Error = ScopeParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Scope> for String {
    fn from(value: Scope) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Intent(name) => write!(f, "intent:{name}"),
            Self::Action(action) => write!(f, "action:{}", action.as_str()),
            Self::Visibility(visibility) => write!(f, "visibility:{}", visibility.as_str()),
        }
    }
}

/// Signed, short-lived credential presented by an agent on every request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentCredential {
    pub agent_id: AgentId,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub issued_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub expires_at: DateTime<Utc>,
    pub nonce: String,
    pub signature: String,
}

/// Verified identity for the lifetime of one request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AgentIdentity {
    agent_id: AgentId,
    role: RoleName,
    scopes: BTreeSet<Scope>,
    clearance: Sensitivity,
    credential_ref: String,
    expires_at: DateTime<Utc>,
}

impl AgentIdentity {
    pub(crate) fn new(
        agent_id: AgentId,
        role: RoleName,
        scopes: BTreeSet<Scope>,
        clearance: Sensitivity,
        credential_ref: String,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self { agent_id, role, scopes, clearance, credential_ref, expires_at }
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    pub fn role(&self) -> &RoleName {
        &self.role
    }

    pub fn scopes(&self) -> &BTreeSet<Scope> {
        &self.scopes
    }

    pub fn clearance(&self) -> Sensitivity {
        self.clearance
    }

    pub fn credential_ref(&self) -> &str {
        &self.credential_ref
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn has_intent(&self, intent: &str) -> bool {
        self.scopes.contains(&Scope::Intent(intent.to_owned()))
    }

    pub fn permits_action(&self, action: Action) -> bool {
        self.scopes.contains(&Scope::Action(action))
    }

    pub fn permits_visibility(&self, visibility: Visibility) -> bool {
        self.scopes.contains(&Scope::Visibility(visibility))
    }
}

#[cfg(test)]
mod tests {
    use super::{Action, Scope, ScopeParseError, Sensitivity, Visibility};

    #[test]
    fn scopes_parse_from_prefixed_strings() {
        assert_eq!("action:create".parse::<Scope>(), Ok(Scope::Action(Action::Create)));
        assert_eq!("visibility:public".parse::<Scope>(), Ok(Scope::Visibility(Visibility::Public)));
        assert_eq!(
            "intent:loan_assessment".parse::<Scope>(),
            Ok(Scope::Intent("loan_assessment".to_owned()))
        );
    }

    #[test]
    fn unknown_scope_kinds_are_rejected() {
        assert!(matches!("admin:all".parse::<Scope>(), Err(ScopeParseError::UnknownKind(_))));
        assert!(matches!("intent:".parse::<Scope>(), Err(ScopeParseError::UnknownKind(_))));
        assert!(matches!(
            "action:launch".parse::<Scope>(),
            Err(ScopeParseError::UnknownAction(_))
        ));
    }

    #[test]
    fn scope_display_round_trips_through_serde() {
        let scope = Scope::Visibility(Visibility::Private);
        let json = serde_json::to_string(&scope).expect("serialize");
        assert_eq!(json, "\"visibility:private\"");
        let parsed: Scope = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed, scope);
    }

    #[test]
    fn sensitivity_orders_by_clearance() {
        assert!(Sensitivity::Public < Sensitivity::Internal);
        assert!(Sensitivity::Confidential < Sensitivity::Restricted);
        assert_eq!("Confidential".parse::<Sensitivity>(), Ok(Sensitivity::Confidential));
    }
}
