use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::identity::{Action, AgentCredential, Visibility};

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Intent(pub String);

impl Intent {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    DataSubject,
    Repository,
    File,
}

/// What the policy engine evaluates a request against.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub kind: ResourceKind,
    pub id: String,
    pub visibility: Visibility,
    pub action: Action,
    pub repository: Option<String>,
}

impl ResourceDescriptor {
    /// Repository the resource lives in, if any. A repository is its own container.
    pub fn containing_repository(&self) -> Option<&str> {
        match self.kind {
            ResourceKind::Repository => Some(self.id.as_str()),
            _ => self.repository.as_deref(),
        }
    }
}

/// Caller-supplied hints. `params` are subject parameters forwarded to backends
/// (for example `applicant_id`) and never influence the policy decision.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceHints {
    pub kind: ResourceKind,
    pub id: String,
    #[serde(default = "default_visibility")]
    pub visibility: Visibility,
    #[serde(default = "default_action")]
    pub action: Action,
    #[serde(default)]
    pub repository: Option<String>,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

fn default_visibility() -> Visibility {
    Visibility::Internal
}

fn default_action() -> Action {
    Action::Read
}

impl ResourceHints {
    pub fn descriptor(&self) -> ResourceDescriptor {
        ResourceDescriptor {
            kind: self.kind,
            id: self.id.clone(),
            visibility: self.visibility,
            action: self.action,
            repository: self.repository.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextRequest {
    pub credential: AgentCredential,
    pub intent: Intent,
    pub resource_hints: ResourceHints,
}

#[cfg(test)]
mod tests {
    use super::{ResourceHints, ResourceKind};
    use crate::domain::identity::{Action, Visibility};

    #[test]
    fn hints_default_to_internal_read() {
        let hints: ResourceHints = serde_json::from_str(
            r#"{"kind":"data_subject","id":"APP-001","params":{"applicant_id":"APP-001"}}"#,
        )
        .expect("hints");

        let descriptor = hints.descriptor();
        assert_eq!(descriptor.visibility, Visibility::Internal);
        assert_eq!(descriptor.action, Action::Read);
        assert_eq!(descriptor.containing_repository(), None);
        assert_eq!(hints.params.get("applicant_id").map(String::as_str), Some("APP-001"));
    }

    #[test]
    fn repository_is_its_own_container() {
        let hints = ResourceHints {
            kind: ResourceKind::Repository,
            id: "secure-repo".to_owned(),
            visibility: Visibility::Private,
            action: Action::Update,
            repository: None,
            params: Default::default(),
        };
        assert_eq!(hints.descriptor().containing_repository(), Some("secure-repo"));
    }
}
