use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::Serialize;

use crate::domain::backend::BackendId;
use crate::domain::identity::{Action, AgentId, RoleName, Sensitivity};
use crate::domain::request::{Intent, ResourceDescriptor};
use crate::policy::transform::FieldTransform;

/// A field a grant may release, with where it comes from and how it leaves.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AllowedField {
    pub name: String,
    pub alias: Option<String>,
    pub source: BackendId,
    pub sensitivity: Sensitivity,
    pub transform: Option<FieldTransform>,
}

impl AllowedField {
    pub fn output_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Grant {
    pub actions: BTreeSet<Action>,
    pub fields: Vec<AllowedField>,
    pub classification: Sensitivity,
    pub ttl_secs: u64,
}

/// File-style matcher: `*.key` (suffix), `tmp/*` (prefix) or an exact name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResourcePattern {
    Suffix(String),
    Prefix(String),
    Exact(String),
}

impl ResourcePattern {
    pub fn parse(pattern: &str) -> Option<Self> {
        let pattern = pattern.trim();
        if pattern.is_empty() || pattern == "*" {
            return None;
        }
        if let Some(suffix) = pattern.strip_prefix('*') {
            return Some(Self::Suffix(suffix.to_owned()));
        }
        if let Some(prefix) = pattern.strip_suffix('*') {
            return Some(Self::Prefix(prefix.to_owned()));
        }
        Some(Self::Exact(pattern.to_owned()))
    }

    pub fn matches(&self, resource_id: &str) -> bool {
        let file_name = resource_id.rsplit('/').next().unwrap_or(resource_id);
        match self {
            Self::Suffix(suffix) => resource_id.ends_with(suffix.as_str()),
            Self::Prefix(prefix) => resource_id.starts_with(prefix.as_str()),
            Self::Exact(name) => resource_id == name || file_name == name,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct EnterpriseOverrides {
    pub blocked_resources: BTreeSet<String>,
    pub restricted_patterns: Vec<ResourcePattern>,
    pub restricted_repositories: BTreeMap<String, BTreeSet<AgentId>>,
}

impl EnterpriseOverrides {
    pub fn restricts(&self, agent_id: &AgentId, resource: &ResourceDescriptor) -> bool {
        if self.blocked_resources.contains(&resource.id) {
            return true;
        }
        if self.restricted_patterns.iter().any(|pattern| pattern.matches(&resource.id)) {
            return true;
        }
        match resource.containing_repository() {
            Some(repository) => self
                .restricted_repositories
                .get(repository)
                .is_some_and(|allowed| !allowed.contains(agent_id)),
            None => false,
        }
    }
}

/// Compiled, immutable policy. Published as a whole through the engine's
/// snapshot swap.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PolicyTable {
    pub(crate) version: u64,
    grants: HashMap<(RoleName, Intent), Grant>,
    overrides: EnterpriseOverrides,
}

impl PolicyTable {
    pub fn new(grants: HashMap<(RoleName, Intent), Grant>, overrides: EnterpriseOverrides) -> Self {
        Self { version: 0, grants, overrides }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn grant(&self, role: &RoleName, intent: &Intent) -> Option<&Grant> {
        self.grants.get(&(role.clone(), intent.clone()))
    }

    pub fn overrides(&self) -> &EnterpriseOverrides {
        &self.overrides
    }

    pub fn grant_count(&self) -> usize {
        self.grants.len()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};

    use super::{EnterpriseOverrides, ResourcePattern};
    use crate::domain::identity::{Action, AgentId, Visibility};
    use crate::domain::request::{ResourceDescriptor, ResourceKind};

    fn file(id: &str, repository: &str) -> ResourceDescriptor {
        ResourceDescriptor {
            kind: ResourceKind::File,
            id: id.to_owned(),
            visibility: Visibility::Private,
            action: Action::Read,
            repository: Some(repository.to_owned()),
        }
    }

    #[test]
    fn patterns_match_suffix_prefix_and_file_name() {
        let key = ResourcePattern::parse("*.key").expect("pattern");
        let env = ResourcePattern::parse(".env").expect("pattern");
        let tmp = ResourcePattern::parse("tmp/*").expect("pattern");

        assert!(key.matches("deploy/server.key"));
        assert!(env.matches("config/.env"));
        assert!(!env.matches("config/.envrc"));
        assert!(tmp.matches("tmp/cache.bin"));
        assert_eq!(ResourcePattern::parse("*"), None);
    }

    #[test]
    fn restricted_repository_admits_only_its_allowlist() {
        let overrides = EnterpriseOverrides {
            blocked_resources: BTreeSet::new(),
            restricted_patterns: vec![ResourcePattern::Suffix(".pem".to_owned())],
            restricted_repositories: BTreeMap::from([(
                "secure-repo".to_owned(),
                BTreeSet::from([AgentId("agent-101".to_owned())]),
            )]),
        };

        let readme = file("README.md", "secure-repo");
        assert!(!overrides.restricts(&AgentId("agent-101".to_owned()), &readme));
        assert!(overrides.restricts(&AgentId("agent-102".to_owned()), &readme));
        assert!(overrides
            .restricts(&AgentId("agent-101".to_owned()), &file("certs/tls.pem", "public-repo")));
    }
}
