//! Compiles the `[governance]` tables into the identity directory and policy
//! table. Any name that does not resolve fails the whole load.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use secrecy::ExposeSecret;
use thiserror::Error;

use crate::config::{GovernanceConfig, OverridesConfig, PolicyRuleConfig};
use crate::domain::backend::BackendId;
use crate::domain::identity::{
    Action, AgentId, RoleName, Scope, ScopeParseError, Sensitivity,
};
use crate::domain::request::Intent;
use crate::identity::{AgentRecord, IdentityDirectory, RoleDefinition};
use crate::policy::{
    AllowedField, EnterpriseOverrides, FieldTransform, Grant, PolicyTable, ResourcePattern,
};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum GovernanceError {
    #[error("role `{role}`: {source}")]
    InvalidRole { role: String, source: ScopeParseError },
    #[error("{context} references unknown role `{role}`")]
    UnknownRole { context: String, role: String },
    #[error("policy `{role}/{intent}` references unknown backend `{backend}`")]
    UnknownBackend { role: String, intent: String, backend: String },
    #[error("policy `{role}/{intent}`: {source}")]
    InvalidPolicy { role: String, intent: String, source: ScopeParseError },
    #[error("policy `{role}/{intent}` is declared more than once")]
    DuplicateGrant { role: String, intent: String },
    #[error("policy `{role}/{intent}` emits field `{field}` more than once")]
    DuplicateField { role: String, intent: String, field: String },
    #[error("policy `{role}/{intent}` grants no actions")]
    EmptyGrant { role: String, intent: String },
    #[error("agent `{0}` is declared more than once")]
    DuplicateAgent(String),
    #[error("agent `{0}` has an empty secret")]
    EmptySecret(String),
    #[error("revocation list references unknown agent `{0}`")]
    UnknownAgent(String),
    #[error("transform for field `{field}`: {reason}")]
    InvalidTransform { field: String, reason: String },
    #[error("invalid resource pattern `{0}`")]
    InvalidPattern(String),
}

/// Result of a successful compile, ready to publish into the verifier and
/// policy engine.
#[derive(Clone, Debug)]
pub struct CompiledGovernance {
    pub directory: IdentityDirectory,
    pub table: PolicyTable,
}

pub fn compile(
    config: &GovernanceConfig,
    backends: &[BackendId],
) -> Result<CompiledGovernance, GovernanceError> {
    let roles = compile_roles(config)?;
    let directory = compile_directory(config, &roles)?;
    let transforms = compile_transforms(config)?;
    let known_backends: BTreeSet<&BackendId> = backends.iter().collect();

    let mut grants = HashMap::new();
    for rule in &config.policies {
        let role = RoleName(rule.role.clone());
        if !roles.contains_key(&role) {
            return Err(GovernanceError::UnknownRole {
                context: format!("policy `{}/{}`", rule.role, rule.intent),
                role: rule.role.clone(),
            });
        }
        let grant = compile_grant(rule, &known_backends, &transforms)?;
        let key = (role, Intent(rule.intent.clone()));
        if grants.insert(key, grant).is_some() {
            return Err(GovernanceError::DuplicateGrant {
                role: rule.role.clone(),
                intent: rule.intent.clone(),
            });
        }
    }

    let overrides = compile_overrides(&config.overrides)?;
    Ok(CompiledGovernance { directory, table: PolicyTable::new(grants, overrides) })
}

fn compile_roles(
    config: &GovernanceConfig,
) -> Result<HashMap<RoleName, RoleDefinition>, GovernanceError> {
    let mut roles = HashMap::new();
    for (name, role) in &config.roles {
        let invalid = |source| GovernanceError::InvalidRole { role: name.clone(), source };
        let scopes = role
            .scopes
            .iter()
            .map(|scope| scope.parse::<Scope>())
            .collect::<Result<BTreeSet<_>, _>>()
            .map_err(invalid)?;
        let clearance = role.clearance.parse::<Sensitivity>().map_err(invalid)?;
        roles.insert(
            RoleName(name.clone()),
            RoleDefinition { scopes, clearance, requests_per_minute: role.requests_per_minute },
        );
    }
    Ok(roles)
}

fn compile_directory(
    config: &GovernanceConfig,
    roles: &HashMap<RoleName, RoleDefinition>,
) -> Result<IdentityDirectory, GovernanceError> {
    let mut agents = HashMap::new();
    for agent in &config.agents {
        let role = RoleName(agent.role.clone());
        if !roles.contains_key(&role) {
            return Err(GovernanceError::UnknownRole {
                context: format!("agent `{}`", agent.id),
                role: agent.role.clone(),
            });
        }
        if agent.secret.expose_secret().trim().is_empty() {
            return Err(GovernanceError::EmptySecret(agent.id.clone()));
        }
        let record = AgentRecord { role, secret: agent.secret.clone() };
        if agents.insert(AgentId(agent.id.clone()), record).is_some() {
            return Err(GovernanceError::DuplicateAgent(agent.id.clone()));
        }
    }

    let mut revoked = BTreeSet::new();
    for agent_id in &config.revoked_agents {
        let agent_id = AgentId(agent_id.clone());
        if !agents.contains_key(&agent_id) {
            return Err(GovernanceError::UnknownAgent(agent_id.0));
        }
        revoked.insert(agent_id);
    }

    Ok(IdentityDirectory::new(agents, roles.clone(), revoked))
}

fn compile_transforms(
    config: &GovernanceConfig,
) -> Result<BTreeMap<String, FieldTransform>, GovernanceError> {
    let granted: BTreeSet<&str> = config
        .policies
        .iter()
        .flat_map(|rule| rule.fields.iter().map(|field| field.field.as_str()))
        .collect();

    let mut transforms = BTreeMap::new();
    for (field, transform) in &config.transforms {
        if !granted.contains(field.as_str()) {
            return Err(GovernanceError::InvalidTransform {
                field: field.clone(),
                reason: "no policy grants this field".to_owned(),
            });
        }
        let normalized = transform.clone().normalized().map_err(|reason| {
            GovernanceError::InvalidTransform { field: field.clone(), reason }
        })?;
        transforms.insert(field.clone(), normalized);
    }
    Ok(transforms)
}

fn compile_grant(
    rule: &PolicyRuleConfig,
    backends: &BTreeSet<&BackendId>,
    transforms: &BTreeMap<String, FieldTransform>,
) -> Result<Grant, GovernanceError> {
    let invalid = |source| GovernanceError::InvalidPolicy {
        role: rule.role.clone(),
        intent: rule.intent.clone(),
        source,
    };

    let actions = rule
        .actions
        .iter()
        .map(|action| action.parse::<Action>())
        .collect::<Result<BTreeSet<_>, _>>()
        .map_err(invalid)?;
    if actions.is_empty() {
        return Err(GovernanceError::EmptyGrant {
            role: rule.role.clone(),
            intent: rule.intent.clone(),
        });
    }
    let classification = rule.classification.parse::<Sensitivity>().map_err(invalid)?;

    let mut output_names = BTreeSet::new();
    let mut fields = Vec::with_capacity(rule.fields.len());
    for field in &rule.fields {
        let source = BackendId(field.backend.clone());
        if !backends.contains(&source) {
            return Err(GovernanceError::UnknownBackend {
                role: rule.role.clone(),
                intent: rule.intent.clone(),
                backend: field.backend.clone(),
            });
        }
        let allowed = AllowedField {
            name: field.field.clone(),
            alias: field.alias.clone(),
            source,
            sensitivity: field.sensitivity.parse::<Sensitivity>().map_err(invalid)?,
            transform: transforms.get(&field.field).cloned(),
        };
        if !output_names.insert(allowed.output_name().to_owned()) {
            return Err(GovernanceError::DuplicateField {
                role: rule.role.clone(),
                intent: rule.intent.clone(),
                field: allowed.output_name().to_owned(),
            });
        }
        fields.push(allowed);
    }

    Ok(Grant { actions, fields, classification, ttl_secs: rule.ttl_secs })
}

fn compile_overrides(config: &OverridesConfig) -> Result<EnterpriseOverrides, GovernanceError> {
    let restricted_patterns = config
        .restricted_patterns
        .iter()
        .map(|pattern| {
            ResourcePattern::parse(pattern)
                .ok_or_else(|| GovernanceError::InvalidPattern(pattern.clone()))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(EnterpriseOverrides {
        blocked_resources: config.blocked_resources.iter().cloned().collect(),
        restricted_patterns,
        restricted_repositories: config
            .restricted_repositories
            .iter()
            .map(|(repository, agents)| {
                (repository.clone(), agents.iter().cloned().map(AgentId).collect())
            })
            .collect(),
    })
}
