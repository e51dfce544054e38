pub mod audit;
pub mod config;
pub mod digest;
pub mod domain;
pub mod errors;
pub mod gateway;
pub mod governance;
pub mod identity;
pub mod minimizer;
pub mod orchestrator;
pub mod policy;

pub use audit::{AuditError, AuditLog, AuditRecord, AuditSigner, AuditStore, InMemoryAuditStore};
pub use config::{AppConfig, ConfigError, ConfigOverrides, LoadOptions};
pub use domain::backend::{BackendId, BackendRequest, BackendResponse};
pub use domain::envelope::{ContextEnvelope, EnvelopeStatus, Rejection};
pub use domain::identity::{Action, AgentCredential, AgentId, AgentIdentity, RoleName, Scope};
pub use domain::request::{ContextRequest, Intent, ResourceHints, ResourceKind};
pub use errors::{AuthError, BackendError, GatewayError, IntegrityError, PolicyDenial};
pub use gateway::{Gateway, GatewayState};
pub use governance::{CompiledGovernance, GovernanceError};
pub use identity::{issue_credential, sign_credential, IdentityVerifier};
pub use orchestrator::{Backend, BackendCallError, BackendRegistry, StaticBackend};
pub use policy::{PolicyDecision, PolicyEngine};
