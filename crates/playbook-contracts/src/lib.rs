//! Contract validation and policy evaluation.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │               ContractValidationService                  │
//! │                                                          │
//! │  contracts: fetch ─► compile/cache ─► normalize ─►       │
//! │             jsonschema ─► x-business-rule / x-smart-code │
//! │                                                          │
//! │  policies:  sla · quorum · segregation · approval · retry│
//! └──────────────────────────────────────────────────────────┘
//!                 │                          │
//!        ValidationResult             PolicyResult
//!                 └───────► ValidationMetrics ◄┘
//!                          (compliance score)
//! ```

pub mod error;
pub mod keywords;
pub mod metrics;
pub mod normalize;
pub mod policy;
pub mod result;
pub mod service;

pub use error::{CONTRACT_NOT_FOUND, ContractError, Result, SCHEMA_ERROR, VALIDATION_ERROR};
pub use keywords::{BusinessRuleFn, BusinessRuleRegistry};
pub use metrics::{ContractCheck, RunMetrics, ValidationMetrics};
pub use normalize::NormalizeOptions;
pub use policy::{
    ApprovalContext, Approver, ConflictCheck, PolicyKind, PolicyResult, PreviousStepUser,
    QuorumContext, RelationshipCheck, RetryContext, SegregationContext, Severity, SlaContext,
    Vote, VoteDecision,
};
pub use result::{ValidationIssue, ValidationPerformance, ValidationResult};
pub use service::{CompiledContract, ContractValidationService, INPUT_CONTRACT, OUTPUT_CONTRACT};
