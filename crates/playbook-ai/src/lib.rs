//! AI capabilities for the playbook engine.
//!
//! Two halves live here:
//!
//! ```text
//! ┌───────────────────────────────┐     ┌──────────────────────────────┐
//! │  AiBackend trait              │     │  InsightService              │
//! │  - process(AiRequest)         │     │  - confidence / anomalies    │
//! │      -> AiResponse            │     │  - risk / summaries          │
//! └───────────────────────────────┘     └──────────────────────────────┘
//!          │                │
//!          ▼                ▼
//!   AnthropicBackend   MockAiBackend
//! ```
//!
//! AI steps call a backend; the insight service is pure analysis over run and
//! step state and never calls a model.

pub mod anthropic;
pub mod backend;
pub mod error;
pub mod insight;

pub use anthropic::{AnthropicBackend, AnthropicConfig};
pub use backend::{
    AiBackend, AiRequest, AiResponse, AiUsage, MockAiBackend, SharedAiBackend, with_retry,
};
pub use error::{AiError, Result};
pub use insight::{Anomaly, AnomalyKind, InsightService, RiskAssessment};
