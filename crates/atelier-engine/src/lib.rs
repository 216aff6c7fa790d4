//! Gateway engine for atelier: admission-controlled outbound model calls
//! with multi-provider failover, plus the two bounded control loops that
//! wrap them (compliance-gated generation and self-healing repair).
//!
//! The engine is a library-style subsystem. Callers hand it requests and
//! collaborator-produced artifacts/diagnostics; it hands back classified
//! results and structured outcomes, never raw panics or stack traces.

pub mod llm;

pub use llm::{
    repair, run_with_compliance, AdmissionGate, CallFailure, CallRequest, CallResult,
    ComplianceOutcome, FailureKind, GateLimits, GenerationStep, Provider, ProviderRegistry,
    RepairOutcome, RequestExecutor, RetryPolicy, StepOutput, Usage,
};
