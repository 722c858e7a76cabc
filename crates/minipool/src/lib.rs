//! Stakenode Minipool
//!
//! Reads minipool status from the chain, decides the next lifecycle action
//! from beacon-chain facts and submits it from the node account. A
//! [`MinipoolPipeline`] runs one duty: staking the node's own prelaunched
//! minipools, or reporting logouts and withdrawals for the whole network.

pub mod collaborators;
pub mod evaluator;
pub mod executor;
pub mod pipeline;
pub mod status;
pub mod testing;

pub use collaborators::{BeaconClient, ChainState, ContractCall, Registry, Transactor, ValidatorKeys};
pub use evaluator::{assess, evaluate, Assessment, EvaluationParams, SkipReason};
pub use executor::{ActionExecutor, ActionOutcome, ActionReceipt, ExecutionError, SubmissionLock};
pub use pipeline::{
    AggregationPolicy, Collaborators, CycleReport, Duty, EntityFailure, EntityOutcome, FailureStage,
    MinipoolPipeline, PipelineConfig, PipelineError,
};
pub use status::{AggregationError, FanOut, Partial, StatusAggregator};
