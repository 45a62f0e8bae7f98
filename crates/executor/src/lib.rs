pub mod deploy;
pub mod engine;

pub use deploy::{
    ContractVerification, DeploymentError, DeploymentManager, DeploymentPolicy, DeploymentRequest,
    DeploymentResult,
};
pub use engine::{ContractCall, ExecutionEngine, ExecutionError, ExecutionPolicy};
