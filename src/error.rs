use thiserror::Error;

/// Every failure mode this crate's public surface can report.
#[derive(Debug, Clone, Error)]
pub enum VmmError {
    #[error("producer failed to create a physical allocation: {0}")]
    ProducerFailure(String),

    #[error("stage {stage_index} failed during setup: {message}")]
    StageSetupFailure { stage_index: usize, message: String },

    #[error("stage {stage_index} failed during teardown: {message}")]
    StageTeardownFailure { stage_index: usize, message: String },

    #[error("handle key {0:#x} is already registered with this cohort manager")]
    DuplicateHandle(u64),

    #[error("adapter stack is empty")]
    EmptyAdapterStack,

    #[error("pop() called without a matching push()")]
    UnknownAdapterPop,

    #[error("requested allocation size of zero bytes")]
    ZeroSizeAllocation,

    #[error("driver backend does not support this operation: {0}")]
    Unsupported(&'static str),
}
