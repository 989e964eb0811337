use thiserror::Error;

#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("Invalid environment: {0}")]
    InvalidEnv(String),

    #[error("Invalid anchor worker config: min {min}, max {max}")]
    InvalidAnchorConfig { min: i64, max: i64 },

    #[error("Missing env layout for job {0}")]
    MissingLayout(String),

    #[error("No recorded hash for component {0}")]
    MissingHash(String),

    #[error("No launched task recorded for job {0}")]
    MissingTaskId(String),

    #[error("Unexpected stage {stage} for {job_type} job {id}")]
    UnexpectedStage {
        id: String,
        job_type: String,
        stage: String,
    },

    #[error("Deployment error: {0}")]
    Deployment(String),

    #[error("Repository error: {0}")]
    Repository(String),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ManagerError>;
