use std::path::PathBuf;

use crate::publish::PublishStage;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },

    #[error("destination exists: {path:?}")]
    DestinationExists { path: PathBuf },

    #[error("no assets found in {path:?}")]
    NoAssets { path: PathBuf },

    #[error("{stage} stage failed ({}): {stderr}", describe_exit(.exit_code))]
    StageFailed {
        stage: PublishStage,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("walkdir error: {0}")]
    Walkdir(#[from] walkdir::Error),

    #[error("unsupported path (must be UTF-8): {path:?}")]
    NonUtf8Path { path: PathBuf },

    #[error("worker failed: {message}")]
    Worker { message: String },
}

pub(crate) fn describe_exit(exit_code: &Option<i32>) -> String {
    match exit_code {
        Some(code) => format!("exit code {code}"),
        None => "terminated by signal".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_failure_message_names_stage_and_exit_code() {
        let err = Error::StageFailed {
            stage: PublishStage::Publishing,
            exit_code: Some(128),
            stderr: "remote rejected".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "publishing stage failed (exit code 128): remote rejected"
        );

        let killed = Error::StageFailed {
            stage: PublishStage::Staging,
            exit_code: None,
            stderr: String::new(),
        };
        assert!(killed.to_string().contains("terminated by signal"));
    }
}
