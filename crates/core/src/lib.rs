#![forbid(unsafe_code)]

mod backoff;
mod status;

pub use backoff::{BackoffPolicy, BackoffPolicyError};
pub use status::{EventLevel, EventLevelParseError, JobStatus, JobStatusParseError};

pub mod ids {
    pub const MAX_JOB_TYPE_LEN: usize = 64;
    pub const MAX_WORKER_ID_LEN: usize = 128;

    /// Caller-defined job category, stored trimmed and lower-cased.
    #[derive(Clone, Debug, PartialEq, Eq, Hash)]
    pub struct JobType(String);

    impl JobType {
        pub fn as_str(&self) -> &str {
            &self.0
        }

        pub fn into_string(self) -> String {
            self.0
        }

        pub fn try_new(value: impl AsRef<str>) -> Result<Self, JobTypeError> {
            let value = value.as_ref().trim().to_lowercase();
            if value.is_empty() {
                return Err(JobTypeError::Empty);
            }
            if value.len() > MAX_JOB_TYPE_LEN {
                return Err(JobTypeError::TooLong);
            }
            if value.chars().any(char::is_control) {
                return Err(JobTypeError::ContainsControl);
            }
            Ok(Self(value))
        }
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum JobTypeError {
        Empty,
        TooLong,
        ContainsControl,
    }

    impl JobTypeError {
        pub fn message(&self) -> &'static str {
            match self {
                Self::Empty => "job_type must not be empty",
                Self::TooLong => "job_type is too long",
                Self::ContainsControl => "job_type contains control characters",
            }
        }
    }

    /// Identity a worker presents when claiming and mutating jobs.
    #[derive(Clone, Debug, PartialEq, Eq, Hash)]
    pub struct WorkerId(String);

    impl WorkerId {
        pub fn as_str(&self) -> &str {
            &self.0
        }

        pub fn try_new(value: impl AsRef<str>) -> Result<Self, WorkerIdError> {
            let value = value.as_ref().trim();
            if value.is_empty() {
                return Err(WorkerIdError::Empty);
            }
            if value.len() > MAX_WORKER_ID_LEN {
                return Err(WorkerIdError::TooLong);
            }
            Ok(Self(value.to_string()))
        }
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum WorkerIdError {
        Empty,
        TooLong,
    }

    impl WorkerIdError {
        pub fn message(&self) -> &'static str {
            match self {
                Self::Empty => "worker_id must not be empty",
                Self::TooLong => "worker_id is too long",
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn job_type_is_trimmed_and_lowercased() {
            let job_type = JobType::try_new("  Export ").unwrap();
            assert_eq!(job_type.as_str(), "export");
        }

        #[test]
        fn job_type_validation() {
            assert_eq!(JobType::try_new("").unwrap_err(), JobTypeError::Empty);
            assert_eq!(JobType::try_new("   ").unwrap_err(), JobTypeError::Empty);
            assert_eq!(
                JobType::try_new("x".repeat(MAX_JOB_TYPE_LEN + 1)).unwrap_err(),
                JobTypeError::TooLong
            );
            assert_eq!(
                JobType::try_new("bad\u{0007}type").unwrap_err(),
                JobTypeError::ContainsControl
            );
        }

        #[test]
        fn worker_id_validation() {
            assert_eq!(WorkerId::try_new(" ").unwrap_err(), WorkerIdError::Empty);
            assert_eq!(
                WorkerId::try_new("w".repeat(MAX_WORKER_ID_LEN + 1)).unwrap_err(),
                WorkerIdError::TooLong
            );
            assert_eq!(WorkerId::try_new(" worker-a ").unwrap().as_str(), "worker-a");
        }
    }
}
