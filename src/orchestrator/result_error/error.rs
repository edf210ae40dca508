use crate::orchestrator::result_error::{AddFunctionName, AddMsg};
use itertools::Itertools;
use std::time::Duration;
use thiserror::Error;
use thiserror_ext::Construct;

#[derive(Error, Debug, Construct)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
    #[error(transparent)]
    SerdeYml(#[from] serde_yml::Error),
    #[error(transparent)]
    ParseInt(#[from] std::num::ParseIntError),
    #[error(transparent)]
    ValidationError(#[from] validator::ValidationErrors),
    #[error(transparent)]
    ThreadPoolBuildError(#[from] rayon::ThreadPoolBuildError),
    #[error("{} exited with {}: {}", program, describe_exit(code), stderr.trim())]
    ToolFailed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("{} did not finish within {}", program, humantime_serde::re::humantime::format_duration(*timeout))]
    ToolTimedOut { program: String, timeout: Duration },
    #[error("No source paths specified")]
    EmptySources,
    #[error("Unknown job {0:?}")]
    UnknownJob(String),
    #[error("{}:\n{}", msg, indent::indent_all_with("  ", error.to_string()))]
    WithMsg { msg: String, error: Box<Error> },
    #[error("{} failed:\n{}", fn_name, indent::indent_all_with("  ", error.to_string()))]
    WithFunctionName { error: Box<Error>, fn_name: String },
    #[error("{}", itertools::join(.0, "\n\n"))]
    LotsOfError(Vec<Error>),
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "no exit code (killed by signal)".to_string(),
    }
}

impl<S: Into<String>> AddFunctionName<S> for Error {
    fn add_fn_name(self, fn_name: S) -> Self {
        Error::WithFunctionName {
            error: Box::new(self),
            fn_name: fn_name.into(),
        }
    }
}

impl<S: Into<String>> AddMsg<S> for Error {
    fn add_msg(self, msg: S) -> Self {
        Self::WithMsg {
            msg: msg.into(),
            error: Box::new(self),
        }
    }
}

impl From<Vec<Error>> for Error {
    fn from(errors: Vec<Error>) -> Self {
        if errors.is_empty() {
            panic!("Should not create lots of errors when error is empty")
        }
        Self::LotsOfError(errors.into_iter().flat_map(|e| e.into_iter()).collect_vec())
    }
}

impl Error {
    pub fn into_iter(self) -> Box<dyn Iterator<Item = Error>> {
        match self {
            Error::LotsOfError(v) => Box::new(v.into_iter().flat_map(|e| e.into_iter())),
            e => Box::new(std::iter::once(e)),
        }
    }

    pub fn chain(self, other: Error) -> Error {
        Error::LotsOfError(self.into_iter().chain(other.into_iter()).collect_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_from_io_error() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let error = Error::from(io_error);

        match error {
            Error::Io(_) => (),
            _ => panic!("Expected Io error"),
        }
    }

    #[test]
    fn test_error_add_msg() {
        let error = Error::empty_sources().add_msg("Custom message");

        match error {
            Error::WithMsg { msg, .. } => assert_eq!(msg, "Custom message"),
            _ => panic!("Expected WithMsg error"),
        }
    }

    #[test]
    fn test_error_add_fn_name_display() {
        let error = Error::unknown_job("nightly").add_fn_name("run_backup");
        let error_str = error.to_string();

        assert!(error_str.starts_with("run_backup failed:"));
        assert!(error_str.contains("  Unknown job \"nightly\""));
    }

    #[test]
    fn test_tool_failed_display() {
        let error = Error::tool_failed("restic", Some(1), "Fatal: wrong password\n");
        assert_eq!(
            error.to_string(),
            "restic exited with exit code 1: Fatal: wrong password"
        );

        let error = Error::tool_failed("borg", None::<i32>, "");
        assert!(error.to_string().contains("killed by signal"));
    }

    #[test]
    fn test_tool_timed_out_display() {
        let error = Error::tool_timed_out("zfs", Duration::from_secs(90));
        assert_eq!(error.to_string(), "zfs did not finish within 1m 30s");
    }

    #[test]
    fn test_error_from_vec_flattens() {
        let nested = Error::empty_sources().chain(Error::unknown_job("a"));
        let combined = Error::from(vec![nested, Error::unknown_job("b")]);
        match combined {
            Error::LotsOfError(error_vec) => assert_eq!(error_vec.len(), 3),
            _ => panic!("Expected LotsOfError"),
        }
    }

    #[test]
    #[should_panic(expected = "Should not create lots of errors when error is empty")]
    fn test_error_from_empty_vec_panics() {
        let errors: Vec<Error> = vec![];
        let _error = Error::from(errors);
    }

    #[test]
    fn test_error_into_iter() {
        let error = Error::empty_sources();
        let mut iter = error.into_iter();

        assert!(iter.next().is_some());
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_lots_of_error_display_joins_messages() {
        let error = Error::tool_failed("zfs", Some(1), "send failed")
            .chain(Error::tool_failed("zfs", Some(2), "receive failed"));
        let error_str = error.to_string();
        assert!(error_str.contains("send failed\n\nzfs exited"));
        assert!(error_str.contains("receive failed"));
    }
}
