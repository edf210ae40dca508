use crate::orchestrator::result_error::error::Error;
use crate::orchestrator::result_error::{AddFunctionName, AddMsg};

pub type Result<T> = std::result::Result<T, Error>;

impl<S: Into<String>, R> AddFunctionName<S> for Result<R> {
    fn add_fn_name(self, fn_name: S) -> Self {
        self.map_err(|e| e.add_fn_name(fn_name))
    }
}

impl<R, S: Into<String>> AddMsg<S> for Result<R> {
    fn add_msg(self, msg: S) -> Self {
        self.map_err(|e| e.add_msg(msg))
    }
}

pub fn convert_error_vec(errors: Vec<Error>) -> Result<()> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convert_error_vec_empty_is_ok() {
        assert!(convert_error_vec(vec![]).is_ok());
    }

    #[test]
    fn test_convert_error_vec_collects_errors() {
        let res = convert_error_vec(vec![Error::empty_sources(), Error::unknown_job("a")]);
        match res {
            Err(Error::LotsOfError(v)) => assert_eq!(v.len(), 2),
            _ => panic!("Expected LotsOfError"),
        }
    }

    #[test]
    fn test_result_add_msg_only_touches_err() {
        let ok: Result<u8> = Ok(1);
        assert_eq!(ok.add_msg("ignored").unwrap(), 1);

        let err: Result<u8> = Err(Error::empty_sources());
        let msg = err.add_msg("while starting job").unwrap_err().to_string();
        assert!(msg.starts_with("while starting job:"));
    }
}
