pub mod backend;
pub mod command;
pub mod config;
pub mod job;
pub mod pipeline;
pub mod redacted;
pub mod result_error;
pub mod retention;
pub mod runner;
pub mod validate;

macro_rules! function_path {
    () => {
        concat!(module_path!(), "::", function_name!(), " ", file!(), ":", line!())
    };
}

pub(crate) use function_path;
