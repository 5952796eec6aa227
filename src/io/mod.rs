//! Process, file, and wire-format boundaries of the crate.

pub mod invoker;
pub mod loop_state;
pub mod process;
pub mod taskfile;
pub mod work_list;
