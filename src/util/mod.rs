pub mod hook;
pub mod log;
pub(crate) mod sync;
pub mod task;
