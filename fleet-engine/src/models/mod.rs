pub mod host;
pub mod host_flag;

pub use host::{ApiMode, HostRecord, NewHost};
