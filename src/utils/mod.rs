pub mod build_info;
pub mod graceful_shutdown;
pub mod response;

pub use build_info::BuildInfo;
pub use graceful_shutdown::{GracefulShutdown, ShutdownHandle, ShutdownReason};
