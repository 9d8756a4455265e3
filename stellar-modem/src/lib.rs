pub mod api;
pub mod backoff;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod modem;
pub mod monitor;
pub mod orchestrator;
pub mod scheduler;
pub mod stream;

pub use error::StreamError;
pub use lifecycle::{FnTask, Lifecycle, LifecycleTask};
pub use modem::Modem;
pub use stream::ResilientStream;
