pub mod proto {
    tonic::include_proto!("stellarstation.api.v1");
}

pub mod logging;
pub mod pass;
pub mod types;

pub use pass::{Pass, PassError};
pub use types::{from_timestamp, to_timestamp, Framing};
