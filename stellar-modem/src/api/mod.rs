pub mod client;

pub use client::{ApiClient, Credentials, GrpcConnector};
