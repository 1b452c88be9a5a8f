pub mod assisted;
pub mod boot;
pub mod cleanup;
pub mod clock;
pub mod cmd;
pub mod config;
pub mod error;
pub mod hardware;
pub mod ignition;
pub mod installer;
pub mod node;
pub mod paths;
pub mod request;
pub mod steps;

pub use error::DeployError;
