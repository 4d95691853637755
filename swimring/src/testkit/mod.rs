//! Helpers for running several nodes inside one process.

mod failure_config;
mod local_network;

#[rustfmt::skip]
pub use {
  failure_config::FailureConfig,
  failure_config::FailureConfigMap,
  local_network::LocalNetwork,
};
