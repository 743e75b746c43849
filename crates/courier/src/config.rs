//! Configuration for the messaging layer.
//!
//! Parsed from `courier.toml`; every scalar can be overridden with a
//! `COURIER_<SECTION>_<KEY>` environment variable.

mod loading;
mod types;
mod validation;


pub use types::{
    BrokerConfig, CourierConfig, NamespaceConfig, PollConfig, ServiceConfig,
    DEFAULT_EXCHANGE_PREFIX, DEFAULT_VHOST_PREFIX,
};
