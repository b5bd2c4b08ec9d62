#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]
#![deny(elided_lifetimes_in_paths, unreachable_pub)]
#![warn(
    missing_docs,
    clippy::doc_link_with_quotes,
    clippy::doc_markdown,
    clippy::missing_errors_doc
)]

pub mod batch;
mod config;
mod errors;
mod executor;
pub mod gate;
mod lease;
mod logging;
mod metrics;
mod monitor;
mod stats;

pub use self::{
    config::{PoolConfig, ServiceConfig, ServiceConfigBuilder, ServiceConfigError, TimeoutPolicy},
    errors::AdmissionError,
    executor::Pool,
    gate::{AdmissionGate, GateState, Permit},
    lease::Lease,
    logging::{
        LoggingConfig, LoggingDestination, LoggingError, LoggingFormat, LoggingLevel,
        LoggingSubscriberConfig,
    },
    monitor::Monitor,
    stats::PoolStats,
};
