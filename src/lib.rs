//! Tidegate - a dynamic edge router
//!
//! This library provides a reverse proxy whose routing table follows the
//! backends it discovers:
//! - Backends come from Docker containers and static configuration, each
//!   carrying labels that declare routers, middlewares and TLS settings
//! - Discovery events are debounced into a backend registry; every commit
//!   compiles a new routing table that is swapped in atomically
//! - Requests are matched on Host and path and balanced round-robin across
//!   healthy backends with pooled connections
//! - Certificates for TLS routes are obtained and renewed via ACME
//!   (HTTP-01 or TLS-ALPN-01) and persisted between restarts
//! - Requests are written to an access log off the request path

pub mod access_log;
pub mod acme;
pub mod admin;
pub mod certmanager;
pub mod certstore;
pub mod config;
pub mod docker;
pub mod error;
pub mod healthcheck;
pub mod labels;
pub mod loadbalancer;
pub mod pool;
pub mod provider;
pub mod proxy;
pub mod registry;
pub mod routing;
