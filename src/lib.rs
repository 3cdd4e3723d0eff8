//! Clustergate - control plane for a dynamic reverse-proxy cluster
//!
//! Application-server nodes announce themselves, their virtual hosts and
//! their deployed applications over MCMP, the mod_cluster management
//! protocol. This library provides:
//! - A decoder and dispatcher for the MCMP verbs
//! - A versioned registry of balancers, nodes, hosts, contexts, session ids and domains
//! - Lock scopes that keep the registry consistent across processes
//! - DUMP and INFO snapshots in plain text or XML
//! - A hyper listener serving MCMP and a management page

pub mod app;
pub mod command;
pub mod config;
pub mod decoder;
pub mod error;
pub mod health;
pub mod lock;
pub mod node_config;
pub mod records;
pub mod registry;
pub mod report;
pub mod server;
pub mod stats;
pub mod status;
pub mod table;
pub mod version;
