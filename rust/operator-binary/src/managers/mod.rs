//! Capability managers. Each one wraps the imperative operations against a single
//! external system and never calls back into the event handlers.

pub mod auth;
pub mod database;
pub mod hive_metastore;
pub mod k8s;
pub mod kyuubi;
pub mod s3;
pub mod service;
pub mod tls;
