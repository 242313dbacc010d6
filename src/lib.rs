//! Broker profile management for a device-control backend.
//!
//! Stores named MQTT broker configurations, keeps at most one of them active
//! and at most one enabled, probes brokers within a hard deadline and
//! broadcasts the live connection status of the enabled profile.

pub mod activation;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod mqtt_service;
pub mod probe;
pub mod rest_server;
pub mod service_utils;
pub mod stats;
pub mod status;
pub mod store;
pub mod transport;
