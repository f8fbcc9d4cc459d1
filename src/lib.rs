//! Species Identification Service
//!
//! This library provides the core functionality for the species-id system:
//! user-submitted photos are enqueued on a durable Redis-backed job queue and
//! drained by a bounded worker pool that classifies them with Cloudflare
//! Workers AI, stores the image in R2 and persists the identification record.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod queue;
pub mod routes;
pub mod services;
pub mod worker;
