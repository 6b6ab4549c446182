pub mod artifact;
pub mod balancer;
pub mod calibration;
pub mod cleaner;
pub mod commands;
pub mod config;
pub mod errors;
pub mod indicators;
pub mod learner;
pub mod metrics;
pub mod models;
pub mod snapshot;
pub mod splitter;
pub mod trainer;
