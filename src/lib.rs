//! Concurrent bulk downloader for station time-series data.
//!
//! A request window is split into fixed-length chunks, wildcarded selections
//! are expanded into per-station requests against the station service, and
//! the resulting work units are fanned out over a bounded worker pool. Each
//! fetched group is run through an ordered preprocessing pipeline and stored
//! once at a deterministic path; reruns skip finished artifacts.

pub mod app;
pub mod chunk;
pub mod config;
pub mod domain;
pub mod error;
pub mod expand;
pub mod fdsn;
pub mod output;
pub mod preprocess;
pub mod restrictions;
pub mod scheduler;
pub mod sink;
