//! # MarketMate tools
//!
//! Offline tooling for the MarketMate produce-freshness classifier. Converts a
//! trained ResNet18 checkpoint into an ONNX model with a dynamic batch axis,
//! and generates the spoken announcement clips the app plays for each result.
//!
//! ## Modules
//!
//! - [`model`]: ResNet18 network built with Burn
//! - [`checkpoint`]: Loading PyTorch and Burn checkpoints into the network
//! - [`onnx`]: ONNX protobuf messages, graph tracing and artifact I/O
//! - [`convert`]: The checkpoint-to-ONNX pipeline
//! - [`labels`]: Product and class label definitions
//! - [`announce`]: Announcement phrases and speech synthesis
//! - [`config`]: TOML configuration loading and validation
//! - [`error`]: Structured error types

#![recursion_limit = "256"]

pub mod announce;
pub mod checkpoint;
pub mod config;
pub mod convert;
pub mod error;
pub mod labels;
pub mod model;
pub mod onnx;
