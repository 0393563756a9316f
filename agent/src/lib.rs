//! Firmware Agent Library
//!
//! Core modules for the device-resident firmware update agent.

pub mod app;
pub mod errors;
pub mod filesys;
pub mod firmware;
pub mod http;
pub mod identity;
pub mod logs;
pub mod mqtt;
pub mod network;
pub mod storage;
pub mod update;
pub mod utils;
pub mod version;
