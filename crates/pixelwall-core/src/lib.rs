//! Core types, config, errors, and wire protocol for PixelWall.

pub mod artwork;
pub mod auth;
pub mod config;
pub mod error;
pub mod protocol;
pub mod types;
