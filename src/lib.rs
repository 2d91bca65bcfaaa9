//! Discovery, manifest verification, and frecency ranking of installed web
//! payment apps.
//!
//! A payment request names payment methods. [`finder`] looks for installed
//! Android apps claiming them and verifies each claim through the method's
//! manifests ([`manifest`]). Apps from every factory ([`app`]) are ranked
//! by usage ([`ranking`]) and offered through a [`session`].

pub mod app;
pub mod cli;
pub mod config;
pub mod error;
pub mod finder;
pub mod manifest;
pub mod package;
pub mod ranking;
pub mod session;
pub mod settings;

pub use config::Config;
pub use error::{Error, Result};
