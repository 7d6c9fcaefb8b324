#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions
)]

pub mod access;
pub mod cache;
pub mod checker;
pub mod client;
pub mod config;
pub mod descriptor;
pub mod download;
pub mod error;
pub mod session;
pub mod settings;
pub mod transfer;
pub mod utils;

pub use access::{with_cancel, StorageAccess};
pub use checker::{ConnectionResult, FailureCause, WarningReason};
pub use client::{Capabilities, FileEntry, ReadStream};
pub use descriptor::{ConnectionDescriptor, StorageType};
pub use error::{Result, StorageError};
pub use settings::AccessSettings;
pub use transfer::OutputStream;
