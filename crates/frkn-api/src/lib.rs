//! FRKN API - Device Registration Backend Client
//!
//! Flow:
//! 1. Device registers with its machine id → opaque device token
//! 2. Token is stored in the credential store
//! 3. Token fetches the proxy server descriptors

mod client;
mod credentials;
mod device;
mod models;

pub use client::{ApiClient, ApiConfig, ApiError};
pub use credentials::{CredentialError, CredentialStore, Credentials, CREDENTIALS_FILE_NAME};
pub use device::{device_id, device_id_from, device_name};
pub use models::{ConfigResponse, RegisterRequest, RegisterResponse};
