//! SSH authentication strategies using the Strategy pattern.
//!
//! This module provides a flexible authentication system for SSH connections
//! built from the decrypted secret of a shell profile:
//!
//! - **Password**: Username/password authentication
//! - **Key**: Public key authentication with an in-memory private key
//!
//! Strategies can be composed using [`AuthChain`] to try multiple methods in order.

mod chain;
mod key;
mod password;
mod traits;

pub use chain::AuthChain;
pub use key::KeyAuth;
pub use password::PasswordAuth;
pub use traits::AuthStrategy;
