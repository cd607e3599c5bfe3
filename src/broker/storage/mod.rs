//! Storage abstractions for connection profiles.
//!
//! The profile store talks to a [`ProfileStorage`] trait object so hosts can
//! swap the in-memory default for a persistent backend. Whatever the backend,
//! it only ever sees [`EncryptedSecret`](crate::broker::vault::EncryptedSecret)s.

mod profile;
mod traits;

pub use profile::DashMapProfileStorage;
pub use traits::ProfileStorage;
