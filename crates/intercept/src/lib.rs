//! TLS interception for the automation session
//!
//! Terminates inbound TLS per destination host with leaves minted on first
//! contact, signed by a root authority persisted on disk. Relays decrypted
//! bytes to the real upstream and tees the response direction into a frame
//! tap the retrieval orchestrator consumes.
//!
//! The root is an exclusive-write resource: deleting its files rotates it
//! lazily on the next mint, bumping a generation counter that invalidates
//! every cached leaf signed by the old root.

pub mod authority;
pub mod error;
pub mod relay;
pub mod tap;
pub mod tls;

pub use authority::{MintedLeaf, RootAuthority};
pub use error::{Error, Result};
pub use relay::Interceptor;
pub use tap::{StreamFrame, TapRegistry};
pub use tls::{LeafCache, tls_connector};
