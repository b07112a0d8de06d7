//! Data model for tunnelkeep tunnels.
//!
//! This crate holds the pure types shared by the tunnel manager: the immutable
//! tunnel identity, the derived tunnel state, the persisted cache record and the
//! identity fingerprint used as the on-disk cache key. Nothing here performs I/O.
//!
//! # Example
//!
//! ```
//! use tunnelkeep_model::{TunnelIdentity, hash};
//!
//! let identity = TunnelIdentity::new("i-0abc", "db1", "localhost", 19881);
//! let key = hash(&identity, "123456789012", "us-east-1");
//! assert_eq!(key.len(), 16);
//! ```

pub mod hash;
pub mod identity;
pub mod state;

pub use hash::{SCHEMA_VERSION, canonicalize, hash};
pub use identity::{BastionRef, ClusterRef, TunnelFrom, TunnelIdentity, TunnelInto, TunnelMechanism, TunnelVia};
pub use state::{CacheRecord, TunnelState, TunnelStatus};
