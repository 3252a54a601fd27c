//! Node identity: key management and the [`PeerIdentity`]/address pair
//! consumed by every other component (spec.md §3).

mod keys;

pub use keys::{Address, IdentityKeys, PeerIdentity};
