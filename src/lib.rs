//! # Conclave
//!
//! **A replicated, cryptographically authenticated group membership engine.**
//!
//! Conclave keeps a group's membership record consistent across replicas that
//! mutate it concurrently and exchange updates asynchronously. Every mutation
//! is a signed, self-describing [`group::GroupChange`] carried in a
//! content-addressed block DAG; replicas fold blocks deterministically, so any
//! two replicas that have seen the same blocks hold bit-identical state.
//!
//! - **Authenticated changes** — Ed25519 signatures over canonical bytes,
//!   verified against the membership state they transition
//! - **Sponsor authorization** — admins sponsor changes; seniority (who was
//!   granted status earliest) resolves concurrent conflicts
//! - **Deterministic merges** — divergent branches replay phase by phase from
//!   the founding change, on every replica, to the same result
//! - **Key lifecycle** — self-service signing/DH key rotation with burned
//!   historic keys, plus forward-secret DH rotation on member removal
//!
//! ## Quick Start
//!
//! ```rust
//! use std::collections::BTreeMap;
//! use conclave::dag::{MemoryBlockStore, MemoryMemberService};
//! use conclave::group::{GroupKeyService, GroupManager, MemoryKeyService};
//!
//! let mut keys = MemoryKeyService::new();
//! let key_id = keys.generate_signing_key().unwrap();
//! let dh_id = keys.generate_dh_key().unwrap();
//! let mut directory = MemoryMemberService::new();
//! directory.register(keys.signing_key(&key_id).unwrap());
//!
//! let mut manager = GroupManager::new(
//!     MemoryBlockStore::new(),
//!     keys,
//!     directory,
//!     key_id,
//!     dh_id,
//! );
//! let group_id = manager
//!     .create_group("ops", BTreeMap::new(), "alice", BTreeMap::new(), [0u8; 32])
//!     .unwrap();
//! assert_eq!(manager.group_info().group_id, group_id);
//! ```
//!
//! ## Architecture
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`crypto`] | Ed25519 signing, X25519 key generation, BLAKE3 hashing and Merkle roots |
//! | [`dag`] | Content-addressed blocks, DAG storage with heads and rounds, sync messages |
//! | [`group`] | Member records, snapshots, signed changes, key custody, reconciliation |

// ── Public modules ──────────────────────────────────────────────────────────

/// Cryptographic primitives: signing, key generation, hashing.
pub mod crypto;

/// Causal block DAG substrate and replica synchronization.
pub mod dag;

/// Group membership model and reconciliation engine.
pub mod group;

// ── Re-exports for convenience ──────────────────────────────────────────────

pub use dag::{Block, BlockId, BlockStore, BlockSyncMessage, MemberService, MemoryBlockStore};

pub use group::{
    GroupChange, GroupId, GroupInfo, GroupKeyService, GroupManager, GroupMemberInfo, KeyId,
    ManagerError, MemoryKeyService, Role,
};

// ── Library metadata ────────────────────────────────────────────────────────

/// Conclave library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Returns the library version string.
pub fn version() -> &'static str {
    VERSION
}

// ── Tests ───────────────────────────────────────────────────────────────────
