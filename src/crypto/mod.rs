/// Cryptographic primitives: Ed25519 signing, X25519 key generation, and
/// BLAKE3 hashing/Merkle roots.
pub mod hashing;
pub mod signing;

pub use hashing::{content_hash, merkle_root};
pub use signing::{
    derive_public_key, generate_dh_keypair, generate_keypair, sign_data, verify_signature,
    SigningError,
};
