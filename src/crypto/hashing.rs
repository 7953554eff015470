/// BLAKE3 content hashing and the Merkle root used for group state
/// fingerprints.
///
/// All hashes are 32 bytes. Domain prefixes keep leaf and interior node
/// hashes from colliding with each other or with raw content hashes.

/// Hash arbitrary bytes.
pub fn content_hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Merkle root over a list of leaf byte strings.
///
/// Leaves are hashed with a `b"L"` prefix, interior nodes with `b"N"`.
/// An odd node at the end of a level is carried up unchanged. An empty
/// input yields the hash of the empty leaf list, so the root is always
/// defined.
pub fn merkle_root(leaves: &[Vec<u8>]) -> [u8; 32] {
    if leaves.is_empty() {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"L");
        return *hasher.finalize().as_bytes();
    }

    let mut level: Vec<[u8; 32]> = leaves
        .iter()
        .map(|leaf| {
            let mut hasher = blake3::Hasher::new();
            hasher.update(b"L");
            hasher.update(leaf);
            *hasher.finalize().as_bytes()
        })
        .collect();

    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            if pair.len() == 2 {
                let mut hasher = blake3::Hasher::new();
                hasher.update(b"N");
                hasher.update(&pair[0]);
                hasher.update(&pair[1]);
                next.push(*hasher.finalize().as_bytes());
            } else {
                next.push(pair[0]);
            }
        }
        level = next;
    }

    level[0]
}
