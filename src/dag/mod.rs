/// Causal block DAG substrate: content-addressed blocks, storage with head
/// and round tracking, and replica synchronization messages.
pub mod block;
pub mod store;
pub mod sync;

pub use block::{Block, BlockId};
pub use store::{BlockStore, MemoryBlockStore, StoreError};
pub use sync::{BlockSyncMessage, MemberService, MemoryMemberService, SyncError};
