/// Replicated group membership: identities, member records, snapshots, signed
/// change operations, key custody, and the reconciliation engine.
pub mod change;
pub mod ids;
pub mod info;
pub mod keys;
pub mod manager;
pub mod member;

pub use change::{ChangeError, GroupChange, SignatureWithKey};
pub use ids::{GroupId, KeyId, PublicKey, StateHash};
pub use info::{GroupInfo, EMPTY_EPOCH};
pub use keys::{GroupKeyService, KeyServiceError, MemoryKeyService};
pub use manager::{GroupManager, ManagerError};
pub use member::{GroupMemberInfo, HistoricKey, Role};
