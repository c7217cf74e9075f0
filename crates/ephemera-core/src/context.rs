//! Shared handles for one logged-in device.

use std::sync::Arc;

use crate::{
    config::EkConfig,
    env::Environment,
    error::EkError,
    external::{DirectoryService, EkNotifier, IdentityProvider, MerkleOracle, TeamDirectory},
    keyer::{TeamKeyer, TeambotKeyer, UserKeyer},
    kv::KvStore,
    store::{BoxStorage, DeviceEkStorage},
    types::MerkleRoot,
};

/// External services an [`EkContext`] is wired to.
#[derive(Clone)]
pub struct Collaborators {
    /// Statement and box directory
    pub directory: Arc<dyn DirectoryService>,
    /// Server time source
    pub merkle: Arc<dyn MerkleOracle>,
    /// Team membership and PTKs
    pub teams: Arc<dyn TeamDirectory>,
    /// Local identity and key lookups
    pub identity: Arc<dyn IdentityProvider>,
    /// Outbound notifications
    pub notifier: Arc<dyn EkNotifier>,
}

/// Everything the statement protocol, keyers and stores need.
///
/// Built once per login and shared by `Arc`.
pub struct EkContext<E: Environment> {
    /// Clock and randomness
    pub env: E,
    /// Tuning
    pub config: EkConfig,
    /// Statement and box directory
    pub directory: Arc<dyn DirectoryService>,
    /// Server time source
    pub merkle: Arc<dyn MerkleOracle>,
    /// Team membership and PTKs
    pub teams: Arc<dyn TeamDirectory>,
    /// Local identity and key lookups
    pub identity: Arc<dyn IdentityProvider>,
    /// Outbound notifications
    pub notifier: Arc<dyn EkNotifier>,
    /// Local device keys
    pub device_ek_storage: DeviceEkStorage,
    /// User key boxes addressed to this device
    pub user_ek_storage: BoxStorage<UserKeyer>,
    /// Team key boxes addressed to this user
    pub team_ek_storage: BoxStorage<TeamKeyer>,
    /// Teambot key boxes addressed to this user (bots only)
    pub teambot_ek_storage: BoxStorage<TeambotKeyer>,
}

impl<E: Environment> EkContext<E> {
    /// Wire a context over `kv`.
    pub fn new(env: E, config: EkConfig, kv: Arc<dyn KvStore>, collaborators: Collaborators) -> Self {
        let Collaborators { directory, merkle, teams, identity, notifier } = collaborators;
        Self {
            env,
            config,
            directory,
            merkle,
            teams,
            identity,
            notifier,
            device_ek_storage: DeviceEkStorage::new(Arc::clone(&kv)),
            user_ek_storage: BoxStorage::new(UserKeyer, Arc::clone(&kv)),
            team_ek_storage: BoxStorage::new(TeamKeyer, Arc::clone(&kv)),
            teambot_ek_storage: BoxStorage::new(TeambotKeyer, kv),
        }
    }

    /// Current Merkle root.
    pub async fn merkle_root(&self) -> Result<MerkleRoot, EkError> {
        self.merkle.current_root().await
    }

    /// Drop every in-memory store index.
    pub fn clear_store_caches(&self) {
        self.device_ek_storage.clear_cache();
        self.user_ek_storage.clear_cache();
        self.team_ek_storage.clear_cache();
        self.teambot_ek_storage.clear_cache();
    }
}
