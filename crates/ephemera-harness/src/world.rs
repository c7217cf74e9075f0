//! Users, devices and teams shared by every simulated client.
//!
//! A [`SimWorld`] plays the part of the identity and team servers. Each
//! [`SimClient`] gets its own [`SimIdentity`] and [`SimTeams`] view with a
//! local cache of PUK and PTK public keys, so a rotation elsewhere is only
//! noticed after a forced reload, as on a real device.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::Arc,
};

use async_trait::async_trait;
use ephemera_core::{
    ActiveDevice, Collaborators, DeviceId, DeviceInfo, EkConfig, EkContext, EkError, EkLib,
    Environment, IdentityProvider, KvStore, LoginState, MemoryKv, TeamDirectory, TeamId, Uid,
};
use ephemera_crypto::{SigningKeyPair, VerifyingKey};
use parking_lot::Mutex;
use tracing::debug;

use crate::{RecordingNotifier, SimDirectory, SimEnv, SimMerkle};

struct DeviceState {
    signing_key: SigningKeyPair,
    revoked: bool,
}

struct UserState {
    puk: SigningKeyPair,
    devices: BTreeMap<DeviceId, DeviceState>,
}

struct TeamState {
    ptk: SigningKeyPair,
    members: BTreeSet<Uid>,
    bots: BTreeSet<Uid>,
}

#[derive(Default)]
struct WorldState {
    users: HashMap<Uid, UserState>,
    teams: HashMap<TeamId, TeamState>,
}

type SharedState = Arc<Mutex<WorldState>>;

fn unknown(what: impl std::fmt::Display) -> EkError {
    EkError::Directory(format!("unknown {what}"))
}

/// The shared server side of a simulation.
#[derive(Clone)]
pub struct SimWorld {
    env: SimEnv,
    directory: Arc<SimDirectory>,
    merkle: Arc<SimMerkle>,
    state: SharedState,
    config: EkConfig,
}

impl SimWorld {
    /// Empty world with randomness seeded by `seed`.
    ///
    /// Clients get [`EkConfig::default`] with a short retry backoff.
    pub fn new(seed: u64) -> Self {
        let env = SimEnv::with_seed(seed);
        let config = EkConfig {
            retry_backoff: std::time::Duration::from_millis(10),
            ..EkConfig::default()
        };
        Self {
            merkle: Arc::new(SimMerkle::new(env.clone())),
            env,
            directory: Arc::new(SimDirectory::new()),
            state: SharedState::default(),
            config,
        }
    }

    /// Use `config` for clients created from now on.
    #[must_use]
    pub fn with_config(mut self, config: EkConfig) -> Self {
        self.config = config;
        self
    }

    /// Shared environment.
    pub fn env(&self) -> &SimEnv {
        &self.env
    }

    /// Shared directory.
    pub fn directory(&self) -> &Arc<SimDirectory> {
        &self.directory
    }

    /// Shared Merkle oracle.
    pub fn merkle(&self) -> &Arc<SimMerkle> {
        &self.merkle
    }

    /// Configuration handed to new clients.
    pub fn config(&self) -> &EkConfig {
        &self.config
    }

    fn new_signing_key(&self) -> SigningKeyPair {
        SigningKeyPair::from_secret_bytes(self.env.random_array())
    }

    /// Register `uid` with a fresh PUK. Existing users are left alone.
    pub fn add_user(&self, uid: &str) -> Uid {
        let uid = Uid::new(uid);
        let puk = self.new_signing_key();
        self.state
            .lock()
            .users
            .entry(uid.clone())
            .or_insert_with(|| UserState { puk, devices: BTreeMap::new() });
        uid
    }

    /// Register `device` for `uid`, creating the user if needed.
    pub fn add_device(&self, uid: &Uid, device: &str) -> DeviceId {
        let device = DeviceId::new(device);
        let puk = self.new_signing_key();
        let signing_key = self.new_signing_key();

        let mut state = self.state.lock();
        let user = state
            .users
            .entry(uid.clone())
            .or_insert_with(|| UserState { puk, devices: BTreeMap::new() });
        user.devices
            .entry(device.clone())
            .or_insert(DeviceState { signing_key, revoked: false });
        device
    }

    /// Revoke `device`: it stops being an active device of `uid`.
    pub fn revoke_device(&self, uid: &Uid, device: &DeviceId) {
        if let Some(state) =
            self.state.lock().users.get_mut(uid).and_then(|u| u.devices.get_mut(device))
        {
            state.revoked = true;
        }
    }

    /// Replace `uid`'s PUK.
    pub fn rotate_puk(&self, uid: &Uid) {
        let puk = self.new_signing_key();
        if let Some(user) = self.state.lock().users.get_mut(uid) {
            user.puk = puk;
            debug!(%uid, "rotated PUK");
        }
    }

    /// Create `team` with a fresh PTK and `members`.
    pub fn add_team(&self, team: &str, members: &[&Uid]) -> TeamId {
        let team = TeamId::new(team);
        let ptk = self.new_signing_key();
        self.state.lock().teams.insert(
            team.clone(),
            TeamState {
                ptk,
                members: members.iter().map(|uid| (*uid).clone()).collect(),
                bots: BTreeSet::new(),
            },
        );
        team
    }

    /// Add a full member to `team`.
    pub fn add_member(&self, team: &TeamId, uid: &Uid) {
        if let Some(state) = self.state.lock().teams.get_mut(team) {
            state.members.insert(uid.clone());
        }
    }

    /// Remove `uid` from `team` in every role.
    pub fn remove_member(&self, team: &TeamId, uid: &Uid) {
        if let Some(state) = self.state.lock().teams.get_mut(team) {
            state.members.remove(uid);
            state.bots.remove(uid);
        }
    }

    /// Add `bot` to `team` as a restricted bot member.
    pub fn add_bot(&self, team: &TeamId, bot: &Uid) {
        if let Some(state) = self.state.lock().teams.get_mut(team) {
            state.bots.insert(bot.clone());
        }
    }

    /// Replace `team`'s PTK.
    pub fn rotate_ptk(&self, team: &TeamId) {
        let ptk = self.new_signing_key();
        if let Some(state) = self.state.lock().teams.get_mut(team) {
            state.ptk = ptk;
            debug!(%team, "rotated PTK");
        }
    }

    /// Client for `uid` on `device` with in-memory storage.
    pub fn client(&self, uid: &Uid, device: &str) -> SimClient {
        self.client_with_kv(uid, device, Arc::new(MemoryKv::new()))
    }

    /// Client for `uid` on `device` persisting to `kv`.
    ///
    /// Two clients over the same `kv` model a restart of one device.
    pub fn client_with_kv(&self, uid: &Uid, device: &str, kv: Arc<dyn KvStore>) -> SimClient {
        let device = self.add_device(uid, device);
        let identity = Arc::new(SimIdentity {
            state: Arc::clone(&self.state),
            uid: uid.clone(),
            device,
            login: Mutex::new(LoginState::LoggedIn),
            puk_cache: Mutex::new(HashMap::new()),
        });
        let teams = Arc::new(SimTeams {
            state: Arc::clone(&self.state),
            uid: uid.clone(),
            ptk_cache: Mutex::new(HashMap::new()),
        });
        let notifier = Arc::new(RecordingNotifier::new());

        let collaborators = Collaborators {
            directory: Arc::clone(&self.directory) as _,
            merkle: Arc::clone(&self.merkle) as _,
            teams: Arc::clone(&teams) as _,
            identity: Arc::clone(&identity) as _,
            notifier: Arc::clone(&notifier) as _,
        };
        let ctx = EkContext::new(self.env.clone(), self.config.clone(), kv, collaborators);

        SimClient { lib: Arc::new(EkLib::new(ctx)), identity, teams, notifier }
    }
}

/// One simulated device running the engine.
pub struct SimClient {
    /// The engine
    pub lib: Arc<EkLib<SimEnv>>,
    /// Session of this device
    pub identity: Arc<SimIdentity>,
    /// Team view of this device's user
    pub teams: Arc<SimTeams>,
    /// Notifications sent by this device
    pub notifier: Arc<RecordingNotifier>,
}

impl SimClient {
    /// Owner of the device.
    pub fn uid(&self) -> &Uid {
        &self.identity.uid
    }

    /// The device.
    pub fn device(&self) -> &DeviceId {
        &self.identity.device
    }
}

/// Session and user lookups for one simulated device.
pub struct SimIdentity {
    state: SharedState,
    uid: Uid,
    device: DeviceId,
    login: Mutex<LoginState>,
    puk_cache: Mutex<HashMap<Uid, VerifyingKey>>,
}

impl SimIdentity {
    /// Change the session state.
    pub fn set_login_state(&self, state: LoginState) {
        *self.login.lock() = state;
    }
}

#[async_trait]
impl IdentityProvider for SimIdentity {
    fn login_state(&self) -> LoginState {
        *self.login.lock()
    }

    fn active_device(&self) -> Result<ActiveDevice, EkError> {
        if self.login_state() == LoginState::LoggedOut {
            return Err(EkError::NotLoggedIn);
        }
        let state = self.state.lock();
        let device = state
            .users
            .get(&self.uid)
            .and_then(|user| user.devices.get(&self.device))
            .ok_or_else(|| unknown(&self.device))?;
        Ok(ActiveDevice {
            uid: self.uid.clone(),
            device_id: self.device.clone(),
            signing_key: device.signing_key.clone(),
        })
    }

    async fn current_puk(&self) -> Result<SigningKeyPair, EkError> {
        let state = self.state.lock();
        let user = state.users.get(&self.uid).ok_or_else(|| unknown(&self.uid))?;
        Ok(user.puk.clone())
    }

    async fn puk_verifying_key(
        &self,
        uid: &Uid,
        force_reload: bool,
    ) -> Result<VerifyingKey, EkError> {
        if !force_reload && let Some(key) = self.puk_cache.lock().get(uid) {
            return Ok(*key);
        }
        let key = {
            let state = self.state.lock();
            state.users.get(uid).ok_or_else(|| unknown(uid))?.puk.verifying_key()
        };
        self.puk_cache.lock().insert(uid.clone(), key);
        Ok(key)
    }

    async fn user_devices(
        &self,
        uid: &Uid,
        _force_reload: bool,
    ) -> Result<Vec<DeviceInfo>, EkError> {
        let state = self.state.lock();
        let user = state.users.get(uid).ok_or_else(|| unknown(uid))?;
        Ok(user
            .devices
            .iter()
            .filter(|(_, device)| !device.revoked)
            .map(|(device_id, device)| DeviceInfo {
                device_id: device_id.clone(),
                verifying_key: device.signing_key.verifying_key(),
            })
            .collect())
    }
}

/// Team lookups as seen by one simulated user.
pub struct SimTeams {
    state: SharedState,
    uid: Uid,
    ptk_cache: Mutex<HashMap<TeamId, VerifyingKey>>,
}

#[async_trait]
impl TeamDirectory for SimTeams {
    async fn team_verifying_key(
        &self,
        team: &TeamId,
        force_reload: bool,
    ) -> Result<VerifyingKey, EkError> {
        if !force_reload && let Some(key) = self.ptk_cache.lock().get(team) {
            return Ok(*key);
        }
        let key = {
            let state = self.state.lock();
            state.teams.get(team).ok_or_else(|| unknown(team))?.ptk.verifying_key()
        };
        self.ptk_cache.lock().insert(team.clone(), key);
        Ok(key)
    }

    async fn team_signing_key(&self, team: &TeamId) -> Result<SigningKeyPair, EkError> {
        let state = self.state.lock();
        let team_state = state.teams.get(team).ok_or_else(|| unknown(team))?;
        if !team_state.members.contains(&self.uid) {
            return Err(EkError::Directory(format!("{} cannot sign for {team}", self.uid)));
        }
        Ok(team_state.ptk.clone())
    }

    async fn members(&self, team: &TeamId) -> Result<Vec<Uid>, EkError> {
        let state = self.state.lock();
        let team_state = state.teams.get(team).ok_or_else(|| unknown(team))?;
        Ok(team_state.members.iter().cloned().collect())
    }

    async fn is_member(&self, team: &TeamId, uid: &Uid) -> Result<bool, EkError> {
        let state = self.state.lock();
        let team_state = state.teams.get(team).ok_or_else(|| unknown(team))?;
        Ok(team_state.members.contains(uid) || team_state.bots.contains(uid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn puk_cache_is_stale_until_forced() {
        let world = SimWorld::new(7);
        let alice = world.add_user("alice");
        let client = world.client(&alice, "phone");

        let before = client.identity.puk_verifying_key(&alice, false).await.unwrap();
        world.rotate_puk(&alice);

        assert_eq!(client.identity.puk_verifying_key(&alice, false).await.unwrap(), before);
        assert_ne!(client.identity.puk_verifying_key(&alice, true).await.unwrap(), before);
    }

    #[tokio::test]
    async fn bots_are_members_but_cannot_sign() {
        let world = SimWorld::new(7);
        let alice = world.add_user("alice");
        let bot = world.add_user("bot");
        let team = world.add_team("acme", &[&alice]);
        world.add_bot(&team, &bot);
        let bot_client = world.client(&bot, "server");

        assert!(bot_client.teams.is_member(&team, &bot).await.unwrap());
        assert_eq!(bot_client.teams.members(&team).await.unwrap(), vec![alice]);
        assert!(bot_client.teams.team_signing_key(&team).await.is_err());
    }

    #[tokio::test]
    async fn revoked_devices_are_not_listed() {
        let world = SimWorld::new(7);
        let alice = world.add_user("alice");
        let phone = world.add_device(&alice, "phone");
        world.add_device(&alice, "laptop");
        let client = world.client(&alice, "laptop");

        world.revoke_device(&alice, &phone);

        let devices = client.identity.user_devices(&alice, true).await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].device_id, DeviceId::new("laptop"));
    }
}
