//! The orchestrator: needed-checks, rotation and the latest-generation cache.
//!
//! [`EkLib`] is the only entry point callers need. It decides when a level
//! must rotate, publishes under a bounded retry, keeps a short-lived cache of
//! the latest team and teambot generations, and owns the background task.
//!
//! Rotation is serialized per process by an async mutex. Two processes (or
//! two devices) can still race; the directory rejects the loser, which
//! retries from the new maximum.

use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use ephemera_crypto::{DeriveReason, DhKeyPair, Kid, Seed, SigningKeyPair, derive_dh_keypair};
use parking_lot::Mutex;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::{
    background::{self, AppState, BackgroundHandle},
    context::EkContext,
    env::Environment,
    error::EkError,
    external::{ActiveDevice, LoginState},
    generation_cache::GenerationCache,
    keyer::EphemeralKeyer,
    metadata::{DeviceEkMetadata, EkBoxed, SignedStatement, TeamEk, TeambotEk},
    retry::{RetryPolicy, with_publish_retry},
    statement::{
        VerifiedStatement, active_user_ek_metadata,
        device::{publish_new_device_ek, sign_device_ek_statement},
        seal_seed, team,
        teambot::{self, derive_teambot_ek},
        user,
    },
    types::{
        DeviceId, EkGeneration, EkKind, HashMeta, MerkleRoot, Principal, Recipient, TeamId,
        TeambotId, UnixTime, Uid,
    },
};

/// Generations published by one [`EkLib::keygen_if_needed`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeygenOutcome {
    /// New device key, if one was published
    pub device_ek: Option<EkGeneration>,
    /// New user key, if one was published
    pub user_ek: Option<EkGeneration>,
}

/// Result of a team needed-check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TeamEkNeed {
    /// A new team key must be published before use
    pub needed: bool,
    /// The current key is usable but close enough to rotation that the
    /// successor can be published in the background
    pub background_possible: bool,
    /// Generation of the latest statement, trusted or not
    pub latest: Option<EkGeneration>,
}

/// Ephemeral key lifecycle engine for one logged-in device.
pub struct EkLib<E: Environment> {
    ctx: Arc<EkContext<E>>,
    keygen_lock: tokio::sync::Mutex<()>,
    latest: Arc<GenerationCache<E::Instant>>,
    cancel: CancellationToken,
    jobs: Mutex<Vec<JoinHandle<()>>>,
    background: Mutex<Option<BackgroundHandle>>,
    background_runs: AtomicU64,
}

impl<E: Environment> EkLib<E> {
    /// Engine over `ctx`. Call [`start_background`](Self::start_background)
    /// to enable periodic rotation.
    pub fn new(ctx: EkContext<E>) -> Self {
        let latest = GenerationCache::new(
            ctx.config.generation_cache_capacity,
            ctx.config.generation_cache_ttl,
        );
        Self {
            ctx: Arc::new(ctx),
            keygen_lock: tokio::sync::Mutex::new(()),
            latest: Arc::new(latest),
            cancel: CancellationToken::new(),
            jobs: Mutex::new(Vec::new()),
            background: Mutex::new(None),
            background_runs: AtomicU64::new(0),
        }
    }

    /// Shared context.
    pub fn context(&self) -> &Arc<EkContext<E>> {
        &self.ctx
    }

    /// Token that aborts publishes and background work.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.ctx.config.max_publish_retries,
            backoff: self.ctx.config.retry_backoff,
        }
    }

    async fn with_retry<T, F, Fut>(&self, operation: &'static str, attempt: F) -> Result<T, EkError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, EkError>>,
    {
        with_publish_retry(&self.ctx.env, &self.cancel, self.retry_policy(), operation, attempt).await
    }

    /// The local device, if this session may manage ephemeral keys.
    pub fn check_login(&self) -> Result<ActiveDevice, EkError> {
        match self.ctx.identity.login_state() {
            LoginState::LoggedIn => self.ctx.identity.active_device(),
            LoginState::LoggedOut => Err(EkError::NotLoggedIn),
            LoginState::Oneshot => Err(EkError::Oneshot),
        }
    }

    /// Rotate the device and user keys if they need it, then clean up expired
    /// ones.
    ///
    /// Without a Merkle root nothing is published, but expired device keys
    /// are still deleted (measured against the local clock).
    #[instrument(skip_all)]
    pub async fn keygen_if_needed(&self) -> Result<KeygenOutcome, EkError> {
        let _guard = self.keygen_lock.lock().await;
        let device = self.check_login()?;

        let merkle_root = match self.ctx.merkle_root().await {
            Ok(root) => root,
            Err(err) => {
                warn!(error = %err, "merkle root unavailable, skipping keygen");
                if let Err(cleanup_err) = cleanup_stale(&self.ctx, None) {
                    warn!(error = %cleanup_err, "cleanup failed");
                }
                return Err(err);
            },
        };

        let result = self.keygen_locked(&device, &merkle_root).await;
        if let Err(err) = cleanup_stale(&self.ctx, Some(&merkle_root)) {
            warn!(error = %err, "cleanup failed");
        }
        result
    }

    async fn keygen_locked(
        &self,
        device: &ActiveDevice,
        merkle_root: &MerkleRoot,
    ) -> Result<KeygenOutcome, EkError> {
        let ctx = self.ctx.as_ref();
        let mut outcome = KeygenOutcome::default();

        if self.device_ek_needed(&device.device_id, merkle_root)? {
            let published = self
                .with_retry("deviceEK", move || publish_new_device_ek(ctx, merkle_root))
                .await?;
            outcome.device_ek = Some(published.generation);
        }

        if self.user_ek_needed(&device.uid, merkle_root).await? {
            let (keyer, uid) = (ctx.user_ek_storage.keyer(), &device.uid);
            let published = self
                .with_retry("userEK", move || keyer.publish_new_ek(ctx, uid, &(), merkle_root))
                .await?;
            outcome.user_ek = Some(published.generation);
        }

        Ok(outcome)
    }

    /// Whether the local device key must rotate.
    pub async fn new_device_ek_needed(&self) -> Result<bool, EkError> {
        let _guard = self.keygen_lock.lock().await;
        let device = self.check_login()?;
        let merkle_root = self.ctx.merkle_root().await?;
        self.device_ek_needed(&device.device_id, &merkle_root)
    }

    fn device_ek_needed(&self, device: &DeviceId, merkle_root: &MerkleRoot) -> Result<bool, EkError> {
        let storage = &self.ctx.device_ek_storage;

        let max_generation = match storage.max_generation(device, false) {
            Ok(Some(generation)) => generation,
            Ok(None) => {
                debug!("no deviceEK yet");
                return Ok(true);
            },
            Err(err) if err.is_self_healing() => {
                debug!(error = %err, "deviceEK index unreadable");
                return Ok(true);
            },
            Err(err) => return Err(err),
        };

        match storage.get(device, max_generation) {
            Ok(Some(ek)) => {
                let needed =
                    self.ctx.config.lifetimes.keygen_needed(ek.metadata.ctime, merkle_root.ctime);
                debug!(generation = %max_generation, needed, "deviceEK age checked");
                Ok(needed)
            },
            Ok(None) => Ok(true),
            Err(err) if err.is_self_healing() => {
                debug!(generation = %max_generation, error = %err, "latest deviceEK unreadable");
                Ok(true)
            },
            Err(err) => Err(err),
        }
    }

    /// Whether the local user key must rotate.
    pub async fn new_user_ek_needed(&self) -> Result<bool, EkError> {
        let _guard = self.keygen_lock.lock().await;
        let device = self.check_login()?;
        let merkle_root = self.ctx.merkle_root().await?;
        self.user_ek_needed(&device.uid, &merkle_root).await
    }

    async fn user_ek_needed(&self, uid: &Uid, merkle_root: &MerkleRoot) -> Result<bool, EkError> {
        let metadata = match user::fetch_user_ek_statement(&self.ctx, uid).await? {
            VerifiedStatement::Current(metadata) => metadata,
            VerifiedStatement::WrongKid { generation } => {
                debug!(%generation, "latest userEK signed by an old PUK");
                return Ok(true);
            },
            VerifiedStatement::Missing => {
                debug!("no userEK published");
                return Ok(true);
            },
        };

        match self.ctx.user_ek_storage.get(&self.ctx, uid, metadata.generation, None).await {
            Ok(ek) => {
                let needed =
                    self.ctx.config.lifetimes.keygen_needed(ek.metadata.ctime, merkle_root.ctime);
                debug!(generation = %metadata.generation, needed, "userEK age checked");
                Ok(needed)
            },
            Err(err) if err.is_self_healing() => {
                debug!(generation = %metadata.generation, error = %err, "latest userEK unreachable");
                Ok(true)
            },
            Err(err) => Err(err),
        }
    }

    /// Whether `team`'s key must rotate before it can be used.
    pub async fn new_team_ek_needed(&self, team: &TeamId) -> Result<bool, EkError> {
        let _guard = self.keygen_lock.lock().await;
        self.check_login()?;
        let merkle_root = self.ctx.merkle_root().await?;
        Ok(self.team_ek_needed(team, &merkle_root).await?.needed)
    }

    async fn team_ek_needed(&self, team: &TeamId, merkle_root: &MerkleRoot) -> Result<TeamEkNeed, EkError> {
        let statement = team::fetch_team_ek_statement(&self.ctx, team).await?;
        let latest = statement.latest_generation();
        let needed = TeamEkNeed { needed: true, background_possible: false, latest };

        let metadata = match statement {
            VerifiedStatement::Current(metadata) => metadata,
            VerifiedStatement::WrongKid { generation } => {
                debug!(%generation, "latest teamEK signed by an old PTK");
                return Ok(needed);
            },
            VerifiedStatement::Missing => return Ok(needed),
        };

        match self.ctx.team_ek_storage.get(&self.ctx, team, metadata.generation, None).await {
            Ok(ek) => {
                let lifetimes = &self.ctx.config.lifetimes;
                let background_possible =
                    lifetimes.background_keygen_possible(ek.metadata.ctime, merkle_root.ctime);
                Ok(TeamEkNeed {
                    needed: !background_possible
                        && lifetimes.keygen_needed(ek.metadata.ctime, merkle_root.ctime),
                    background_possible,
                    latest,
                })
            },
            Err(err) if err.is_self_healing() => {
                debug!(generation = %metadata.generation, error = %err, "latest teamEK unreachable");
                Ok(needed)
            },
            Err(err) => Err(err),
        }
    }

    /// The current team key, publishing a new generation first if needed.
    ///
    /// Returns whether this call published it. A key inside the background
    /// window is returned at once while its successor is published by a
    /// spawned task.
    #[instrument(skip_all, fields(%team))]
    pub async fn get_or_create_latest_team_ek(&self, team: &TeamId) -> Result<(TeamEk, bool), EkError> {
        let device = self.check_login()?;
        let principal = Principal::Team(team.clone());
        let _guard = self.keygen_lock.lock().await;

        if let Some((entry, expired)) = self.latest.get(&principal, self.ctx.env.now())
            && (!expired || entry.creation_in_progress)
        {
            match self.ctx.team_ek_storage.get(&self.ctx, team, entry.generation, None).await {
                Ok(team_ek) => {
                    debug!(generation = %entry.generation, "latest teamEK from cache");
                    return Ok((team_ek, false));
                },
                Err(err) => {
                    debug!(generation = %entry.generation, error = %err, "cached teamEK unusable");
                    self.latest.remove(&principal);
                },
            }
        }

        let merkle_root = self.ctx.merkle_root().await?;
        let result = self.latest_team_ek_locked(&device, team, &merkle_root).await;

        if let Err(err) =
            self.ctx.team_ek_storage.delete_expired(team, &merkle_root, &self.ctx.config.lifetimes)
        {
            warn!(error = %err, "teamEK cleanup failed");
        }
        self.cleanup_in_background(merkle_root);
        result
    }

    async fn latest_team_ek_locked(
        &self,
        device: &ActiveDevice,
        team: &TeamId,
        merkle_root: &MerkleRoot,
    ) -> Result<(TeamEk, bool), EkError> {
        self.keygen_locked(device, merkle_root).await?;

        let need = self.team_ek_needed(team, merkle_root).await?;
        let (generation, created) = if need.needed {
            let ctx = self.ctx.as_ref();
            let published = self
                .with_retry("teamEK", move || {
                    ctx.team_ek_storage.keyer().publish_new_ek(ctx, team, &(), merkle_root)
                })
                .await?;
            (Some(published.generation), true)
        } else {
            (need.latest, false)
        };

        let Some(generation) = generation else {
            return Err(EkError::NotFound {
                kind: EkKind::Team,
                principal: Principal::Team(team.clone()).to_string(),
            });
        };

        let team_ek = self.ctx.team_ek_storage.get(&self.ctx, team, generation, None).await?;
        self.latest.insert(
            &Principal::Team(team.clone()),
            generation,
            need.background_possible,
            self.ctx.env.now(),
        );

        if need.background_possible {
            self.publish_team_ek_in_background(team.clone(), *merkle_root);
        }
        Ok((team_ek, created))
    }

    fn publish_team_ek_in_background(&self, team: TeamId, merkle_root: MerkleRoot) {
        let ctx = Arc::clone(&self.ctx);
        let latest = Arc::clone(&self.latest);

        self.spawn_job(async move {
            let principal = Principal::Team(team.clone());
            match ctx.team_ek_storage.keyer().publish_new_ek(&ctx, &team, &(), &merkle_root).await {
                Ok(published) => {
                    latest.insert(&principal, published.generation, false, ctx.env.now());
                },
                Err(err) => {
                    warn!(%team, error = %err, "background teamEK publish failed");
                    latest.remove(&principal);
                },
            }
        });
    }

    /// Team key `generation`.
    ///
    /// When it cannot be unboxed and is the latest local generation, a new
    /// team key is published in the background so later messages are
    /// readable again.
    #[instrument(skip_all, fields(%team, %generation))]
    pub async fn get_team_ek(
        self: &Arc<Self>,
        team: &TeamId,
        generation: EkGeneration,
        content_ctime: Option<UnixTime>,
    ) -> Result<TeamEk, EkError> {
        let result = self.ctx.team_ek_storage.get(&self.ctx, team, generation, content_ctime).await;

        if let Some(unavailable) = result.as_ref().err().and_then(EkError::as_unbox) {
            debug!(error = %unavailable, "teamEK unavailable");
            let lib = Arc::clone(self);
            let team = team.clone();
            self.spawn_job(async move {
                match lib.ctx.team_ek_storage.max_generation(&team, true) {
                    Ok(Some(max)) if max == generation => {
                        if let Err(err) = lib.get_or_create_latest_team_ek(&team).await {
                            debug!(%team, error = %err, "teamEK regeneration failed");
                        }
                    },
                    Ok(_) => {},
                    Err(err) => debug!(%team, error = %err, "unable to read max teamEK generation"),
                }
            });
        }
        result
    }

    /// Latest teambot key of `bot` in `team`, and whether this call published
    /// it.
    ///
    /// Members derive it from the latest team key and publish it for the bot
    /// if the directory is behind. The bot itself reads its boxed copy and
    /// asks members for a new one when it is missing or due for rotation.
    #[instrument(skip_all, fields(%team, %bot))]
    pub async fn get_or_create_latest_teambot_ek(
        &self,
        team: &TeamId,
        bot: &Uid,
    ) -> Result<(TeambotEk, bool), EkError> {
        let device = self.check_login()?;
        let id = TeambotId::new(team.clone(), bot.clone());
        if &device.uid == bot {
            return self.latest_teambot_ek_as_bot(&id).await.map(|ek| (ek, false));
        }

        let (team_ek, _) = self.get_or_create_latest_team_ek(team).await?;
        let teambot_ek = derive_teambot_ek(&team_ek, bot);

        let principal = Principal::Teambot(id.clone());
        if let Some((entry, expired)) = self.latest.get(&principal, self.ctx.env.now())
            && !expired
            && entry.generation == teambot_ek.generation()
        {
            return Ok((teambot_ek, false));
        }

        let published = self.publish_teambot_if_behind(&id, &team_ek).await?;
        self.latest.insert(&principal, teambot_ek.generation(), false, self.ctx.env.now());
        Ok((teambot_ek, published))
    }

    async fn latest_teambot_ek_as_bot(&self, id: &TeambotId) -> Result<TeambotEk, EkError> {
        let notifier = &self.ctx.notifier;

        let metadata = match teambot::fetch_teambot_ek_statement(&self.ctx, id).await? {
            VerifiedStatement::Current(metadata) => metadata,
            VerifiedStatement::WrongKid { generation } => {
                notifier.teambot_ek_needed(&id.team, &id.bot, Some(generation));
                return Err(EkError::WrongKid { kind: EkKind::Teambot, generation });
            },
            VerifiedStatement::Missing => {
                notifier.teambot_ek_needed(&id.team, &id.bot, None);
                return Err(EkError::NotFound {
                    kind: EkKind::Teambot,
                    principal: Principal::Teambot(id.clone()).to_string(),
                });
            },
        };

        match self.ctx.teambot_ek_storage.get(&self.ctx, id, metadata.generation, None).await {
            Ok(ek) => {
                let merkle_root = self.ctx.merkle_root().await?;
                if self.ctx.config.lifetimes.keygen_needed(ek.metadata.ctime, merkle_root.ctime) {
                    debug!(generation = %metadata.generation, "teambotEK due for rotation");
                    notifier.teambot_ek_needed(&id.team, &id.bot, Some(metadata.generation));
                }
                Ok(ek)
            },
            Err(err) => {
                if err.is_self_healing() {
                    notifier.teambot_ek_needed(&id.team, &id.bot, Some(metadata.generation));
                }
                Err(err)
            },
        }
    }

    /// Publish the teambot key derived from `team_ek` unless the directory
    /// already has that generation or a later one.
    async fn publish_teambot_if_behind(&self, id: &TeambotId, team_ek: &TeamEk) -> Result<bool, EkError> {
        let generation = team_ek.generation();
        let latest = teambot::fetch_teambot_ek_statement(&self.ctx, id).await?.latest_generation();
        if latest.is_some_and(|latest| latest >= generation) {
            return Ok(false);
        }

        let merkle_root = self.ctx.merkle_root().await?;
        let ctx = self.ctx.as_ref();
        let merkle_root = &merkle_root;
        self.with_retry("teambotEK", move || async move {
            match ctx.teambot_ek_storage.keyer().publish_new_ek(ctx, id, team_ek, merkle_root).await {
                Ok(_) => Ok(true),
                Err(EkError::GenerationConflict { server_max: Some(max), .. }) if max >= generation => {
                    debug!(%generation, "another member published the teambotEK first");
                    Ok(false)
                },
                Err(err) => Err(err),
            }
        })
        .await
    }

    /// Teambot key `generation` of `bot` in `team`.
    ///
    /// The bot reads its box and requests a new key when it cannot; members
    /// derive the key from the team key of the same generation.
    #[instrument(skip_all, fields(%team, %bot, %generation))]
    pub async fn get_teambot_ek(
        self: &Arc<Self>,
        team: &TeamId,
        bot: &Uid,
        generation: EkGeneration,
        content_ctime: Option<UnixTime>,
    ) -> Result<TeambotEk, EkError> {
        let device = self.check_login()?;
        if &device.uid != bot {
            let team_ek = self.get_team_ek(team, generation, content_ctime).await?;
            return Ok(derive_teambot_ek(&team_ek, bot));
        }

        let id = TeambotId::new(team.clone(), bot.clone());
        let result = self.ctx.teambot_ek_storage.get(&self.ctx, &id, generation, content_ctime).await;
        if result.as_ref().err().and_then(EkError::as_unbox).is_some() {
            self.ctx.notifier.teambot_ek_needed(team, bot, Some(generation));
        }
        result
    }

    /// React to a bot's request for a teambot key.
    ///
    /// `generation` is `None` when the bot has no key at all. A request for
    /// the latest generation (or newer) forces a fresh team key, since that
    /// generation cannot be republished. Returns the generation published,
    /// if any.
    #[instrument(skip_all, fields(%team, %bot, ?generation))]
    pub async fn handle_teambot_ek_needed(
        &self,
        team: &TeamId,
        bot: &Uid,
        generation: Option<EkGeneration>,
    ) -> Result<Option<EkGeneration>, EkError> {
        let device = self.check_login()?;
        if !self.ctx.teams.is_member(team, bot).await? {
            warn!("ignoring teambotEK request from a non-member");
            return Ok(None);
        }

        let Some(requested) = generation else {
            let (teambot_ek, published) = self.get_or_create_latest_teambot_ek(team, bot).await?;
            return Ok(published.then(|| teambot_ek.generation()));
        };

        let id = TeambotId::new(team.clone(), bot.clone());
        let latest = teambot::fetch_teambot_ek_statement(&self.ctx, &id).await?.latest_generation();
        if latest.is_some_and(|latest| requested < latest) {
            debug!(?latest, "bot asked for an older generation, nothing to do");
            return Ok(None);
        }

        self.purge_caches_for_team(team);
        self.purge_caches_for_teambot(team, bot);

        let team_ek = {
            let _guard = self.keygen_lock.lock().await;
            let merkle_root = self.ctx.merkle_root().await?;
            self.keygen_locked(&device, &merkle_root).await?;

            let ctx = self.ctx.as_ref();
            let merkle_root = &merkle_root;
            let published = self
                .with_retry("teamEK", move || {
                    ctx.team_ek_storage.keyer().publish_new_ek(ctx, team, &(), merkle_root)
                })
                .await?;
            let team_ek =
                self.ctx.team_ek_storage.get(&self.ctx, team, published.generation, None).await?;
            self.latest.insert(
                &Principal::Team(team.clone()),
                published.generation,
                false,
                self.ctx.env.now(),
            );
            team_ek
        };

        let published = self.publish_teambot_if_behind(&id, &team_ek).await?;
        self.latest.insert(
            &Principal::Teambot(id),
            team_ek.generation(),
            false,
            self.ctx.env.now(),
        );
        info!(generation = %team_ek.generation(), published, "forced teambotEK rotation");
        Ok(published.then(|| team_ek.generation()))
    }

    /// Forget everything cached about `team`.
    pub fn purge_caches_for_team(&self, team: &TeamId) {
        debug!(%team, "purging teamEK caches");
        self.latest.remove(&Principal::Team(team.clone()));
        self.ctx.team_ek_storage.clear_principal(team);
    }

    /// Forget `team`'s key `generation`.
    ///
    /// The latest-generation entry survives only if it points at exactly
    /// this generation, which the caller is about to refresh.
    pub fn purge_caches_for_team_and_generation(&self, team: &TeamId, generation: EkGeneration) {
        debug!(%team, %generation, "purging teamEK generation");
        self.latest.remove_unless(&Principal::Team(team.clone()), generation);
        if let Err(err) = self.ctx.team_ek_storage.delete(team, generation) {
            debug!(%team, %generation, error = %err, "unable to delete teamEK");
        }
    }

    /// Forget everything cached about `bot`'s teambot key in `team`.
    pub fn purge_caches_for_teambot(&self, team: &TeamId, bot: &Uid) {
        let id = TeambotId::new(team.clone(), bot.clone());
        debug!(teambot = %id, "purging teambotEK caches");
        self.ctx.teambot_ek_storage.clear_principal(&id);
        self.latest.remove(&Principal::Teambot(id));
    }

    /// Forget teambot key `generation` of `bot` in `team`.
    pub fn purge_caches_for_teambot_and_generation(
        &self,
        team: &TeamId,
        bot: &Uid,
        generation: EkGeneration,
    ) {
        let id = TeambotId::new(team.clone(), bot.clone());
        if let Err(err) = self.ctx.teambot_ek_storage.delete(&id, generation) {
            debug!(teambot = %id, %generation, error = %err, "unable to delete teambotEK");
        }
        self.latest.remove_unless(&Principal::Teambot(id), generation);
    }

    /// Box the latest user key to a device being provisioned.
    ///
    /// `receiver_kid` is the new device's device key and
    /// `device_ek_generation` its generation. Returns `None` if this user has
    /// no user key yet.
    #[instrument(skip_all, fields(%receiver, %device_ek_generation))]
    pub async fn box_latest_user_ek(
        &self,
        receiver: &DeviceId,
        receiver_kid: &Kid,
        device_ek_generation: EkGeneration,
    ) -> Result<Option<EkBoxed>, EkError> {
        self.keygen_if_needed().await?;
        let uid = self.check_login()?.uid;

        let storage = &self.ctx.user_ek_storage;
        let Some(generation) = storage.max_generation(&uid, false)? else {
            debug!("no userEK to box");
            return Ok(None);
        };
        let user_ek = storage.get(&self.ctx, &uid, generation, None).await?;
        let Some(own_box) = storage.get_boxed(&uid, generation)? else {
            return Ok(None);
        };

        Ok(Some(EkBoxed {
            generation,
            ctime: user_ek.metadata.ctime,
            recipient: Recipient::Device(receiver.clone()),
            recipient_generation: device_ek_generation,
            statement: own_box.statement,
            sealed: seal_seed(&self.ctx.env, &user_ek.seed, receiver_kid)?,
        }))
    }

    /// Box the latest team key to new members.
    ///
    /// Returns `None` when the team key is due for rotation anyway: the next
    /// key will include the new members.
    #[instrument(skip_all, fields(%team, recipients = recipients.len()))]
    pub async fn box_latest_team_ek(
        &self,
        team: &TeamId,
        recipients: &[Uid],
    ) -> Result<Option<Vec<EkBoxed>>, EkError> {
        if self.new_team_ek_needed(team).await? {
            debug!("teamEK needs rotation, new members will get the next one");
            return Ok(None);
        }

        let merkle_root = self.ctx.merkle_root().await?;
        let statements = user::fetch_user_ek_statements(&self.ctx, recipients).await?;
        let active = active_user_ek_metadata(&statements, &merkle_root, &self.ctx.config.lifetimes);

        let storage = &self.ctx.team_ek_storage;
        let Some(generation) = storage.max_generation(team, false)? else {
            return Ok(None);
        };
        let team_ek = storage.get(&self.ctx, team, generation, None).await?;
        let Some(own_box) = storage.get_boxed(team, generation)? else {
            return Ok(None);
        };

        let mut boxes = Vec::with_capacity(active.len());
        for (uid, user_ek) in &active {
            boxes.push(EkBoxed {
                generation,
                ctime: team_ek.metadata.ctime,
                recipient: Recipient::User(uid.clone()),
                recipient_generation: user_ek.generation,
                statement: own_box.statement.clone(),
                sealed: seal_seed(&self.ctx.env, &team_ek.seed, &user_ek.kid)?,
            });
        }
        Ok(Some(boxes))
    }

    /// Fresh random seed, for provisioning a device key out of band.
    pub fn new_ephemeral_seed(&self) -> Seed {
        self.ctx.env.new_seed()
    }

    /// Device key pair for `seed`.
    pub fn derive_device_dh_key(&self, seed: &Seed) -> DhKeyPair {
        derive_dh_keypair(seed, DeriveReason::DeviceEkEncryption)
    }

    /// Device key statement for a seed generated during provisioning.
    pub async fn signed_device_ek_statement_from_seed(
        &self,
        generation: EkGeneration,
        seed: &Seed,
        signing_key: &SigningKeyPair,
    ) -> Result<(DeviceEkMetadata, SignedStatement), EkError> {
        let merkle_root = self.ctx.merkle_root().await?;
        sign_device_ek_statement(generation, seed, signing_key, &merkle_root, self.ctx.env.wall_clock())
    }

    /// Delete expired device keys and user key boxes.
    pub async fn cleanup_stale_user_and_device_eks(&self) -> Result<(), EkError> {
        let _guard = self.keygen_lock.lock().await;
        self.check_login()?;
        let merkle_root = match self.ctx.merkle_root().await {
            Ok(root) => Some(root),
            Err(err) => {
                debug!(error = %err, "merkle root unavailable, cleaning deviceEKs only");
                None
            },
        };
        cleanup_stale(&self.ctx, merkle_root.as_ref())
    }

    fn cleanup_in_background(&self, merkle_root: MerkleRoot) {
        let ctx = Arc::clone(&self.ctx);
        self.spawn_job(async move {
            if let Err(err) = cleanup_stale(&ctx, Some(&merkle_root)) {
                debug!(error = %err, "background cleanup failed");
            }
        });
    }

    /// Rotate keys after login. Failures are logged only.
    pub async fn on_login(&self) {
        if let Err(err) = self.keygen_if_needed().await {
            debug!(error = %err, "keygen after login failed");
        }
    }

    /// Drop every cache after logout.
    pub fn on_logout(&self) {
        self.clear_caches();
    }

    /// Drop the latest-generation cache and every store index.
    pub fn clear_caches(&self) {
        self.latest.purge();
        self.ctx.clear_store_caches();
    }

    /// Start the periodic rotation task. Does nothing if it already runs.
    pub fn start_background(self: &Arc<Self>) {
        let mut slot = self.background.lock();
        if slot.is_some() {
            return;
        }

        let (events, receiver) = mpsc::unbounded_channel();
        let task = tokio::spawn(background::run(Arc::clone(self), receiver, self.cancel.child_token()));
        *slot = Some(BackgroundHandle { events, task });
    }

    /// Forward an app state change to the background task.
    pub fn on_app_state(&self, state: AppState) {
        if let Some(handle) = self.background.lock().as_ref()
            && handle.events.send(state).is_err()
        {
            debug!(?state, "background task already stopped");
        }
    }

    /// Cancel in-flight publishes and stop all background work.
    pub async fn shutdown(&self) {
        self.cancel.cancel();

        let handle = self.background.lock().take();
        if let Some(handle) = handle
            && let Err(err) = handle.task.await
        {
            warn!(error = %err, "background task panicked");
        }
        self.wait_for_background_work().await;
        info!("ephemeral key engine shut down");
    }

    /// Wait until every spawned job (background publishes, cleanups) has
    /// finished, including jobs spawned while waiting.
    pub async fn wait_for_background_work(&self) {
        loop {
            let pending = std::mem::take(&mut *self.jobs.lock());
            if pending.is_empty() {
                return;
            }
            for job in pending {
                if let Err(err) = job.await {
                    warn!(error = %err, "background job panicked");
                }
            }
        }
    }

    /// Number of background keygen passes run so far.
    pub fn background_run_count(&self) -> u64 {
        self.background_runs.load(Ordering::Relaxed)
    }

    pub(crate) fn record_background_run(&self) {
        self.background_runs.fetch_add(1, Ordering::Relaxed);
    }

    fn spawn_job(&self, job: impl Future<Output = ()> + Send + 'static) {
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                biased;
                () = cancel.cancelled() => debug!("background job cancelled"),
                () = job => {},
            }
        });

        let mut jobs = self.jobs.lock();
        jobs.retain(|job| !job.is_finished());
        jobs.push(handle);
    }
}

/// Delete expired device keys, then expired user key boxes.
///
/// Without a Merkle root only device keys are cleaned, against the local
/// clock. Every deletion is attempted; the first error is returned.
fn cleanup_stale<E: Environment>(ctx: &EkContext<E>, merkle_root: Option<&MerkleRoot>) -> Result<(), EkError> {
    let device = ctx.identity.active_device()?;
    let lifetimes = &ctx.config.lifetimes;
    let mut first_err = None;

    let device_root = merkle_root
        .copied()
        .unwrap_or(MerkleRoot { ctime: ctx.env.wall_clock(), hash_meta: HashMeta::default() });
    match ctx.device_ek_storage.delete_expired(&device.device_id, &device_root, lifetimes) {
        Ok(deleted) if !deleted.is_empty() => debug!(?deleted, "deleted expired deviceEKs"),
        Ok(_) => {},
        Err(err) => first_err = Some(err),
    }

    if let Some(merkle_root) = merkle_root {
        match ctx.user_ek_storage.delete_expired(&device.uid, merkle_root, lifetimes) {
            Ok(deleted) if !deleted.is_empty() => debug!(?deleted, "deleted expired userEKs"),
            Ok(_) => {},
            Err(err) => {
                first_err.get_or_insert(err);
            },
        }
    }

    first_err.map_or(Ok(()), Err)
}
