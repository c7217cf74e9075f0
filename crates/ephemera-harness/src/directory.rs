//! Simulated key directory and Merkle oracle.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use async_trait::async_trait;
use ephemera_core::{
    DirectoryError, DirectoryService, EkBoxed, EkError, EkGeneration, EkKind, Environment,
    HashMeta, MerkleOracle, MerkleRoot, Principal, Recipient, SignedStatement, StatementPost,
};
use parking_lot::Mutex;
use tokio::sync::Barrier;
use tracing::debug;

use crate::SimEnv;

type BoxKey = (Principal, EkGeneration, Recipient);

#[derive(Default)]
struct DirectoryState {
    statements: HashMap<Principal, BTreeMap<EkGeneration, SignedStatement>>,
    boxes: HashMap<BoxKey, EkBoxed>,
    accepted_posts: usize,
    failures_pending: usize,
    offline: bool,
    /// Per kind: barrier and the number of posts still to pass through it
    barriers: HashMap<EkKind, (Arc<Barrier>, usize)>,
}

impl DirectoryState {
    fn check_online(&self) -> Result<(), DirectoryError> {
        if self.offline {
            return Err(DirectoryError::Network("directory offline".into()));
        }
        Ok(())
    }

    fn max_generation(&self, principal: &Principal) -> Option<EkGeneration> {
        self.statements.get(principal).and_then(|gens| gens.keys().next_back().copied())
    }
}

/// In-memory directory with server-side generation checks.
///
/// Device, user and team posts must be exactly the server maximum plus one.
/// Teambot posts only need to be above the maximum, because their generation
/// follows the team key rather than a counter of their own.
#[derive(Default)]
pub struct SimDirectory {
    state: Mutex<DirectoryState>,
}

impl SimDirectory {
    /// Empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` posts with a network error.
    pub fn fail_next_posts(&self, count: usize) {
        self.state.lock().failures_pending = count;
    }

    /// Make every request fail with a network error while `offline`.
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    /// Hold the next `parties` posts of `kind` until all of them have arrived.
    ///
    /// Lets a test line up concurrent publishers so they compute the same
    /// generation before any of them is accepted.
    pub fn set_post_barrier(&self, kind: EkKind, parties: usize) {
        self.state.lock().barriers.insert(kind, (Arc::new(Barrier::new(parties)), parties));
    }

    /// Published generations of `principal`, ascending.
    pub fn generations(&self, principal: &Principal) -> Vec<EkGeneration> {
        self.state
            .lock()
            .statements
            .get(principal)
            .map(|gens| gens.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Highest published generation of `principal`.
    pub fn max_generation(&self, principal: &Principal) -> Option<EkGeneration> {
        self.state.lock().max_generation(principal)
    }

    /// Statement published for `principal` at `generation`.
    pub fn statement(&self, principal: &Principal, generation: EkGeneration) -> Option<SignedStatement> {
        self.state.lock().statements.get(principal)?.get(&generation).cloned()
    }

    /// Number of posts accepted so far.
    pub fn post_count(&self) -> usize {
        self.state.lock().accepted_posts
    }

    /// Box stored for `recipient`, if any.
    pub fn box_for(
        &self,
        principal: &Principal,
        generation: EkGeneration,
        recipient: &Recipient,
    ) -> Option<EkBoxed> {
        self.state.lock().boxes.get(&(principal.clone(), generation, recipient.clone())).cloned()
    }

    /// Recipients of `principal`'s `generation`.
    pub fn recipients(&self, principal: &Principal, generation: EkGeneration) -> Vec<Recipient> {
        let mut recipients: Vec<Recipient> = self
            .state
            .lock()
            .boxes
            .keys()
            .filter(|(p, g, _)| p == principal && *g == generation)
            .map(|(_, _, r)| r.clone())
            .collect();
        recipients.sort();
        recipients
    }

    fn take_barrier(&self, kind: EkKind) -> Option<Arc<Barrier>> {
        let mut state = self.state.lock();
        let (barrier, remaining) = state.barriers.get_mut(&kind)?;
        let barrier = Arc::clone(barrier);
        *remaining -= 1;
        if *remaining == 0 {
            state.barriers.remove(&kind);
        }
        Some(barrier)
    }
}

#[async_trait]
impl DirectoryService for SimDirectory {
    async fn post_statement(&self, post: StatementPost) -> Result<(), DirectoryError> {
        if let Some(barrier) = self.take_barrier(post.principal.kind()) {
            barrier.wait().await;
        }

        let mut state = self.state.lock();
        state.check_online()?;
        if state.failures_pending > 0 {
            state.failures_pending -= 1;
            return Err(DirectoryError::Network("injected post failure".into()));
        }

        let claimed = post
            .statement
            .claimed_generation()
            .map_err(|e| DirectoryError::Rejected(e.to_string()))?;
        if claimed != post.generation || post.statement.kind != post.principal.kind() {
            return Err(DirectoryError::Rejected("statement does not match post".into()));
        }

        let server_max = state.max_generation(&post.principal);
        let accepted = match post.principal.kind() {
            EkKind::Teambot => server_max.is_none_or(|max| post.generation > max),
            EkKind::Device | EkKind::User | EkKind::Team => {
                EkGeneration::after(server_max).is_ok_and(|next| next == post.generation)
            },
        };
        if !accepted {
            debug!(principal = %post.principal, attempted = %post.generation, ?server_max, "post rejected");
            return Err(DirectoryError::GenerationConflict {
                principal: post.principal,
                attempted: post.generation,
                server_max,
            });
        }

        for boxed in post.boxes {
            let key = (post.principal.clone(), post.generation, boxed.recipient.clone());
            state.boxes.insert(key, boxed);
        }
        state
            .statements
            .entry(post.principal.clone())
            .or_default()
            .insert(post.generation, post.statement);
        state.accepted_posts += 1;
        debug!(principal = %post.principal, generation = %post.generation, "post accepted");
        Ok(())
    }

    async fn get_statement(
        &self,
        principal: &Principal,
    ) -> Result<Option<SignedStatement>, DirectoryError> {
        let state = self.state.lock();
        state.check_online()?;
        Ok(state
            .statements
            .get(principal)
            .and_then(|gens| gens.values().next_back())
            .cloned())
    }

    async fn get_statements(
        &self,
        principals: &[Principal],
    ) -> Result<HashMap<Principal, SignedStatement>, DirectoryError> {
        let state = self.state.lock();
        state.check_online()?;
        Ok(principals
            .iter()
            .filter_map(|principal| {
                let latest = state.statements.get(principal)?.values().next_back()?;
                Some((principal.clone(), latest.clone()))
            })
            .collect())
    }

    async fn get_box(
        &self,
        principal: &Principal,
        generation: EkGeneration,
        recipient: &Recipient,
    ) -> Result<Option<EkBoxed>, DirectoryError> {
        let state = self.state.lock();
        state.check_online()?;
        Ok(state.boxes.get(&(principal.clone(), generation, recipient.clone())).cloned())
    }
}

/// Merkle oracle stamping roots with the simulated wall clock.
pub struct SimMerkle {
    env: SimEnv,
    unavailable: Mutex<bool>,
}

impl SimMerkle {
    /// Oracle reading time from `env`.
    pub fn new(env: SimEnv) -> Self {
        Self { env, unavailable: Mutex::new(false) }
    }

    /// Make [`current_root`](MerkleOracle::current_root) fail while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.lock() = unavailable;
    }
}

#[async_trait]
impl MerkleOracle for SimMerkle {
    async fn current_root(&self) -> Result<MerkleRoot, EkError> {
        if *self.unavailable.lock() {
            return Err(EkError::Transient("merkle root unavailable".into()));
        }
        let ctime = self.env.wall_clock();
        let mut hash = [0u8; 32];
        hash[..8].copy_from_slice(&ctime.0.to_be_bytes());
        Ok(MerkleRoot { ctime, hash_meta: HashMeta(hash) })
    }
}
