use std::{collections::BTreeMap, sync::Arc};

use tracing::{debug, instrument};

use super::GenerationStore;
use crate::{
    config::KeyLifetimes,
    context::EkContext,
    env::Environment,
    error::{EkError, EphemeralKeyError, UnavailableReason},
    expiry::ExpiryPolicy,
    keyer::EphemeralKeyer,
    kv::KvStore,
    metadata::{EkBoxed, EphemeralKey},
    types::{EkGeneration, MerkleRoot, UnixTime},
};

/// Boxes of one kind addressed to this device, resolved into keys on read.
///
/// Boxes are stored rather than seeds so a reset of the lower level (a lost
/// device key) shows up as an unbox failure instead of a silently usable key.
pub struct BoxStorage<K: EphemeralKeyer> {
    keyer: K,
    store: GenerationStore<EkBoxed>,
}

impl<K: EphemeralKeyer> BoxStorage<K> {
    /// Storage for `keyer`'s kind persisted in `kv`.
    pub fn new(keyer: K, kv: Arc<dyn KvStore>) -> Self {
        let store = GenerationStore::new(keyer.kind(), kv);
        Self { keyer, store }
    }

    /// The keyer this storage delegates to.
    pub fn keyer(&self) -> &K {
        &self.keyer
    }

    /// Key `generation` of `id`.
    ///
    /// Serves the local box if there is one, otherwise fetches it from the
    /// directory. Unbox failures are cached for the generation; a successful
    /// fetch is persisted. `content_ctime` marks errors for content that has
    /// outlived the content lifetime.
    #[instrument(skip_all, fields(kind = %self.keyer.kind(), %id, %generation))]
    pub async fn get<E: Environment>(
        &self,
        ctx: &EkContext<E>,
        id: &K::Id,
        generation: EkGeneration,
        content_ctime: Option<UnixTime>,
    ) -> Result<EphemeralKey<K::Metadata>, EkError> {
        let content_expired = content_ctime
            .is_some_and(|ctime| ctx.config.lifetimes.content_expired(ctime, ctx.env.wall_clock()));

        self.resolve(ctx, id, generation, content_ctime)
            .await
            .map_err(|err| err.with_content_expired(content_expired))
    }

    async fn resolve<E: Environment>(
        &self,
        ctx: &EkContext<E>,
        id: &K::Id,
        generation: EkGeneration,
        content_ctime: Option<UnixTime>,
    ) -> Result<EphemeralKey<K::Metadata>, EkError> {
        let principal = self.keyer.principal(id);

        let (boxed, fetched) = match self.store.get(&principal, generation)? {
            Some(boxed) => (boxed, false),
            None => match self.keyer.fetch(ctx, id, generation).await? {
                Some(boxed) => (boxed, true),
                None => {
                    let err = EkError::Unbox(EphemeralKeyError::at_level(
                        self.keyer.kind(),
                        generation,
                        UnavailableReason::Missing,
                    ));
                    self.store.cache_error(&principal, generation, err.clone());
                    return Err(err);
                },
            },
        };

        match self.keyer.unbox(ctx, id, &boxed, content_ctime).await {
            Ok(key) => {
                if fetched {
                    debug!("caching fetched box");
                    self.store.put(&principal, generation, boxed)?;
                }
                Ok(key)
            },
            Err(err) => {
                if err.as_unbox().is_some() {
                    self.store.cache_error(&principal, generation, err.clone());
                }
                Err(err)
            },
        }
    }

    /// Persist our own box after publishing.
    pub fn put(&self, id: &K::Id, boxed: EkBoxed) -> Result<(), EkError> {
        self.store.put(&self.keyer.principal(id), boxed.generation, boxed)
    }

    /// Local box of `generation`, without unboxing.
    pub fn get_boxed(&self, id: &K::Id, generation: EkGeneration) -> Result<Option<EkBoxed>, EkError> {
        self.store.get(&self.keyer.principal(id), generation)
    }

    /// Every readable local box.
    pub fn get_all_boxed(&self, id: &K::Id) -> Result<BTreeMap<EkGeneration, EkBoxed>, EkError> {
        self.store.get_all(&self.keyer.principal(id))
    }

    /// Highest local generation.
    pub fn max_generation(
        &self,
        id: &K::Id,
        include_errs: bool,
    ) -> Result<Option<EkGeneration>, EkError> {
        self.store.max_generation(&self.keyer.principal(id), include_errs)
    }

    /// Remove one generation.
    pub fn delete(&self, id: &K::Id, generation: EkGeneration) -> Result<(), EkError> {
        self.store.delete(&self.keyer.principal(id), generation)
    }

    /// Delete expired generations of `id`.
    pub fn delete_expired(
        &self,
        id: &K::Id,
        merkle_root: &MerkleRoot,
        lifetimes: &KeyLifetimes,
    ) -> Result<Vec<EkGeneration>, EkError> {
        self.store.delete_expired(
            &self.keyer.principal(id),
            merkle_root.ctime,
            lifetimes,
            ExpiryPolicy::SingleOffset,
        )
    }

    /// Drop the in-memory index of `id`.
    pub fn clear_principal(&self, id: &K::Id) {
        self.store.clear_principal(&self.keyer.principal(id));
    }

    /// Drop every in-memory index.
    pub fn clear_cache(&self) {
        self.store.clear_cache();
    }
}
