use std::{
    collections::{BTreeSet, HashSet},
    ops::Bound,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use crate::{GraphStoreError, GraphStoreResult, LayerId};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The set of committed layer ids.
///
/// Besides committed ids the index tracks ids whose registration is in flight, so two
/// registrations of the same id cannot both pass the existence check. Ids can be looked up by a
/// unique prefix.
#[derive(Debug, Clone, Default)]
pub struct IdIndex {
    inner: Arc<Mutex<IndexState>>,
}

/// A claim on an id held for the duration of one registration.
///
/// Dropping the reservation without calling [`commit`](Reservation::commit) releases the id.
#[derive(Debug)]
pub struct Reservation {
    index: IdIndex,
    id: LayerId,
    committed: bool,
}

#[derive(Debug, Default)]
struct IndexState {
    committed: BTreeSet<LayerId>,
    pending: HashSet<LayerId>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl IdIndex {
    /// Creates an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an index holding `ids`.
    pub fn from_ids(ids: impl IntoIterator<Item = LayerId>) -> Self {
        let index = Self::new();
        index.state().committed.extend(ids);
        index
    }

    /// Returns true if `id` is committed.
    pub fn contains(&self, id: &str) -> bool {
        self.state().committed.contains(id)
    }

    /// Claims `id` for a registration.
    ///
    /// Fails with `AlreadyExists` if `id` is committed or another registration holds it.
    pub fn reserve(&self, id: &LayerId) -> GraphStoreResult<Reservation> {
        let mut state = self.state();
        if state.committed.contains(id) || !state.pending.insert(id.clone()) {
            return Err(GraphStoreError::AlreadyExists(id.to_string()));
        }

        Ok(Reservation {
            index: self.clone(),
            id: id.clone(),
            committed: false,
        })
    }

    /// Removes `id`, returning whether it was committed.
    pub fn remove(&self, id: &LayerId) -> bool {
        self.state().committed.remove(id)
    }

    /// Resolves a full id or a unique prefix of one.
    ///
    /// ## Errors
    /// - [`GraphStoreError::LayerNotFound`] if nothing matches
    /// - [`GraphStoreError::AmbiguousId`] if the prefix matches more than one id
    pub fn get(&self, prefix: &str) -> GraphStoreResult<LayerId> {
        let state = self.state();
        if prefix.is_empty() {
            return Err(GraphStoreError::LayerNotFound(prefix.to_string()));
        }

        if let Some(id) = state.committed.get(prefix) {
            return Ok(id.clone());
        }

        let mut matches = state
            .committed
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|id| id.as_str().starts_with(prefix));

        match (matches.next(), matches.next()) {
            (Some(id), None) => Ok(id.clone()),
            (Some(_), Some(_)) => Err(GraphStoreError::AmbiguousId(prefix.to_string())),
            (None, _) => Err(GraphStoreError::LayerNotFound(prefix.to_string())),
        }
    }

    /// Returns the committed ids in order.
    pub fn list(&self) -> Vec<LayerId> {
        self.state().committed.iter().cloned().collect()
    }

    /// Returns the number of committed ids.
    pub fn len(&self) -> usize {
        self.state().committed.len()
    }

    /// Returns true if no id is committed.
    pub fn is_empty(&self) -> bool {
        self.state().committed.is_empty()
    }

    fn state(&self) -> MutexGuard<'_, IndexState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Reservation {
    /// Returns the reserved id.
    pub fn id(&self) -> &LayerId {
        &self.id
    }

    /// Moves the id from in flight to committed.
    pub fn commit(mut self) {
        let mut state = self.index.state();
        state.pending.remove(&self.id);
        state.committed.insert(self.id.clone());
        self.committed = true;
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.committed {
            self.index.state().pending.remove(&self.id);
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
