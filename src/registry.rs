//! In-flight calls keyed by host-assigned call id.

use crate::call::CallHandle;
use crate::{BridgeError, CallId};

use parking_lot::RwLock;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;

/// Thread-safe store of live calls.
///
/// Every operation takes the lock once. A call that has already closed but
/// whose driver has not removed it yet is treated as absent by `cancel` and
/// `finish`.
#[derive(Debug, Default)]
pub struct CallRegistry {
    calls: RwLock<HashMap<CallId, Arc<CallHandle>>>,
}

impl CallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a call. Fails if the id is already taken.
    pub fn insert(&self, call: Arc<CallHandle>) -> Result<(), BridgeError> {
        match self.calls.write().entry(call.id()) {
            Entry::Occupied(_) => Err(BridgeError::DuplicateCall(call.id())),
            Entry::Vacant(entry) => {
                entry.insert(call);
                Ok(())
            }
        }
    }

    /// Look up the call registered under `id`, registering the one built by
    /// `create` if there is none.
    ///
    /// `create` runs under the lock, so concurrent callers never create two
    /// calls for one id. Its extra output is returned only when it ran.
    pub fn get_or_try_insert<F, R>(
        &self,
        id: CallId,
        create: F,
    ) -> Result<(Arc<CallHandle>, Option<R>), BridgeError>
    where
        F: FnOnce() -> Result<(Arc<CallHandle>, R), BridgeError>,
    {
        match self.calls.write().entry(id) {
            Entry::Occupied(entry) => Ok((entry.get().clone(), None)),
            Entry::Vacant(entry) => {
                let (call, extra) = create()?;
                entry.insert(call.clone());
                Ok((call, Some(extra)))
            }
        }
    }

    pub fn get(&self, id: CallId) -> Option<Arc<CallHandle>> {
        self.calls.read().get(&id).cloned()
    }

    /// Remove `call`, but only if it is still the one registered under its id.
    pub fn remove(&self, call: &Arc<CallHandle>) -> bool {
        let mut calls = self.calls.write();
        match calls.get(&call.id()) {
            Some(current) if Arc::ptr_eq(current, call) => {
                calls.remove(&call.id());
                true
            }
            _ => false,
        }
    }

    /// Cancel the call registered under `id`. Returns whether a live call was
    /// found. The entry stays until the call's close is delivered.
    pub fn cancel(&self, id: CallId) -> bool {
        match self.get(id) {
            Some(call) => call.cancel(),
            None => false,
        }
    }

    /// Half-close the call registered under `id`. Returns whether a live call
    /// was found.
    pub fn finish(&self, id: CallId) -> bool {
        match self.get(id) {
            Some(call) => call.half_close(),
            None => false,
        }
    }

    pub fn contains(&self, id: CallId) -> bool {
        self.calls.read().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.calls.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.read().is_empty()
    }
}
