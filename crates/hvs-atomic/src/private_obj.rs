// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Versioned copy-on-write container for state shared between transactions.
//!
//! A [`PrivateObj`] owns exactly one published version of its state. The
//! published `Arc` is never mutated: a transaction takes a private copy with
//! [`PrivateObj::duplicate`], edits it, and either hands it back through
//! [`PrivateObj::publish`] (commit) or drops it (abort). Readers outside a
//! transaction only ever see the published version.
//!
//! Each object carries its own modeset lock. It is held while the copy is
//! taken and released straight after; later mutation is transaction-local.
//! Every publish bumps the version so a copy taken from a version that has
//! since been replaced can be detected before it overwrites newer state.

use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::error::KmsError;

#[derive(Debug)]
struct Published<S> {
    version: u64,
    state: Arc<S>,
}

/// A shared resource participating in transactions.
#[derive(Debug)]
pub struct PrivateObj<S> {
    name: &'static str,
    modeset_lock: Mutex<()>,
    current: RwLock<Published<S>>,
}

/// A transaction's private copy of a [`PrivateObj`] state.
///
/// Keeps the version it was taken from (the transaction's *old* state) next to
/// the mutable *new* state.
#[derive(Debug, Clone)]
pub struct PrivateState<S> {
    base_version: u64,
    old: Arc<S>,
    new: S,
}

impl<S> PrivateState<S> {
    /// State as published when the copy was taken.
    #[must_use]
    pub fn old(&self) -> &S {
        &self.old
    }

    /// State this transaction will publish.
    #[must_use]
    pub fn new_state(&self) -> &S {
        &self.new
    }

    /// Mutable access to the state this transaction will publish.
    pub fn new_mut(&mut self) -> &mut S {
        &mut self.new
    }

    /// Published version the copy was taken from.
    #[must_use]
    pub fn base_version(&self) -> u64 {
        self.base_version
    }
}

impl<S: Clone> PrivateObj<S> {
    /// Registers a new object whose first published version is `initial`.
    pub fn new(name: &'static str, initial: S) -> Self {
        Self {
            name,
            modeset_lock: Mutex::new(()),
            current: RwLock::new(Published {
                version: 0,
                state: Arc::new(initial),
            }),
        }
    }

    /// Name used in logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The published version.
    #[must_use]
    pub fn current(&self) -> Arc<S> {
        let published = self.current.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&published.state)
    }

    /// Version counter of the published state.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .version
    }

    /// Takes a private copy of the published state under the modeset lock.
    pub fn duplicate(&self) -> PrivateState<S> {
        let _modeset = self
            .modeset_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let published = self.current.read().unwrap_or_else(PoisonError::into_inner);
        PrivateState {
            base_version: published.version,
            old: Arc::clone(&published.state),
            new: (*published.state).clone(),
        }
    }

    /// Returns the transaction's copy in `slot`, duplicating on first use.
    pub(crate) fn get_or_duplicate<'a>(&self, slot: &'a mut Option<PrivateState<S>>) -> &'a mut S {
        slot.get_or_insert_with(|| self.duplicate()).new_mut()
    }

    /// Returns `true` if `private` was taken from the published version.
    #[must_use]
    pub fn is_current(&self, private: &PrivateState<S>) -> bool {
        self.version() == private.base_version
    }

    /// Publishes `private` as the new current version.
    ///
    /// Returns the version it replaced. Callers serialize publishing (the
    /// commit gate) and check [`PrivateObj::is_current`] first, so a mismatch
    /// here means a publish happened outside the gate.
    ///
    /// # Errors
    /// [`KmsError::FatalInconsistency`] if the published version moved since
    /// the copy was taken.
    pub fn publish(&self, private: PrivateState<S>) -> Result<Arc<S>, KmsError> {
        let _modeset = self
            .modeset_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut published = self.current.write().unwrap_or_else(PoisonError::into_inner);
        if published.version != private.base_version {
            return Err(KmsError::FatalInconsistency(
                "private state published over a newer version",
            ));
        }
        published.version += 1;
        Ok(std::mem::replace(
            &mut published.state,
            Arc::new(private.new),
        ))
    }
}
