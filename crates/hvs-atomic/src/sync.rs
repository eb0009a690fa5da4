// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Waiting primitives used by the commit pipeline: data-dependency fences,
//! interrupt tokens, and the single-permit commit gate.

use std::sync::Arc;

use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::warn;

use crate::error::KmsError;

/// Producer side of a [`Fence`].
#[derive(Debug)]
pub struct FenceSignaler {
    tx: watch::Sender<bool>,
}

impl FenceSignaler {
    /// Marks the fence signalled, waking every waiter.
    pub fn signal(&self) {
        self.tx.send_replace(true);
    }
}

/// Buffer-ready dependency attached to a plane.
///
/// Cloning is cheap; every clone observes the same signal.
#[derive(Debug, Clone)]
pub struct Fence {
    rx: watch::Receiver<bool>,
}

impl Fence {
    /// Creates an unsignalled fence and its signaller.
    #[must_use]
    pub fn new() -> (FenceSignaler, Self) {
        let (tx, rx) = watch::channel(false);
        (FenceSignaler { tx }, Self { rx })
    }

    /// A fence that is already signalled.
    #[must_use]
    pub fn signaled() -> Self {
        let (_tx, rx) = watch::channel(true);
        Self { rx }
    }

    /// Returns `true` once the fence has been signalled.
    #[must_use]
    pub fn is_signaled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Waits for the fence.
    ///
    /// A signaller dropped without signalling releases its waiters; the
    /// producer is gone and nothing else can signal it.
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|signaled| *signaled).await.is_err() {
            warn!("fence signaller dropped before signalling");
        }
    }
}

/// Handle used to interrupt waits performed on behalf of a caller.
#[derive(Debug, Clone)]
pub struct InterruptHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl InterruptHandle {
    /// Interrupts every current and future wait of the paired [`Interrupt`].
    pub fn interrupt(&self) {
        self.tx.send_replace(true);
    }
}

/// Interrupt token passed to blocking commit calls.
#[derive(Debug, Clone)]
pub struct Interrupt {
    rx: Option<watch::Receiver<bool>>,
}

impl Interrupt {
    /// Creates a token and the handle that triggers it.
    #[must_use]
    pub fn new() -> (InterruptHandle, Self) {
        let (tx, rx) = watch::channel(false);
        (InterruptHandle { tx: Arc::new(tx) }, Self { rx: Some(rx) })
    }

    /// A token that is never triggered.
    #[must_use]
    pub const fn never() -> Self {
        Self { rx: None }
    }

    /// Returns `true` once the paired handle fired.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.rx.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Resolves when the paired handle fires.
    ///
    /// Pends forever if every handle is dropped without firing.
    pub async fn interrupted(&self) {
        if let Some(mut rx) = self.rx.clone() {
            if rx.wait_for(|fired| *fired).await.is_ok() {
                return;
            }
        }
        std::future::pending::<()>().await;
    }

    /// Runs `fut` unless the token fires first.
    ///
    /// # Errors
    /// [`KmsError::Interrupted`] if the token fired before `fut` completed.
    pub async fn run<F: std::future::Future>(&self, fut: F) -> Result<F::Output, KmsError> {
        tokio::select! {
            biased;
            () = self.interrupted() => Err(KmsError::Interrupted),
            out = fut => Ok(out),
        }
    }
}

/// Single-permit gate bounding hardware application to one transaction.
#[derive(Debug, Clone)]
pub(crate) struct CommitGate {
    semaphore: Arc<Semaphore>,
}

/// Proof of holding the [`CommitGate`]; released on drop.
#[derive(Debug)]
pub(crate) struct CommitPermit {
    _permit: OwnedSemaphorePermit,
}

impl CommitGate {
    pub(crate) fn new() -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(1)),
        }
    }

    /// Acquires the gate, giving up if `interrupt` fires first.
    ///
    /// An interrupted wait holds nothing. A closed gate yields
    /// [`KmsError::DeviceClosed`].
    pub(crate) async fn acquire(&self, interrupt: &Interrupt) -> Result<CommitPermit, KmsError> {
        let permit = interrupt
            .run(Arc::clone(&self.semaphore).acquire_owned())
            .await?
            .map_err(|_| KmsError::DeviceClosed)?;
        Ok(CommitPermit { _permit: permit })
    }

    /// Acquires the gate only if nobody holds it.
    pub(crate) fn try_acquire(&self) -> Option<CommitPermit> {
        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => Some(CommitPermit { _permit: permit }),
            Err(TryAcquireError::NoPermits | TryAcquireError::Closed) => None,
        }
    }

    /// Returns `true` while a commit holds the gate.
    pub(crate) fn is_held(&self) -> bool {
        self.semaphore.available_permits() == 0
    }

    /// Refuses every later acquisition.
    pub(crate) fn close(&self) {
        self.semaphore.close();
    }
}
