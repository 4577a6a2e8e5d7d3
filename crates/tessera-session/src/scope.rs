//! Transaction scopes.
//!
//! The session holds at most one storage transaction. Scopes nest inside it:
//! an `Auto` scope joins the open transaction, a `New` scope opens a
//! savepoint, and either one begins the transaction when none is open.
//!
//! In-memory states are restored through the identity map's undo frames. The
//! bottom frame covers everything since the last commit; every nested scope
//! pushes a frame of its own, so rolling a savepoint scope back restores
//! exactly the states it touched.

use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tessera_core::{
    Connection, Cx, Error, Outcome, TransactionError, TransactionErrorKind, try_outcome,
};

use crate::Session;

/// How a new scope relates to an open transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionMode {
    /// Join the open transaction
    #[default]
    Auto,
    /// Run in a savepoint of the open transaction
    New,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ScopeKind {
    /// Began the transaction; completing it commits
    Root,
    Joined,
    Savepoint(String),
}

#[derive(Debug)]
struct Scope {
    id: u64,
    kind: ScopeKind,
}

/// An open transaction scope.
///
/// Finish it with [`Session::complete`] or [`Session::rollback_scope`]. A
/// token dropped without either is rolled back at the session's next
/// operation.
#[must_use = "a dropped scope is rolled back"]
#[derive(Debug)]
pub struct ScopeToken {
    id: u64,
    finished: bool,
    abandoned: Arc<Mutex<Vec<u64>>>,
}

impl ScopeToken {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for ScopeToken {
    fn drop(&mut self) {
        if !self.finished {
            self.abandoned
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(self.id);
        }
    }
}

/// Storage work queued by a rollback that happened outside async context.
#[derive(Debug)]
enum StorageUndo {
    Savepoint(String),
    Transaction,
}

/// Open scopes, innermost last.
#[derive(Debug, Default)]
pub(crate) struct ScopeStack {
    scopes: Vec<Scope>,
    next_id: u64,
    abandoned: Arc<Mutex<Vec<u64>>>,
    pending: Vec<StorageUndo>,
}

impl ScopeStack {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn depth(&self) -> usize {
        self.scopes.len()
    }

    fn open(&mut self, kind: ScopeKind) -> ScopeToken {
        let id = self.next_id;
        self.next_id += 1;
        self.scopes.push(Scope { id, kind });
        ScopeToken {
            id,
            finished: false,
            abandoned: Arc::clone(&self.abandoned),
        }
    }

    fn position(&self, id: u64) -> Option<usize> {
        self.scopes.iter().position(|s| s.id == id)
    }

    fn owns(&self, token: &ScopeToken) -> bool {
        Arc::ptr_eq(&self.abandoned, &token.abandoned)
    }

    fn take_abandoned(&self) -> Vec<u64> {
        std::mem::take(&mut *self.abandoned.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

fn scope_mismatch(message: impl Into<String>) -> Error {
    Error::Transaction(TransactionError {
        kind: TransactionErrorKind::ScopeMismatch,
        message: message.into(),
    })
}

impl<C: Connection> Session<C> {
    /// Whether the session's connection has an open transaction.
    pub fn in_transaction(&self) -> bool {
        self.conn.in_transaction()
    }

    /// Number of open scopes.
    pub fn scope_depth(&self) -> usize {
        self.scopes.depth()
    }

    /// Begin the session transaction. Does nothing when one is open.
    pub async fn begin(&mut self, cx: &Cx) -> Outcome<(), Error> {
        try_outcome!(self.settle(cx).await);
        self.begin_implicit(cx).await
    }

    pub(crate) async fn begin_implicit(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if self.conn.in_transaction() {
            return Outcome::Ok(());
        }
        try_outcome!(self.conn.begin(cx).await);
        tracing::debug!("transaction begun");
        Outcome::Ok(())
    }

    /// Open a transaction scope.
    ///
    /// Without an open transaction both modes begin one, and completing that
    /// scope commits it. Inside a transaction `Auto` joins it and `New` opens
    /// a savepoint.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn transaction(&mut self, cx: &Cx, mode: TransactionMode) -> Outcome<ScopeToken, Error> {
        try_outcome!(self.settle(cx).await);
        let kind = if !self.conn.in_transaction() {
            try_outcome!(self.conn.begin(cx).await);
            ScopeKind::Root
        } else if mode == TransactionMode::New {
            if !self.conn.capabilities().savepoints {
                return Outcome::Err(Error::invalid_operation(
                    "a New scope inside a transaction needs savepoint support",
                ));
            }
            let name = format!("tessera_sp_{}", self.scopes.next_id);
            try_outcome!(self.conn.savepoint(cx, &name).await);
            ScopeKind::Savepoint(name)
        } else {
            ScopeKind::Joined
        };
        if kind != ScopeKind::Root {
            self.states.push_frame();
        }
        let token = self.scopes.open(kind);
        tracing::debug!(scope = token.id, depth = self.scopes.depth(), "scope opened");
        Outcome::Ok(token)
    }

    /// Complete the innermost scope: flush, then commit or release it.
    ///
    /// Completing any other scope fails with `ScopeMismatch`; the token is
    /// dropped and its scope rolled back at the next operation. A failed
    /// flush rolls the scope back and returns the flush error.
    #[tracing::instrument(level = "debug", skip(self, cx, token), fields(scope = token.id))]
    pub async fn complete(&mut self, cx: &Cx, mut token: ScopeToken) -> Outcome<(), Error> {
        try_outcome!(self.settle(cx).await);
        if !self.scopes.owns(&token) {
            token.finished = true;
            return Outcome::Err(scope_mismatch("scope belongs to another session"));
        }
        let Some(pos) = self.scopes.position(token.id) else {
            token.finished = true;
            return Outcome::Err(scope_mismatch(format!("scope {} is not open", token.id)));
        };
        if pos + 1 != self.scopes.depth() {
            return Outcome::Err(scope_mismatch(format!(
                "scope {} completed while inner scopes are open",
                token.id
            )));
        }
        token.finished = true;

        match self.flush(cx).await {
            Outcome::Ok(_) => {}
            Outcome::Err(err) => {
                try_outcome!(self.unwind(cx, pos).await);
                return Outcome::Err(err);
            }
            Outcome::Cancelled(reason) => {
                try_outcome!(self.unwind(cx, pos).await);
                return Outcome::Cancelled(reason);
            }
            Outcome::Panicked(payload) => return Outcome::Panicked(payload),
        }

        let Some(scope) = self.scopes.scopes.pop() else {
            return Outcome::Ok(());
        };
        match scope.kind {
            ScopeKind::Root => try_outcome!(self.commit_storage(cx).await),
            ScopeKind::Savepoint(name) => {
                try_outcome!(self.conn.release_savepoint(cx, &name).await);
                self.states.merge_frame();
            }
            ScopeKind::Joined => self.states.merge_frame(),
        }
        tracing::debug!(scope = scope.id, "scope completed");
        Outcome::Ok(())
    }

    /// Roll a scope back, and every scope nested inside it.
    ///
    /// A savepoint scope reverts to its savepoint. Rolling back a scope that
    /// joined or began the transaction rolls back the whole transaction.
    #[tracing::instrument(level = "debug", skip(self, cx, token), fields(scope = token.id))]
    pub async fn rollback_scope(&mut self, cx: &Cx, mut token: ScopeToken) -> Outcome<(), Error> {
        token.finished = true;
        try_outcome!(self.settle(cx).await);
        if !self.scopes.owns(&token) {
            return Outcome::Err(scope_mismatch("scope belongs to another session"));
        }
        let Some(pos) = self.scopes.position(token.id) else {
            return Outcome::Err(scope_mismatch(format!("scope {} is not open", token.id)));
        };
        self.unwind(cx, pos).await
    }

    /// Flush and commit the session transaction, closing every open scope.
    pub async fn commit(&mut self, cx: &Cx) -> Outcome<(), Error> {
        try_outcome!(self.flush(cx).await);
        let open = self.scopes.depth();
        self.scopes.scopes.clear();
        if !self.conn.in_transaction() {
            self.reset_frames();
            return Outcome::Ok(());
        }
        try_outcome!(self.commit_storage(cx).await);
        tracing::info!(open_scopes = open, "transaction committed");
        Outcome::Ok(())
    }

    /// Roll back the session transaction and every change since the last
    /// commit, closing every open scope.
    pub async fn rollback(&mut self, cx: &Cx) -> Outcome<(), Error> {
        self.settle_local();
        self.scopes.scopes.clear();
        self.scopes.pending.clear();
        self.discard_frames();
        if self.conn.in_transaction() {
            try_outcome!(self.conn.rollback(cx).await);
        }
        tracing::info!("transaction rolled back");
        Outcome::Ok(())
    }

    /// Roll back scopes dropped without completion, in memory only; the
    /// storage side runs at the next [`Session::settle`].
    pub(crate) fn settle_local(&mut self) {
        for id in self.scopes.take_abandoned() {
            let Some(pos) = self.scopes.position(id) else {
                continue;
            };
            tracing::warn!(scope = id, "transaction scope dropped without completion; rolling back");
            self.unwind_local(pos);
        }
    }

    /// Finish the rollback of abandoned scopes.
    pub(crate) async fn settle(&mut self, cx: &Cx) -> Outcome<(), Error> {
        self.settle_local();
        self.run_storage_undo(cx).await
    }

    async fn unwind(&mut self, cx: &Cx, pos: usize) -> Outcome<(), Error> {
        self.unwind_local(pos);
        self.run_storage_undo(cx).await
    }

    /// Pop scopes down to `pos`, restoring their frames and queueing the
    /// storage rollback.
    fn unwind_local(&mut self, mut pos: usize) {
        let mut whole = false;
        while self.scopes.depth() > pos {
            let Some(scope) = self.scopes.scopes.pop() else {
                break;
            };
            match scope.kind {
                ScopeKind::Savepoint(name) => {
                    self.states.rollback_frame();
                    self.scopes.pending.push(StorageUndo::Savepoint(name));
                }
                ScopeKind::Joined => {
                    self.states.rollback_frame();
                    pos = 0;
                    whole = true;
                }
                ScopeKind::Root => whole = true,
            }
        }
        if whole {
            self.discard_frames();
            self.scopes.pending.push(StorageUndo::Transaction);
        }
    }

    async fn run_storage_undo(&mut self, cx: &Cx) -> Outcome<(), Error> {
        let pending = std::mem::take(&mut self.scopes.pending);
        if pending.is_empty() || !self.conn.in_transaction() {
            return Outcome::Ok(());
        }
        if pending.iter().any(|u| matches!(u, StorageUndo::Transaction)) {
            return self.conn.rollback(cx).await;
        }
        for undo in &pending {
            if let StorageUndo::Savepoint(name) = undo {
                try_outcome!(self.conn.rollback_to_savepoint(cx, name).await);
            }
        }
        Outcome::Ok(())
    }

    /// Commit storage; on failure the in-memory states revert to the last
    /// commit to match storage.
    async fn commit_storage(&mut self, cx: &Cx) -> Outcome<(), Error> {
        match self.conn.commit(cx).await {
            Outcome::Ok(()) => {
                self.reset_frames();
                Outcome::Ok(())
            }
            Outcome::Err(err) => {
                tracing::warn!(error = %err, "commit failed; discarding the transaction");
                self.scopes.scopes.clear();
                self.discard_frames();
                if self.conn.in_transaction() {
                    if let Outcome::Err(rollback) = self.conn.rollback(cx).await {
                        tracing::warn!(error = %rollback, "rollback after failed commit failed");
                    }
                }
                Outcome::Err(err)
            }
            Outcome::Cancelled(reason) => Outcome::Cancelled(reason),
            Outcome::Panicked(payload) => Outcome::Panicked(payload),
        }
    }

    /// The current states become the new baseline.
    fn reset_frames(&mut self) {
        self.states.clear_frames();
        self.states.push_frame();
    }

    /// Revert every change since the last commit.
    fn discard_frames(&mut self) {
        while self.states.frame_depth() > 0 {
            self.states.rollback_frame();
        }
        self.states.push_frame();
    }
}
