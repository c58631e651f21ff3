//! Connection bookkeeping shared by the collaborator-backed stages.
//!
//! A transient failure earns exactly one reconnect attempt. If that attempt fails
//! too, the link is degraded for the rest of the session and the owning stage
//! switches to its fallback behaviour.

use crate::collaborator::CollaboratorError;
use crate::pipeline::error::StageError;
use crate::pipeline::stage::StageHealth;
use std::future::Future;

pub(crate) struct Link<C> {
    stage: &'static str,
    conn: Option<C>,
    degraded: Option<String>,
    connect_attempts: u32,
}

impl<C> Link<C> {
    pub(crate) fn new(stage: &'static str) -> Self {
        Self {
            stage,
            conn: None,
            degraded: None,
            connect_attempts: 0,
        }
    }

    pub(crate) fn get(&mut self) -> Option<&mut C> {
        self.conn.as_mut()
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    /// Detaches the connection so the caller can close it.
    pub(crate) fn take(&mut self) -> Option<C> {
        self.conn.take()
    }

    pub(crate) fn is_degraded(&self) -> bool {
        self.degraded.is_some()
    }

    pub(crate) fn health(&self) -> StageHealth {
        match &self.degraded {
            Some(reason) => StageHealth::Degraded {
                reason: reason.clone(),
            },
            None => StageHealth::Healthy,
        }
    }

    /// Connection attempts made so far, initial one included.
    pub(crate) fn connect_attempts(&self) -> u32 {
        self.connect_attempts
    }

    /// Error to return while degraded.
    pub(crate) fn degraded_error(&self) -> StageError {
        StageError::Degraded(self.degraded.clone().unwrap_or_default())
    }

    pub(crate) fn degrade(&mut self, reason: impl Into<String>) -> StageError {
        let reason = reason.into();
        tracing::warn!(stage = self.stage, %reason, "collaborator unavailable, stage degraded");
        self.conn = None;
        self.degraded = Some(reason.clone());
        StageError::Degraded(reason)
    }

    /// Initial connection. A transient failure is followed by a single reconnect.
    pub(crate) async fn open<F, Fut>(&mut self, connect: F) -> Result<(), StageError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<C, CollaboratorError>>,
    {
        match self.attempt(&connect).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_transient() => {
                tracing::warn!(stage = self.stage, error = %e, "connect failed, retrying once");
                self.reconnect(connect).await
            }
            Err(e) => Err(self.degrade(e.to_string())),
        }
    }

    /// The single reconnect attempt after a transient failure.
    pub(crate) async fn reconnect<F, Fut>(&mut self, connect: F) -> Result<(), StageError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<C, CollaboratorError>>,
    {
        if self.is_degraded() {
            return Err(self.degraded_error());
        }
        tracing::info!(stage = self.stage, "reconnecting to collaborator");
        match self.attempt(&connect).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.degrade(format!("reconnect failed: {e}"))),
        }
    }

    async fn attempt<F, Fut>(&mut self, connect: &F) -> Result<(), CollaboratorError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<C, CollaboratorError>>,
    {
        self.connect_attempts += 1;
        let conn = connect().await?;
        self.conn = Some(conn);
        Ok(())
    }
}
