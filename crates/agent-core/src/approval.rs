//! Approval Gate
//!
//! Human-in-the-loop checkpoint consulted before a tool classified as
//! [`DangerClass::RequiresApproval`](crate::tool::DangerClass) runs.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::tool::ToolArguments;

/// A pending request to run a dangerous tool
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub session_id: String,
    pub tool_name: String,
    pub arguments: ToolArguments,
}

/// Decides whether a dangerous tool call may run
#[async_trait]
pub trait ApprovalGate: Send + Sync {
    async fn request_approval(&self, request: &ApprovalRequest) -> bool;
}

/// Refuses every dangerous call
#[derive(Clone, Copy, Debug, Default)]
pub struct DenyAll;

#[async_trait]
impl ApprovalGate for DenyAll {
    async fn request_approval(&self, request: &ApprovalRequest) -> bool {
        tracing::info!(
            session_id = %request.session_id,
            tool = %request.tool_name,
            "Denying dangerous tool call (deny-all policy)"
        );
        false
    }
}

/// Allows every dangerous call
#[derive(Clone, Copy, Debug, Default)]
pub struct ApproveAll;

#[async_trait]
impl ApprovalGate for ApproveAll {
    async fn request_approval(&self, request: &ApprovalRequest) -> bool {
        tracing::info!(
            session_id = %request.session_id,
            tool = %request.tool_name,
            "Approving dangerous tool call (approve-all policy)"
        );
        true
    }
}

type Callback = Arc<dyn Fn(ApprovalRequest) -> BoxFuture<'static, bool> + Send + Sync>;

/// Wraps an async closure supplied by the embedding application
#[derive(Clone)]
pub struct CallbackApproval {
    callback: Callback,
}

impl CallbackApproval {
    pub fn new<F, Fut>(callback: F) -> Self
    where
        F: Fn(ApprovalRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        Self {
            callback: Arc::new(move |request| callback(request).boxed()),
        }
    }
}

#[async_trait]
impl ApprovalGate for CallbackApproval {
    async fn request_approval(&self, request: &ApprovalRequest) -> bool {
        (self.callback)(request.clone()).await
    }
}

/// An approval request waiting on a front-end decision
#[derive(Debug)]
pub struct PendingApproval {
    pub request: ApprovalRequest,
    responder: oneshot::Sender<bool>,
}

impl PendingApproval {
    pub fn approve(self) {
        let _ = self.responder.send(true);
    }

    pub fn deny(self) {
        let _ = self.responder.send(false);
    }

    pub fn resolve(self, approved: bool) {
        let _ = self.responder.send(approved);
    }
}

/// Forwards requests to a UI or CLI over a channel.
///
/// A closed channel or a dropped [`PendingApproval`] counts as a denial.
#[derive(Clone, Debug)]
pub struct ChannelApproval {
    tx: mpsc::Sender<PendingApproval>,
}

impl ChannelApproval {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<PendingApproval>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ApprovalGate for ChannelApproval {
    async fn request_approval(&self, request: &ApprovalRequest) -> bool {
        let (responder, decision) = oneshot::channel();
        let pending = PendingApproval {
            request: request.clone(),
            responder,
        };

        if self.tx.send(pending).await.is_err() {
            tracing::warn!(tool = %request.tool_name, "Approval channel closed; denying");
            return false;
        }

        decision.await.unwrap_or(false)
    }
}

/// Configurable default gate
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalPolicy {
    #[default]
    Deny,
    Approve,
}

impl ApprovalPolicy {
    pub fn gate(self) -> Arc<dyn ApprovalGate> {
        match self {
            Self::Deny => Arc::new(DenyAll),
            Self::Approve => Arc::new(ApproveAll),
        }
    }
}

impl std::str::FromStr for ApprovalPolicy {
    type Err = crate::error::AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "deny" | "deny_all" => Ok(Self::Deny),
            "approve" | "approve_all" => Ok(Self::Approve),
            other => Err(crate::error::AgentError::Config(format!(
                "Unknown approval policy '{other}' (expected 'deny' or 'approve')"
            ))),
        }
    }
}
