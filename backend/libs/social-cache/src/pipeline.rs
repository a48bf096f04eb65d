//! Request pipeline
//!
//! Handlers run behind an ordered list of [`Interceptor`] stages. Every
//! stage's `before` hook runs in order and may reject the request; the handler
//! runs; then every `after` hook runs in reverse order with the outcome.
//! Permission checks therefore happen before execution and activity logging
//! after it.

use crate::model::UserId;
use async_trait::async_trait;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

/// Permission codenames, `{resource}:{action}`.
pub mod permissions {
    pub const POST_CREATE: &str = "post:create";
    pub const POST_READ: &str = "post:read";
    pub const POST_UPDATE: &str = "post:update";
    pub const POST_DELETE: &str = "post:delete";
    pub const COMMENT_CREATE: &str = "comment:create";
    pub const COMMENT_DELETE: &str = "comment:delete";
    pub const LIKE_CREATE: &str = "like:create";
    pub const LIKE_DELETE: &str = "like:delete";
    pub const SHARE_CREATE: &str = "share:create";
    pub const FOLLOW_CREATE: &str = "follow:create";
    pub const FOLLOW_DELETE: &str = "follow:delete";
    pub const ADMIN_ACCESS: &str = "admin:access";
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Authentication required")]
    Unauthenticated,

    #[error("Permission denied. Required permission: {permission}")]
    PermissionDenied { permission: String },

    #[error(transparent)]
    Handler(#[from] anyhow::Error),
}

/// The caller of an operation.
#[derive(Debug, Clone, Default)]
pub struct Principal {
    user_id: Option<UserId>,
    permissions: HashSet<String>,
}

impl Principal {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn user<I, S>(user_id: UserId, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            user_id: Some(user_id),
            permissions: permissions.into_iter().map(Into::into).collect(),
        }
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.user_id
    }

    pub fn is_authenticated(&self) -> bool {
        self.user_id.is_some()
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.is_authenticated() && self.permissions.contains(permission)
    }
}

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub operation: String,
    pub principal: Principal,
}

impl RequestContext {
    pub fn new(operation: impl Into<String>, principal: Principal) -> Self {
        Self {
            operation: operation.into(),
            principal,
        }
    }
}

#[async_trait]
pub trait Interceptor: Send + Sync {
    /// Runs before the handler. An error aborts the request.
    async fn before(&self, _ctx: &RequestContext) -> Result<(), PipelineError> {
        Ok(())
    }

    /// Runs after the handler, `error` set when it failed.
    async fn after(&self, _ctx: &RequestContext, _elapsed: Duration, _error: Option<&anyhow::Error>) {}
}

/// Audit entry emitted by [`RequirePermission`].
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityRecord {
    pub user_id: Option<UserId>,
    pub action: String,
    pub resource: String,
    pub description: String,
    pub execution_time: Option<Duration>,
}

#[async_trait]
pub trait ActivitySink: Send + Sync {
    async fn record(&self, record: ActivityRecord);
}

/// Writes activity records to the `activity` tracing target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingActivitySink;

#[async_trait]
impl ActivitySink for TracingActivitySink {
    async fn record(&self, record: ActivityRecord) {
        info!(
            target: "activity",
            user_id = ?record.user_id,
            action = %record.action,
            resource = %record.resource,
            execution_time_ms = record.execution_time.map(|d| d.as_millis() as u64),
            "{}",
            record.description
        );
    }
}

/// Rejects callers lacking `permission` and records the outcome.
pub struct RequirePermission {
    permission: String,
    resource: Option<String>,
    log_activity: bool,
    sink: Arc<dyn ActivitySink>,
}

impl RequirePermission {
    pub fn new(permission: impl Into<String>, sink: Arc<dyn ActivitySink>) -> Self {
        Self {
            permission: permission.into(),
            resource: None,
            log_activity: true,
            sink,
        }
    }

    pub fn admin(sink: Arc<dyn ActivitySink>) -> Self {
        Self::new(permissions::ADMIN_ACCESS, sink).resource("admin")
    }

    pub fn resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    pub fn log_activity(mut self, enabled: bool) -> Self {
        self.log_activity = enabled;
        self
    }

    /// Explicit resource, else the permission's resource segment.
    fn resource_name(&self) -> String {
        match &self.resource {
            Some(resource) => resource.clone(),
            None => self
                .permission
                .split(':')
                .next()
                .unwrap_or_default()
                .to_string(),
        }
    }

    fn action_name(&self) -> String {
        match self.permission.split_once(':') {
            Some((_, action)) => action.to_string(),
            None => "action".to_string(),
        }
    }
}

#[async_trait]
impl Interceptor for RequirePermission {
    async fn before(&self, ctx: &RequestContext) -> Result<(), PipelineError> {
        if !ctx.principal.is_authenticated() {
            return Err(PipelineError::Unauthenticated);
        }
        if ctx.principal.has_permission(&self.permission) {
            return Ok(());
        }

        warn!(
            user_id = ?ctx.principal.user_id(),
            operation = %ctx.operation,
            permission = %self.permission,
            "Permission denied"
        );
        if self.log_activity {
            self.sink
                .record(ActivityRecord {
                    user_id: ctx.principal.user_id(),
                    action: "unauthorized_access".to_string(),
                    resource: self.resource_name(),
                    description: format!(
                        "Unauthorized access attempt for permission: {}",
                        self.permission
                    ),
                    execution_time: None,
                })
                .await;
        }
        Err(PipelineError::PermissionDenied {
            permission: self.permission.clone(),
        })
    }

    async fn after(&self, ctx: &RequestContext, elapsed: Duration, error: Option<&anyhow::Error>) {
        if !self.log_activity {
            return;
        }
        let record = match error {
            Some(e) => ActivityRecord {
                user_id: ctx.principal.user_id(),
                action: "error".to_string(),
                resource: self.resource_name(),
                description: format!("Error in {}: {:#}", ctx.operation, e),
                execution_time: Some(elapsed),
            },
            // Successful calls are only audited for an explicit resource.
            None if self.resource.is_some() => ActivityRecord {
                user_id: ctx.principal.user_id(),
                action: self.action_name(),
                resource: self.resource_name(),
                description: format!("Successfully executed {}", ctx.operation),
                execution_time: Some(elapsed),
            },
            None => return,
        };
        self.sink.record(record).await;
    }
}

/// Logs operations slower than `min_log_time` and every failure.
pub struct MonitorPerformance {
    min_log_time: Duration,
}

impl Default for MonitorPerformance {
    fn default() -> Self {
        Self::new(Duration::from_millis(1))
    }
}

impl MonitorPerformance {
    pub fn new(min_log_time: Duration) -> Self {
        Self { min_log_time }
    }
}

#[async_trait]
impl Interceptor for MonitorPerformance {
    async fn after(&self, ctx: &RequestContext, elapsed: Duration, error: Option<&anyhow::Error>) {
        let user_id = ctx.principal.user_id();
        match error {
            Some(e) => warn!(
                operation = %ctx.operation,
                user_id = ?user_id,
                elapsed_ms = elapsed.as_millis() as u64,
                error = %e,
                "Operation failed"
            ),
            None if elapsed >= self.min_log_time => info!(
                operation = %ctx.operation,
                user_id = ?user_id,
                elapsed_ms = elapsed.as_millis() as u64,
                "Operation completed"
            ),
            None => {}
        }
    }
}

#[derive(Clone, Default)]
pub struct Pipeline {
    stages: Vec<Arc<dyn Interceptor>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(mut self, interceptor: impl Interceptor + 'static) -> Self {
        self.stages.push(Arc::new(interceptor));
        self
    }

    pub async fn run<T, Fut>(&self, ctx: &RequestContext, handler: Fut) -> Result<T, PipelineError>
    where
        Fut: Future<Output = anyhow::Result<T>>,
    {
        for stage in &self.stages {
            stage.before(ctx).await?;
        }

        let started = Instant::now();
        let result = handler.await;
        let elapsed = started.elapsed();

        for stage in self.stages.iter().rev() {
            stage.after(ctx, elapsed, result.as_ref().err()).await;
        }

        result.map_err(PipelineError::Handler)
    }
}
