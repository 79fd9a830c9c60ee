use crate::{
    backend::ExpenseBackend,
    error::{ExpenseError, Result, ToolError},
    models::{
        CallerContext, ExpenseEntry, ExpenseType, PaymentType, Provider, Report, ServiceToken,
        UserSession,
    },
    oauth::AuthorizationFlow,
    registry::{ToolDescriptor, ToolRegistry, ToolVisibility},
    retry::RetryPolicy,
    token_manager::BackendTokenManager,
};
use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

/// Backend access for handlers: every call is made with the current service
/// token, refreshed once on a 401 and retried with backoff on transient
/// failures.
#[derive(Clone)]
pub struct AuthorizedBackend {
    backend: Arc<dyn ExpenseBackend>,
    tokens: Arc<BackendTokenManager>,
    retry: RetryPolicy,
}

impl AuthorizedBackend {
    pub fn new(
        backend: Arc<dyn ExpenseBackend>,
        tokens: Arc<BackendTokenManager>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            backend,
            tokens,
            retry,
        }
    }

    pub fn tokens(&self) -> &Arc<BackendTokenManager> {
        &self.tokens
    }

    async fn call<T, F>(&self, operation: &'static str, f: F) -> Result<T>
    where
        F: Fn(Arc<dyn ExpenseBackend>, ServiceToken) -> BoxFuture<'static, Result<T>>,
    {
        let this = self;
        let f = &f;
        self.retry
            .run(operation, move || async move {
                let token = this.tokens.get_token().await?;
                match f(this.backend.clone(), token.clone()).await {
                    Err(ExpenseError::Unauthorized) => {
                        warn!(operation, "Backend rejected service token, refreshing once");
                        this.tokens.invalidate(&token);
                        let token = this.tokens.get_token().await?;
                        f(this.backend.clone(), token).await
                    }
                    other => other,
                }
            })
            .await
    }

    pub async fn list_reports(&self, limit: u32) -> Result<Vec<Report>> {
        self.call("list_reports", move |backend, token| {
            async move { backend.list_reports(&token, limit).await }.boxed()
        })
        .await
    }

    pub async fn get_report(&self, report_id: &str) -> Result<Report> {
        let report_id = report_id.to_string();
        self.call("get_report", move |backend, token| {
            let report_id = report_id.clone();
            async move { backend.get_report(&token, &report_id).await }.boxed()
        })
        .await
    }

    pub async fn check_connection(&self) -> Result<bool> {
        self.call("check_connection", |backend, token| {
            async move { backend.check_connection(&token).await }.boxed()
        })
        .await
    }

    pub async fn list_expenses(
        &self,
        report_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ExpenseEntry>> {
        let report_id = report_id.to_string();
        self.call("list_expenses", move |backend, token| {
            let report_id = report_id.clone();
            async move {
                backend
                    .list_expenses(&token, &report_id, limit, offset)
                    .await
            }
            .boxed()
        })
        .await
    }

    pub async fn get_expense(&self, expense_id: &str) -> Result<ExpenseEntry> {
        let expense_id = expense_id.to_string();
        self.call("get_expense", move |backend, token| {
            let expense_id = expense_id.clone();
            async move { backend.get_expense(&token, &expense_id).await }.boxed()
        })
        .await
    }

    pub async fn get_expense_types(&self) -> Result<Vec<ExpenseType>> {
        self.call("get_expense_types", |backend, token| {
            async move { backend.get_expense_types(&token).await }.boxed()
        })
        .await
    }

    pub async fn get_payment_types(&self) -> Result<Vec<PaymentType>> {
        self.call("get_payment_types", |backend, token| {
            async move { backend.get_payment_types(&token).await }.boxed()
        })
        .await
    }
}

/// Everything a handler may use for one invocation.
#[derive(Clone)]
pub struct ToolContext {
    pub backend: AuthorizedBackend,
    /// Resolved user session; always `Some` for protected tools
    pub session: Option<UserSession>,
    pub caller: CallerContext,
    /// Configured user-level provider, `None` for the `none` variant
    pub oauth_provider: Option<Provider>,
}

/// Routes tool invocations to handlers with the right credential context.
pub struct Dispatcher {
    registry: Arc<ToolRegistry>,
    backend: AuthorizedBackend,
    flow: Arc<AuthorizationFlow>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ToolRegistry>,
        backend: AuthorizedBackend,
        flow: Arc<AuthorizationFlow>,
    ) -> Self {
        Self {
            registry,
            backend,
            flow,
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn flow(&self) -> &Arc<AuthorizationFlow> {
        &self.flow
    }

    /// Invoke `tool_name` with `args` on behalf of `caller`
    pub async fn invoke(
        &self,
        tool_name: &str,
        args: Value,
        caller: &CallerContext,
    ) -> std::result::Result<Value, ToolError> {
        let Some(descriptor) = self.registry.get(tool_name) else {
            warn!(tool = tool_name, "Unknown tool requested");
            return Err(ExpenseError::UnknownTool(tool_name.to_string()).into());
        };

        let span = info_span!(
            "tool_call",
            tool = %descriptor.name,
            visibility = %descriptor.visibility,
            connection = %caller.connection_id,
        );
        async move {
            let started = Instant::now();
            let outcome = self.run(descriptor, args, caller).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;
            match &outcome {
                Ok(_) => info!(elapsed_ms, "Tool call succeeded"),
                Err(e) => info!(elapsed_ms, kind = %e.kind(), error = %e, "Tool call failed"),
            }
            outcome.map_err(ToolError::from)
        }
        .instrument(span)
        .await
    }

    async fn run(
        &self,
        descriptor: &ToolDescriptor,
        args: Value,
        caller: &CallerContext,
    ) -> Result<Value> {
        let session = match descriptor.visibility {
            ToolVisibility::Public => None,
            ToolVisibility::Protected => Some(self.authenticate(caller).await?),
        };

        let ctx = ToolContext {
            backend: self.backend.clone(),
            session,
            caller: caller.clone(),
            oauth_provider: self.flow.provider_kind(),
        };
        descriptor.handler.call(&ctx, args).await
    }

    /// Resolve a valid session for a protected call, or fail with a login URL
    async fn authenticate(&self, caller: &CallerContext) -> Result<UserSession> {
        if !self.flow.is_configured() {
            return Err(ExpenseError::OAuthNotConfigured);
        }

        let bound = self.flow.user_for(&caller.connection_id);
        if let Some(user_id) = caller.user_id.as_ref().or(bound.as_ref()) {
            if let Some(session) = self.resolve_session(user_id).await? {
                return Ok(session);
            }
        }
        // The bound user's session is gone; stale bindings would only linger
        if let Some(user_id) = &bound {
            let dropped = self.flow.unbind_user(user_id);
            debug!(user_id = %user_id, dropped, "Dropped bindings of a user without session");
        }

        let login_url = match self.flow.begin(Some(&caller.connection_id)) {
            Ok(url) => Some(url),
            Err(e) => {
                warn!(error = %e, "Could not start OAuth login");
                None
            }
        };
        Err(ExpenseError::auth_required(login_url))
    }

    async fn resolve_session(&self, user_id: &str) -> Result<Option<UserSession>> {
        let sessions = self.flow.sessions();
        if let Some(session) = sessions.get(user_id).await? {
            return Ok(Some(session));
        }
        if !sessions.has_refreshable(user_id).await? {
            debug!(user_id, "No session for user");
            return Ok(None);
        }

        match sessions.refresh(user_id, self.flow.provider()).await {
            Ok(session) => Ok(Some(session)),
            Err(ExpenseError::Storage(msg)) => Err(ExpenseError::Storage(msg)),
            Err(e) => {
                info!(user_id, error = %e, "Session refresh failed, login required");
                Ok(None)
            }
        }
    }
}
