//! Extension points that run at session start and end.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use crate::bus::NotificationBus;
use crate::updates::BusItem;

/// What a hook may use while it runs.
#[derive(Clone)]
pub struct HookContext {
    pub session_id: Uuid,
    pub bus: NotificationBus<BusItem>,
    pub cancellation: CancellationToken,
}

#[async_trait]
pub trait SessionLifetimeHook: Send + Sync {
    fn name(&self) -> &str;

    async fn on_session_start(&self, _ctx: &HookContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_session_end(&self, _ctx: &HookContext) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPhase {
    Start,
    End,
}

/// Run every hook for `phase`, draining the bus before and after each one.
/// Hook failures and drain timeouts are logged and do not stop the others.
pub(crate) async fn run_hooks(
    hooks: &[Arc<dyn SessionLifetimeHook>],
    phase: HookPhase,
    ctx: &HookContext,
    drain_timeout: Duration,
) {
    for hook in hooks {
        drain(&ctx.bus, drain_timeout, hook.name()).await;
        let result = match phase {
            HookPhase::Start => hook.on_session_start(ctx).await,
            HookPhase::End => hook.on_session_end(ctx).await,
        };
        if let Err(e) = result {
            warn!(hook = hook.name(), ?phase, "session hook failed: {:#}", e);
        }
        drain(&ctx.bus, drain_timeout, hook.name()).await;
    }
}

async fn drain(bus: &NotificationBus<BusItem>, timeout: Duration, hook: &str) {
    if let Err(e) = bus.drain(timeout).await {
        warn!(hook, "{}", e);
    }
}
