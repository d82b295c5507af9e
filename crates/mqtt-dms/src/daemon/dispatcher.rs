//! Inbound message handling.

use crate::daemon::resolver::CommandResolver;
use crate::daemon::supervisor::ProcessSupervisor;
use std::sync::Arc;

/// Routes inbound messages to the supervisor.
pub struct Dispatcher {
    resolver: CommandResolver,
    supervisor: Arc<ProcessSupervisor>,
}

impl Dispatcher {
    pub fn new(resolver: CommandResolver, supervisor: Arc<ProcessSupervisor>) -> Self {
        Self {
            resolver,
            supervisor,
        }
    }

    pub fn subscriptions(&self) -> &[String] {
        self.resolver.subscriptions()
    }

    /// Execute the action configured for `topic`. The payload carries no meaning.
    pub async fn dispatch(&self, topic: &str) -> bool {
        let key = self.resolver.action_key(topic);
        let spec = self.resolver.lookup(key);

        let ok = self.supervisor.execute_action(key, &spec).await;
        if ok {
            log::debug!("Executed command for {}", topic);
        } else {
            log::warn!("Failed to execute command for {}", topic);
        }
        ok
    }
}
