//! Override session: one extension capturing every request.
//!
//! While an extension holds the session, the router sends it all traffic
//! regardless of host. Exactly one holder at a time; enabling replaces the
//! previous holder (last write wins) and disabling only succeeds for the
//! current holder, so a stale control page cannot release someone else's
//! session.

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;

#[derive(Debug, Clone, Default)]
pub struct OverrideSession {
    owner: Arc<RwLock<Option<String>>>,
}

impl OverrideSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current holder, if any.
    pub async fn active(&self) -> Option<String> {
        self.owner.read().await.clone()
    }

    pub async fn is_held_by(&self, extension: &str) -> bool {
        self.owner.read().await.as_deref() == Some(extension)
    }

    /// Hand the session to `extension`. Returns the holder it replaced.
    pub async fn enable(&self, extension: &str) -> Option<String> {
        let mut owner = self.owner.write().await;
        let previous = owner.replace(extension.to_string());
        match &previous {
            Some(prev) if prev != extension => {
                info!(from = %prev, to = extension, "Override session replaced");
            }
            Some(_) => {}
            None => info!(extension, "Override session enabled"),
        }
        previous
    }

    /// Release the session if `extension` holds it.
    pub async fn disable(&self, extension: &str) -> bool {
        let mut owner = self.owner.write().await;
        if owner.as_deref() == Some(extension) {
            *owner = None;
            info!(extension, "Override session disabled");
            true
        } else {
            false
        }
    }

    /// Release unconditionally.
    pub async fn clear(&self) {
        self.owner.write().await.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn starts_inactive() {
        let session = OverrideSession::new();
        assert_eq!(session.active().await, None);
        assert!(!session.disable("waybackmachine").await);
    }

    #[tokio::test]
    async fn enable_replaces_previous_holder() {
        let session = OverrideSession::new();
        assert_eq!(session.enable("websimulator").await, None);
        assert_eq!(session.enable("waybackmachine").await.as_deref(), Some("websimulator"));
        assert_eq!(session.active().await.as_deref(), Some("waybackmachine"));
    }

    #[tokio::test]
    async fn only_the_holder_can_disable() {
        let session = OverrideSession::new();
        session.enable("websimulator").await;
        session.enable("waybackmachine").await;

        assert!(!session.disable("websimulator").await);
        assert!(session.is_held_by("waybackmachine").await);
        assert!(session.disable("waybackmachine").await);
        assert_eq!(session.active().await, None);
    }

    #[tokio::test]
    async fn concurrent_enables_leave_exactly_one_holder() {
        let session = OverrideSession::new();
        let mut tasks = Vec::new();
        for name in ["a", "b", "c", "d"] {
            let session = session.clone();
            tasks.push(tokio::spawn(async move { session.enable(name).await }));
        }
        let mut replaced = 0;
        for task in tasks {
            if task.await.unwrap().is_some() {
                replaced += 1;
            }
        }
        // Every enable but the first saw a previous holder.
        assert_eq!(replaced, 3);
        let holder = session.active().await.unwrap();
        assert!(["a", "b", "c", "d"].contains(&holder.as_str()));
    }
}
