//! Session lifecycle hooks around the filter registry

use crate::services::FilterRegistry;
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Context changes the filter layer reacts to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    LoggedIn { user: String },
    LoggedOut,
    ProjectChanged(String),
    ReferenceChanged(String),
}

/// Owns the registry for one user session.
///
/// Filters only make sense against the project and reference they were built
/// for, so a change of either (or a logout) clears them.
pub struct FilterSession {
    registry: Arc<FilterRegistry>,
    login_attempt: Mutex<Option<CancellationToken>>,
}

impl FilterSession {
    pub fn new(registry: Arc<FilterRegistry>) -> Self {
        Self {
            registry,
            login_attempt: Mutex::new(None),
        }
    }

    pub fn registry(&self) -> &Arc<FilterRegistry> {
        &self.registry
    }

    pub fn handle(&self, event: SessionEvent) {
        match event {
            SessionEvent::LoggedIn { user } => {
                info!(%user, "session started");
                self.login_attempt
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take();
            }
            SessionEvent::LoggedOut => {
                info!("session ended, clearing filters");
                self.cancel_current_login_attempt();
                self.registry.remove_all_filters();
            }
            SessionEvent::ProjectChanged(project) => {
                info!(%project, "project changed, clearing filters");
                self.registry.remove_all_filters();
            }
            SessionEvent::ReferenceChanged(reference) => {
                info!(%reference, "reference changed, clearing filters");
                self.registry.remove_all_filters();
            }
        }
    }

    /// Start a login attempt, cancelling whichever attempt is still running.
    pub fn begin_login_attempt(&self) -> CancellationToken {
        let token = CancellationToken::new();
        let previous = self
            .login_attempt
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(token.clone());
        if let Some(previous) = previous {
            debug!("login attempt superseded");
            previous.cancel();
        }
        token
    }

    /// Cancel the running login attempt, if any. Safe to call repeatedly.
    pub fn cancel_current_login_attempt(&self) {
        if let Some(token) = self
            .login_attempt
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            debug!("login attempt cancelled");
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Filter, ScopeId};

    fn session_with_filter() -> FilterSession {
        let session = FilterSession::new(Arc::new(FilterRegistry::default()));
        session
            .registry()
            .add_filter(Filter::equality("gene", "BRCA1"), ScopeId(1));
        session
    }

    #[test]
    fn context_changes_clear_filters() {
        for event in [
            SessionEvent::LoggedOut,
            SessionEvent::ProjectChanged("cohort-a".into()),
            SessionEvent::ReferenceChanged("hg38".into()),
        ] {
            let session = session_with_filter();
            session.handle(event);
            assert!(!session.registry().has_filters_applied());
        }
    }

    #[test]
    fn login_keeps_filters() {
        let session = session_with_filter();
        session.handle(SessionEvent::LoggedIn { user: "alice".into() });
        assert!(session.registry().has_filters_applied());
    }

    #[test]
    fn new_login_attempt_cancels_previous() {
        let session = FilterSession::new(Arc::new(FilterRegistry::default()));
        let first = session.begin_login_attempt();
        let second = session.begin_login_attempt();
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
    }

    #[test]
    fn cancel_is_idempotent() {
        let session = FilterSession::new(Arc::new(FilterRegistry::default()));
        let token = session.begin_login_attempt();
        session.cancel_current_login_attempt();
        session.cancel_current_login_attempt();
        assert!(token.is_cancelled());
    }

    #[test]
    fn successful_login_retires_the_attempt() {
        let session = FilterSession::new(Arc::new(FilterRegistry::default()));
        let token = session.begin_login_attempt();
        session.handle(SessionEvent::LoggedIn { user: "alice".into() });
        session.cancel_current_login_attempt();
        assert!(!token.is_cancelled());
    }
}
