//! Bearer-token sessions.

use std::collections::HashMap;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::RwLock;

use crate::security::session_token;

#[derive(Debug, Clone)]
pub struct Session {
    pub account_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Unauthorized")]
pub struct Unauthorized;

/// Maps session tokens to account ids. Sessions never expire unless a TTL is
/// configured; logout revokes them explicitly.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Session>>,
    ttl: Option<TimeDelta>,
}

impl SessionRegistry {
    pub fn new(ttl: Option<std::time::Duration>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            ttl: ttl.and_then(|ttl| TimeDelta::from_std(ttl).ok()),
        }
    }

    pub fn create_session(&self, account_id: &str) -> String {
        let token = session_token();
        self.sessions.write().insert(
            token.clone(),
            Session {
                account_id: account_id.to_owned(),
                created_at: Utc::now(),
            },
        );
        token
    }

    pub fn authenticate(&self, token: Option<&str>) -> Result<String, Unauthorized> {
        self.authenticate_at(token, Utc::now())
    }

    pub fn authenticate_at(
        &self,
        token: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<String, Unauthorized> {
        let token = token.filter(|t| !t.is_empty()).ok_or(Unauthorized)?;
        let sessions = self.sessions.read();
        let session = sessions.get(token).ok_or(Unauthorized)?;
        if self.is_expired(session, now) {
            return Err(Unauthorized);
        }
        Ok(session.account_id.clone())
    }

    /// Logout. Returns whether the token was known.
    pub fn revoke(&self, token: &str) -> bool {
        self.sessions.write().remove(token).is_some()
    }

    /// Drops expired sessions and returns how many were removed.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        if self.ttl.is_none() {
            return 0;
        }
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, session| !self.is_expired(session, now));
        before - sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_expired(&self, session: &Session, now: DateTime<Utc>) -> bool {
        self.ttl
            .is_some_and(|ttl| now.signed_duration_since(session.created_at) >= ttl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn tokens_resolve_to_their_account() {
        let registry = SessionRegistry::new(None);
        let a = registry.create_session("a@test.com");
        let b = registry.create_session("b@test.com");
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.authenticate(Some(&a)).unwrap(), "a@test.com");
        assert_eq!(registry.authenticate(Some(&b)).unwrap(), "b@test.com");
    }

    #[test]
    fn missing_or_unknown_tokens_are_rejected() {
        let registry = SessionRegistry::new(None);
        registry.create_session("a@test.com");
        assert_eq!(registry.authenticate(None), Err(Unauthorized));
        assert_eq!(registry.authenticate(Some("")), Err(Unauthorized));
        assert_eq!(registry.authenticate(Some("bogus")), Err(Unauthorized));
    }

    #[test]
    fn revoke_logs_out() {
        let registry = SessionRegistry::new(None);
        let token = registry.create_session("a@test.com");
        assert!(registry.revoke(&token));
        assert!(!registry.revoke(&token));
        assert_eq!(registry.authenticate(Some(&token)), Err(Unauthorized));
        assert!(registry.is_empty());
    }

    #[test]
    fn ttl_expires_sessions() {
        let registry = SessionRegistry::new(Some(Duration::from_secs(60)));
        let token = registry.create_session("a@test.com");
        let now = Utc::now();
        assert!(registry.authenticate_at(Some(&token), now).is_ok());
        let later = now + TimeDelta::seconds(61);
        assert_eq!(registry.authenticate_at(Some(&token), later), Err(Unauthorized));

        assert_eq!(registry.purge_expired(now), 0);
        assert_eq!(registry.purge_expired(later), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn without_ttl_nothing_is_purged() {
        let registry = SessionRegistry::new(None);
        registry.create_session("a@test.com");
        let far_future = Utc::now() + TimeDelta::days(365);
        assert_eq!(registry.purge_expired(far_future), 0);
        assert_eq!(registry.len(), 1);
    }
}
