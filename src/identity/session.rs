use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use parking_lot::RwLock;
use base64::Engine;
use crate::tprintln;

use super::principal::Identity;

pub type SessionToken = String;

/// Issues opaque tokens for an identity at sign-up/sign-in.
pub trait CredentialIssuer: Send + Sync {
    fn create_token(&self, identity: &Identity) -> SessionToken;
}

#[derive(Debug, Clone)]
pub struct Session {
    pub token: SessionToken,
    pub identity: Identity,
    pub issued_at: Instant,
    pub expires_at: Instant,
}

fn gen_token() -> String {
    // 256-bit random token base64url without padding
    let mut buf = [0u8; 32];
    if getrandom::getrandom(&mut buf).is_err() {
        // fall back to two v4 uuids, still 244 random bits
        let a = uuid::Uuid::new_v4();
        let b = uuid::Uuid::new_v4();
        buf[..16].copy_from_slice(a.as_bytes());
        buf[16..].copy_from_slice(b.as_bytes());
    }
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(buf)
}

/// In-memory token table. One instance is created at process start and shared
/// through server state.
#[derive(Debug)]
pub struct SessionManager {
    pub ttl: Duration,
    sessions: RwLock<HashMap<SessionToken, Session>>,
    user_index: RwLock<HashMap<String, HashSet<SessionToken>>>,
}

impl Default for SessionManager {
    fn default() -> Self { Self::new(Duration::from_secs(60 * 60)) }
}

impl SessionManager {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, sessions: RwLock::new(HashMap::new()), user_index: RwLock::new(HashMap::new()) }
    }

    pub fn issue(&self, identity: Identity) -> Session {
        let now = Instant::now();
        self.prune_expired(now);
        let token = gen_token();
        let sess = Session {
            token: token.clone(),
            identity: identity.clone(),
            issued_at: now,
            expires_at: now + self.ttl,
        };
        self.sessions.write().insert(token.clone(), sess.clone());
        self.user_index.write().entry(identity.id.clone()).or_default().insert(token);
        tprintln!("session.issue user={} ttl_secs={}", identity.id, self.ttl.as_secs());
        sess
    }

    pub fn validate(&self, token: &str) -> Option<Identity> {
        let now = Instant::now();
        let expired = {
            let map = self.sessions.read();
            match map.get(token) {
                Some(s) if s.expires_at > now => return Some(s.identity.clone()),
                Some(_) => true,
                None => false,
            }
        };
        if expired {
            self.logout(token);
        }
        None
    }

    pub fn logout(&self, token: &str) -> bool {
        let Some(sess) = self.sessions.write().remove(token) else { return false; };
        if let Some(set) = self.user_index.write().get_mut(&sess.identity.id) {
            set.remove(token);
        }
        true
    }

    pub fn revoke_user(&self, user_id: &str) -> usize {
        let tokens = self.user_index.write().remove(user_id).unwrap_or_default();
        let mut s = self.sessions.write();
        let count = tokens.iter().filter(|t| s.remove(*t).is_some()).count();
        tprintln!("session.revoke user={} count={}", user_id, count);
        count
    }

    /// Drop every session that expired at or before `now`, including ones
    /// never presented again. Returns how many were removed.
    pub fn prune_expired(&self, now: Instant) -> usize {
        let mut sessions = self.sessions.write();
        let expired: Vec<Session> = sessions.values().filter(|s| s.expires_at <= now).cloned().collect();
        if expired.is_empty() {
            return 0;
        }
        let mut index = self.user_index.write();
        for sess in &expired {
            sessions.remove(&sess.token);
            if let Some(set) = index.get_mut(&sess.identity.id) {
                set.remove(&sess.token);
                if set.is_empty() {
                    index.remove(&sess.identity.id);
                }
            }
        }
        tprintln!("session.prune count={}", expired.len());
        expired.len()
    }

    pub fn active_sessions(&self) -> usize { self.sessions.read().len() }
}

impl CredentialIssuer for SessionManager {
    fn create_token(&self, identity: &Identity) -> SessionToken {
        self.issue(identity.clone()).token
    }
}
