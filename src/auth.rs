//! Attach-time authorization.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use log::debug;

use crate::error::{Error, Result};
use crate::protocol::{Qid, QidType};

/// State behind an authorization descriptor.
pub struct AuthState {
    user: String,
    namespace: String,
    qid: Qid,
    credential: Mutex<Vec<u8>>,
    verified: AtomicBool,
}

impl AuthState {
    pub(crate) fn new(user: &str, namespace: &str, path: u64) -> Self {
        Self {
            user: user.to_string(),
            namespace: namespace.to_string(),
            qid: Qid::new(QidType::AUTH, 0, path),
            credential: Mutex::new(Vec::new()),
            verified: AtomicBool::new(false),
        }
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn qid(&self) -> Qid {
        self.qid
    }

    pub fn credential(&self) -> Vec<u8> {
        match self.credential.lock() {
            Ok(buf) => buf.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn is_verified(&self) -> bool {
        self.verified.load(Ordering::Acquire)
    }

    pub fn mark_verified(&self) {
        self.verified.store(true, Ordering::Release);
    }

    fn append(&self, data: &[u8]) {
        match self.credential.lock() {
            Ok(mut buf) => buf.extend_from_slice(data),
            Err(poisoned) => poisoned.into_inner().extend_from_slice(data),
        }
    }
}

/// Decides whether, and how, a connection proves who it attaches as.
pub trait Authenticator: Send + Sync {
    /// Whether attach must name a verified authorization descriptor.
    fn required(&self) -> bool;

    /// Consume credential bytes written to an authorization descriptor.
    fn write(&self, state: &AuthState, data: &[u8]) -> Result<usize>;

    /// Authorize `user` to attach with the given authorization state.
    fn verify(&self, state: &AuthState, user: &str, namespace: &str) -> Result<()>;
}

/// Authorization is switched off; auth requests are refused.
pub struct NoAuth;

impl Authenticator for NoAuth {
    fn required(&self) -> bool {
        false
    }

    fn write(&self, _state: &AuthState, _data: &[u8]) -> Result<usize> {
        Err(Error::Auth(String::from("authentication not required")))
    }

    fn verify(&self, _state: &AuthState, _user: &str, _namespace: &str) -> Result<()> {
        Ok(())
    }
}

/// Requires the auth exchange but accepts any credential.
pub struct TrustingAuth;

impl Authenticator for TrustingAuth {
    fn required(&self) -> bool {
        true
    }

    fn write(&self, state: &AuthState, data: &[u8]) -> Result<usize> {
        state.append(data);
        state.mark_verified();
        debug!("accepted {} credential bytes for {}", data.len(), state.user());
        Ok(data.len())
    }

    fn verify(&self, state: &AuthState, user: &str, namespace: &str) -> Result<()> {
        if !state.is_verified() {
            return Err(Error::Auth(String::from("no credential presented")));
        }
        if state.user() != user || state.namespace() != namespace {
            return Err(Error::Auth(format!("descriptor was issued to {}", state.user())));
        }
        Ok(())
    }
}
