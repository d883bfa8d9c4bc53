use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use crate::config::DEFAULT_TASK_LIST;
use crate::error::RemoteError;

/// Sign-in state shared by the sync engine and the aggregator.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    signed_in: watch::Sender<bool>,
    active_list: Mutex<String>,
}

impl Session {
    pub fn new(signed_in: bool) -> Self {
        let (signed_in, _) = watch::channel(signed_in);
        Self {
            inner: Arc::new(SessionInner {
                signed_in,
                active_list: Mutex::new(DEFAULT_TASK_LIST.to_string()),
            }),
        }
    }

    pub fn signed_out() -> Self {
        Self::new(false)
    }

    pub fn is_signed_in(&self) -> bool {
        *self.inner.signed_in.borrow()
    }

    pub fn sign_in(&self) {
        self.inner.signed_in.send_replace(true);
    }

    pub fn sign_out(&self) {
        self.inner.signed_in.send_replace(false);
    }

    /// Forces a sign-out after the remote side rejected our credentials.
    pub fn expire(&self) {
        if self.inner.signed_in.send_replace(false) {
            log::warn!("remote credentials expired; signed out until next sign-in");
        }
    }

    /// Signs out when `result` carries [`RemoteError::AuthExpired`].
    pub fn observe<T>(&self, result: &Result<T, RemoteError>) {
        if matches!(result, Err(RemoteError::AuthExpired)) {
            self.expire();
        }
    }

    pub fn watch(&self) -> watch::Receiver<bool> {
        self.inner.signed_in.subscribe()
    }

    pub fn active_list(&self) -> String {
        self.inner.active_list.lock().expect("session poisoned").clone()
    }

    pub fn set_active_list(&self, list_id: impl Into<String>) {
        *self.inner.active_list.lock().expect("session poisoned") = list_id.into();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_expiry_signs_out() {
        let session = Session::new(true);
        let mut rx = session.watch();
        session.observe::<()>(&Err(RemoteError::Transient("x".to_string())));
        assert!(session.is_signed_in());

        session.observe::<()>(&Err(RemoteError::AuthExpired));
        assert!(!session.is_signed_in());
        assert!(rx.has_changed().unwrap());
        assert!(!*rx.borrow_and_update());

        session.sign_in();
        assert!(session.is_signed_in());
    }

    #[test]
    fn active_list_defaults_and_changes() {
        let session = Session::signed_out();
        assert_eq!(session.active_list(), "@default");
        session.set_active_list("work");
        assert_eq!(session.clone().active_list(), "work");
    }
}
