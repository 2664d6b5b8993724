//! Account collaborator: identity fields for login and the cached credentials.

use parking_lot::Mutex;

use crate::protocol::PlayerProfile;

/// Identity fields copied into the login packet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountSnapshot {
    pub account_id: i32,
    pub user_id: i32,
    pub account_name: String,
    pub profile: PlayerProfile,
}

/// Read access to the local account plus the two credential clears the session performs.
pub trait AccountProvider: Send + Sync {
    fn snapshot(&self) -> AccountSnapshot;

    /// Cached auth token; empty if none.
    fn auth_token(&self) -> String;

    /// Called after the server rejected the token.
    fn clear_auth_token(&self);

    fn admin_password(&self) -> Option<String>;

    /// Called after the server rejected the admin password.
    fn clear_admin_password(&self);
}

/// In-memory account, filled by the host.
#[derive(Default)]
pub struct AccountStore {
    snapshot: Mutex<AccountSnapshot>,
    token: Mutex<String>,
    admin_password: Mutex<Option<String>>,
}

impl AccountStore {
    pub fn new(snapshot: AccountSnapshot) -> Self {
        Self {
            snapshot: Mutex::new(snapshot),
            ..Default::default()
        }
    }

    pub fn set_snapshot(&self, snapshot: AccountSnapshot) {
        *self.snapshot.lock() = snapshot;
    }

    pub fn set_auth_token(&self, token: impl Into<String>) {
        *self.token.lock() = token.into();
    }

    pub fn set_admin_password(&self, password: Option<String>) {
        *self.admin_password.lock() = password.filter(|p| !p.is_empty());
    }
}

impl AccountProvider for AccountStore {
    fn snapshot(&self) -> AccountSnapshot {
        self.snapshot.lock().clone()
    }

    fn auth_token(&self) -> String {
        self.token.lock().clone()
    }

    fn clear_auth_token(&self) {
        self.token.lock().clear();
    }

    fn admin_password(&self) -> Option<String> {
        self.admin_password.lock().clone()
    }

    fn clear_admin_password(&self) {
        *self.admin_password.lock() = None;
    }
}
