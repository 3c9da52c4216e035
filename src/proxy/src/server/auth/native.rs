use crate::protocol::mysql::constants::{AuthPluginName, SCRAMBLE_SIZE};
use crate::protocol::mysql::packet::writers;
use crate::server::auth::{AuthResult, Authenticator, Exchange};

use hashbrown::HashMap;
use parking_lot::RwLock;
use sha1::{Digest, Sha1};

/// `mysql_native_password` token: SHA1(password) XOR SHA1(scramble +
/// SHA1(SHA1(password))).
pub fn native_password_token(password: &[u8], scramble: &[u8; SCRAMBLE_SIZE]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let stage1 = Sha1::digest(password);
    let stage2 = Sha1::digest(stage1);

    let mut hasher = Sha1::new();
    hasher.update(scramble);
    hasher.update(stage2);
    let mixed = hasher.finalize();

    stage1
        .iter()
        .zip(mixed.iter())
        .map(|(a, b)| a ^ b)
        .collect()
}

/// `mysql_native_password` verification against a user table of plain
/// passwords. Users without an entry are rejected.
pub struct NativePasswordAuthenticator {
    users: RwLock<HashMap<String, String>>,
}

impl Default for NativePasswordAuthenticator {
    fn default() -> Self {
        Self::new()
    }
}

impl NativePasswordAuthenticator {
    pub fn new() -> Self {
        NativePasswordAuthenticator {
            users: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_users<I: IntoIterator<Item = (String, String)>>(users: I) -> Self {
        NativePasswordAuthenticator {
            users: RwLock::new(users.into_iter().collect()),
        }
    }

    pub fn add_user(&self, user: &str, password: &str) {
        self.users
            .write()
            .insert(user.to_string(), password.to_string());
    }
}

impl Authenticator for NativePasswordAuthenticator {
    fn plugin_name(&self) -> &str {
        "mysql_native_password"
    }

    fn exchange(
        &self,
        client_plugin: &[u8],
        auth_response: &[u8],
        scramble: &[u8; SCRAMBLE_SIZE],
    ) -> Exchange {
        if client_plugin == self.plugin_name().as_bytes() || client_plugin.is_empty() {
            return Exchange::Ready;
        }
        // The client answered with a different plugin; ask it to redo the
        // exchange with ours.
        let _ = auth_response;
        Exchange::SendToClient(writers::auth_switch_request(
            &AuthPluginName::AuthNativePassword,
            scramble,
        ))
    }

    fn authenticate(
        &self,
        user: &str,
        token: &[u8],
        scramble: &[u8; SCRAMBLE_SIZE],
    ) -> AuthResult {
        let users = self.users.read();
        let Some(password) = users.get(user) else {
            return AuthResult::Failed(format!("Access denied for user '{user}'"));
        };
        let expected = native_password_token(password.as_bytes(), scramble);
        if expected == token {
            AuthResult::Ok
        } else {
            AuthResult::Failed(format!("Access denied for user '{user}' (wrong password)"))
        }
    }
}

/// Accepts any client. Useful when the proxy holds its own backend
/// credentials and client access is fenced off at the network level.
pub struct TrustAuthenticator;

impl Authenticator for TrustAuthenticator {
    fn plugin_name(&self) -> &str {
        "mysql_native_password"
    }

    fn exchange(
        &self,
        _client_plugin: &[u8],
        _auth_response: &[u8],
        _scramble: &[u8; SCRAMBLE_SIZE],
    ) -> Exchange {
        Exchange::Ready
    }

    fn authenticate(
        &self,
        _user: &str,
        _token: &[u8],
        _scramble: &[u8; SCRAMBLE_SIZE],
    ) -> AuthResult {
        AuthResult::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scramble() -> [u8; SCRAMBLE_SIZE] {
        let mut s = [0u8; SCRAMBLE_SIZE];
        for (i, b) in s.iter_mut().enumerate() {
            *b = (i as u8) + 40;
        }
        s
    }

    #[test]
    fn token_round_trips() {
        let auth = NativePasswordAuthenticator::new();
        auth.add_user("app", "sekrit");
        let s = scramble();
        let token = native_password_token(b"sekrit", &s);
        assert_eq!(token.len(), 20);
        assert_eq!(auth.authenticate("app", &token, &s), AuthResult::Ok);
    }

    #[test]
    fn wrong_password_rejected() {
        let auth = NativePasswordAuthenticator::new();
        auth.add_user("app", "sekrit");
        let s = scramble();
        let token = native_password_token(b"guess", &s);
        assert!(matches!(
            auth.authenticate("app", &token, &s),
            AuthResult::Failed(_)
        ));
    }

    #[test]
    fn unknown_user_rejected() {
        let auth = NativePasswordAuthenticator::new();
        let s = scramble();
        assert!(matches!(
            auth.authenticate("ghost", &[], &s),
            AuthResult::Failed(_)
        ));
    }

    #[test]
    fn foreign_plugin_triggers_auth_switch() {
        let auth = NativePasswordAuthenticator::new();
        let s = scramble();
        match auth.exchange(b"caching_sha2_password", &[], &s) {
            Exchange::SendToClient(packet) => {
                assert_eq!(packet[0], writers::AUTH_SWITCH_REQUEST);
            }
            other => panic!("expected auth switch, got {other:?}"),
        }
    }

    #[test]
    fn empty_password_has_empty_token() {
        assert!(native_password_token(b"", &scramble()).is_empty());
    }
}
