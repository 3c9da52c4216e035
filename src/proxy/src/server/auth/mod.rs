pub mod native;

use crate::protocol::mysql::constants::SCRAMBLE_SIZE;
use crate::worker::Worker;

/// What the authenticator wants next.
#[derive(Debug, PartialEq, Eq)]
pub enum Exchange {
    /// the exchange is finished, verify with [`Authenticator::authenticate`]
    Ready,
    /// another packet must go to the client first (e.g. AuthSwitchRequest)
    SendToClient(Vec<u8>),
    /// the exchange failed, close with this diagnostic
    Error(String),
}

#[derive(Debug, PartialEq, Eq)]
pub enum AuthResult {
    Ok,
    Failed(String),
}

/// The `exchange → authenticate` contract every authentication plugin
/// implements. `exchange` consumes client packets until it has a complete
/// token, `authenticate` verifies it.
pub trait Authenticator: Send + Sync {
    /// The plugin name announced in the initial handshake.
    fn plugin_name(&self) -> &str;

    fn exchange(
        &self,
        client_plugin: &[u8],
        auth_response: &[u8],
        scramble: &[u8; SCRAMBLE_SIZE],
    ) -> Exchange;

    fn authenticate(
        &self,
        user: &str,
        token: &[u8],
        scramble: &[u8; SCRAMBLE_SIZE],
    ) -> AuthResult;
}

/// Fresh scramble bytes for one handshake, drawn from the worker's random
/// engine. NUL and '$' never appear, some clients treat them specially.
pub fn gen_user_salt(worker: &mut Worker) -> [u8; SCRAMBLE_SIZE] {
    let mut salt = [0u8; SCRAMBLE_SIZE];
    worker.gen_random_bytes(&mut salt);
    for b in salt.iter_mut() {
        *b = (*b % 94) + 33;
        if *b == b'$' {
            *b += 1;
        }
    }
    salt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::{Worker, DEFAULT_MAX_EVENTS};

    #[test]
    fn salt_has_no_forbidden_bytes() {
        let mut worker = Worker::new(DEFAULT_MAX_EVENTS).unwrap();
        for _ in 0..32 {
            let salt = gen_user_salt(&mut worker);
            assert!(salt.iter().all(|b| *b != 0 && *b != b'$'));
            assert!(salt.iter().all(|b| b.is_ascii_graphic()));
        }
    }
}
