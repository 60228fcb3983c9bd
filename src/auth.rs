//! Session authentication.
//!
//! The server never validates credentials itself; it hands the account
//! name, domain, and response blocks --- together with the connection's
//! negotiate challenge --- to an [`Authenticator`] plug-in. The shipped
//! [`LocalAuth`] validates against configured accounts in plaintext mode
//! (the server advertises plaintext passwords in its negotiate security
//! mode); deployments wanting NTLM or GSS rounds plug in their own
//! implementation and return [`AuthOutcome::More`] until the exchange
//! completes.

use std::collections::HashMap;

use async_trait::async_trait;
use rand::RngCore;

use crate::status::Status;

/// Authenticated identity attached to a virtual circuit.
#[derive(Debug, Clone)]
pub struct Identity {
    pub account: String,
    pub domain: String,
    pub guest: bool,
    pub unix_uid: Option<u32>,
    pub unix_gids: Vec<u32>,
}

impl Identity {
    pub fn guest() -> Identity {
        Identity {
            account: String::new(),
            domain: String::new(),
            guest: true,
            unix_uid: None,
            unix_gids: Vec::new(),
        }
    }
}

/// Credentials extracted from a session-setup request.
#[derive(Debug)]
pub struct AuthRequest<'a> {
    pub account: &'a str,
    pub domain: &'a str,
    /// Case-insensitive (ANSI) password block.
    pub ansi_response: &'a [u8],
    /// Case-sensitive (Unicode/NT) password block.
    pub unicode_response: &'a [u8],
}

/// What an authentication round produced.
#[derive(Debug)]
pub enum AuthOutcome {
    Granted(Identity),
    /// Multi-round exchange: send this token back with
    /// `MORE_PROCESSING_REQUIRED`.
    More(Vec<u8>),
    Denied(Status),
}

/// Pluggable authenticator consulted by session setup.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate_user(
        &self,
        challenge: &[u8; 8],
        request: &AuthRequest<'_>,
    ) -> AuthOutcome;

    /// Whether share-mode (password-per-share) security is required; this
    /// server only grants user-level security, so a `true` here refuses
    /// the session.
    fn sharemode_authentication_required(&self) -> bool {
        false
    }

    /// Whether unknown accounts fall back to a guest identity.
    fn allow_guest(&self) -> bool;
}

/// Draws the 8-byte negotiate challenge from the OS RNG.
pub fn generate_challenge() -> [u8; 8] {
    let mut challenge = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut challenge);
    challenge
}

/// Account-list authenticator.
pub struct LocalAuth {
    accounts: HashMap<String, String>,
    allow_guest: bool,
}

impl LocalAuth {
    pub fn new(allow_guest: bool) -> LocalAuth {
        LocalAuth { accounts: HashMap::new(), allow_guest }
    }

    pub fn with_account(mut self, account: &str, password: &str) -> LocalAuth {
        self.accounts.insert(account.to_ascii_uppercase(), password.to_string());
        self
    }

    fn password_matches(&self, stored: &str, request: &AuthRequest<'_>) -> bool {
        // Response blocks may carry a trailing terminator; compare without.
        fn trim(block: &[u8]) -> &[u8] {
            match block.split_last() {
                Some((0, rest)) => rest,
                _ => block,
            }
        }
        let ansi = trim(request.ansi_response);
        let unicode = trim(request.unicode_response);
        ansi.eq_ignore_ascii_case(stored.as_bytes())
            || unicode == stored.as_bytes()
            || (stored.is_empty() && ansi.is_empty() && unicode.is_empty())
    }
}

#[async_trait]
impl Authenticator for LocalAuth {
    async fn authenticate_user(
        &self,
        _challenge: &[u8; 8],
        request: &AuthRequest<'_>,
    ) -> AuthOutcome {
        if request.account.is_empty() {
            return if self.allow_guest {
                AuthOutcome::Granted(Identity::guest())
            } else {
                AuthOutcome::Denied(Status::LOGON_FAILURE)
            };
        }
        match self.accounts.get(&request.account.to_ascii_uppercase()) {
            Some(stored) if self.password_matches(stored, request) => {
                AuthOutcome::Granted(Identity {
                    account: request.account.to_ascii_uppercase(),
                    domain: request.domain.to_ascii_uppercase(),
                    guest: false,
                    unix_uid: None,
                    unix_gids: Vec::new(),
                })
            }
            Some(_) => AuthOutcome::Denied(Status::LOGON_FAILURE),
            None if self.allow_guest => AuthOutcome::Granted(Identity::guest()),
            None => AuthOutcome::Denied(Status::LOGON_FAILURE),
        }
    }

    fn allow_guest(&self) -> bool {
        self.allow_guest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request<'a>(account: &'a str, password: &'a [u8]) -> AuthRequest<'a> {
        AuthRequest { account, domain: "WORKGROUP", ansi_response: password, unicode_response: &[] }
    }

    #[tokio::test]
    async fn known_account_with_password() {
        let auth = LocalAuth::new(false).with_account("alice", "secret");
        match auth.authenticate_user(&[0; 8], &request("ALICE", b"SECRET")).await {
            AuthOutcome::Granted(identity) => {
                assert_eq!(identity.account, "ALICE");
                assert!(!identity.guest);
            }
            other => panic!("expected grant, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn wrong_password_is_logon_failure() {
        let auth = LocalAuth::new(true).with_account("alice", "secret");
        // a known account with a bad password never falls back to guest
        match auth.authenticate_user(&[0; 8], &request("alice", b"nope")).await {
            AuthOutcome::Denied(status) => assert_eq!(status, Status::LOGON_FAILURE),
            other => panic!("expected denial, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_account_follows_guest_policy() {
        let guest_ok = LocalAuth::new(true);
        assert!(matches!(
            guest_ok.authenticate_user(&[0; 8], &request("", b"")).await,
            AuthOutcome::Granted(Identity { guest: true, .. })
        ));

        let no_guest = LocalAuth::new(false);
        assert!(matches!(
            no_guest.authenticate_user(&[0; 8], &request("", b"")).await,
            AuthOutcome::Denied(_)
        ));
    }

    #[test]
    fn challenges_vary() {
        assert_ne!(generate_challenge(), generate_challenge());
    }
}
