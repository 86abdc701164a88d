//! In-memory session store and login rate limiting.
//!
//! Tokens are 32 random bytes, hex-encoded, handed out on successful login
//! and valid for 24 hours. A token is bound to the client address that
//! created it; a request from a different address invalidates the session.
//! Failed logins are limited per address with a sliding window.

use rand::RngCore;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const ATTEMPT_WINDOW: Duration = Duration::from_secs(15 * 60);
const MAX_FAILED_ATTEMPTS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginError {
    /// Too many failed attempts from this address.
    RateLimited,
    /// Wrong password.
    Rejected,
    /// No admin password configured; login is disabled.
    Disabled,
}

#[derive(Debug)]
struct Session {
    created_at: Instant,
    client_addr: IpAddr,
}

#[derive(Debug)]
pub struct SessionStore {
    password: Option<String>,
    sessions: Mutex<HashMap<String, Session>>,
    failed_attempts: Mutex<HashMap<IpAddr, Vec<Instant>>>,
}

impl SessionStore {
    #[must_use]
    pub fn new(password: Option<String>) -> Self {
        Self {
            password,
            sessions: Mutex::new(HashMap::new()),
            failed_attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Attempt a login. On success returns a fresh token.
    pub fn login(&self, password: &str, addr: IpAddr) -> Result<String, LoginError> {
        let Some(expected) = &self.password else {
            return Err(LoginError::Disabled);
        };

        {
            let mut attempts = self.failed_attempts.lock().expect("attempts lock");
            let entry = attempts.entry(addr).or_default();
            entry.retain(|t| t.elapsed() < ATTEMPT_WINDOW);
            if entry.len() >= MAX_FAILED_ATTEMPTS {
                return Err(LoginError::RateLimited);
            }
            if password != expected {
                entry.push(Instant::now());
                return Err(LoginError::Rejected);
            }
            entry.clear();
        }

        let token = new_token();
        self.sessions.lock().expect("sessions lock").insert(
            token.clone(),
            Session {
                created_at: Instant::now(),
                client_addr: addr,
            },
        );
        Ok(token)
    }

    /// Whether `token` names a live session created from `addr`. Expired
    /// and address-mismatched sessions are dropped on the spot.
    pub fn validate(&self, token: &str, addr: IpAddr) -> bool {
        let mut sessions = self.sessions.lock().expect("sessions lock");
        match sessions.get(token) {
            Some(session)
                if session.created_at.elapsed() < SESSION_TTL
                    && session.client_addr == addr =>
            {
                true
            }
            Some(_) => {
                sessions.remove(token);
                false
            }
            None => false,
        }
    }
}

fn new_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
