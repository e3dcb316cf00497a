//! Login throttling and client identification.
//!
//! Only the two credential endpoints consult [`LoginThrottle`]; every other
//! route relies on the session gate alone.

use axum::http::{HeaderMap, HeaderValue};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Length of the login attempt window.
pub const LOGIN_WINDOW_SECS: u64 = 60;

/// Clients idle this long are dropped from the attempt map.
const IDLE_CLIENT_SWEEP_SECS: u64 = 300;

/// Key used when nothing identifies the caller.
pub const UNKNOWN_CLIENT: &str = "unknown";

const FORWARDED_FOR: &str = "X-Forwarded-For";
const REAL_IP: &str = "X-Real-IP";

#[derive(Debug)]
struct Attempts {
    by_client: HashMap<String, Vec<Instant>>,
    last_sweep: Instant,
}

/// Per-client sliding window over login attempts. A budget of `0`
/// disables throttling. Both login routes draw from the same budget.
#[derive(Debug)]
pub struct LoginThrottle {
    budget: u32,
    window: Duration,
    attempts: Mutex<Attempts>,
}

impl LoginThrottle {
    pub fn per_minute(budget: u32) -> Self {
        Self::with_window(budget, Duration::from_secs(LOGIN_WINDOW_SECS))
    }

    fn with_window(budget: u32, window: Duration) -> Self {
        Self {
            budget,
            window,
            attempts: Mutex::new(Attempts {
                by_client: HashMap::new(),
                last_sweep: Instant::now(),
            }),
        }
    }

    /// Record an attempt for `client`. Returns `false` once the client has
    /// used its budget for the current window; refused attempts are not
    /// recorded.
    pub fn allow_login(&self, client: &str) -> bool {
        if self.budget == 0 {
            return true;
        }
        let now = Instant::now();
        let cutoff = now.checked_sub(self.window).unwrap_or(now);

        let mut attempts = self.attempts.lock();
        if now.duration_since(attempts.last_sweep) >= Duration::from_secs(IDLE_CLIENT_SWEEP_SECS) {
            attempts.by_client.retain(|_, seen| {
                seen.retain(|t| *t > cutoff);
                !seen.is_empty()
            });
            attempts.last_sweep = now;
        }

        let seen = attempts.by_client.entry(client.to_owned()).or_default();
        seen.retain(|t| *t > cutoff);
        if seen.len() >= self.budget as usize {
            return false;
        }
        seen.push(now);
        true
    }

    #[cfg(test)]
    fn tracked_clients(&self) -> usize {
        self.attempts.lock().by_client.len()
    }
}

/// Throttle key for a request: first `X-Forwarded-For` hop, else
/// `X-Real-IP`, else [`UNKNOWN_CLIENT`].
///
/// Those headers are caller-controlled. They are only meaningful once
/// [`normalize_client_headers`] has run for the request.
pub fn client_key_from_headers(headers: &HeaderMap) -> String {
    for name in [FORWARDED_FOR, REAL_IP] {
        if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
            let first = value.split(',').next().unwrap_or("").trim();
            if !first.is_empty() {
                return first.to_owned();
            }
        }
    }
    UNKNOWN_CLIENT.into()
}

/// Make the forwarding headers trustworthy before handlers read them.
///
/// Behind a trusted reverse proxy they are kept as sent. Otherwise any
/// client-supplied values are discarded and `X-Real-IP` is set to the TCP
/// peer address, so a caller cannot mint a fresh throttle budget by
/// rewriting headers.
pub fn normalize_client_headers(
    headers: &mut HeaderMap,
    peer: Option<SocketAddr>,
    trust_proxy_headers: bool,
) {
    if trust_proxy_headers {
        return;
    }
    headers.remove(FORWARDED_FOR);
    headers.remove(REAL_IP);
    if let Some(peer) = peer {
        if let Ok(value) = HeaderValue::from_str(&peer.ip().to_string()) {
            headers.insert(REAL_IP, value);
        }
    }
}
