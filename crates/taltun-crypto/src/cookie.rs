//! Stateless DoS cookies for handshake rate-limiting.
//!
//! A cookie is `HMAC-SHA256(secret, source_ip)` truncated to 16 bytes. The
//! protector keeps two 32-byte secrets, current and previous, and rotates
//! them every two minutes, so a freshly minted cookie stays valid for at
//! least one full rotation interval and at most two. The server stores
//! nothing per client.
//!
//! Rotation happens lazily on first use after the interval elapses rather
//! than on a timer thread; the observable validity window is the same.

use crate::{random, CryptoError};
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use sha2::Sha256;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Size of a cookie on the wire (truncated HMAC-SHA256).
pub const COOKIE_SIZE: usize = 16;

/// Size of each rotating secret.
pub const SECRET_SIZE: usize = 32;

/// Interval between secret rotations.
pub const ROTATION_INTERVAL: Duration = Duration::from_secs(120);

struct Secrets {
    current: [u8; SECRET_SIZE],
    previous: [u8; SECRET_SIZE],
    rotated_at: Instant,
}

/// Generates and validates stateless source-IP cookies.
pub struct CookieProtector {
    secrets: RwLock<Secrets>,
}

impl CookieProtector {
    /// Create a protector with fresh random secrets.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::RandomFailed`] if the OS CSPRNG fails.
    pub fn new() -> Result<Self, CryptoError> {
        Ok(Self {
            secrets: RwLock::new(Secrets {
                current: random::random_32()?,
                previous: random::random_32()?,
                rotated_at: Instant::now(),
            }),
        })
    }

    /// Mint a cookie binding `source` to the current secret.
    #[must_use]
    pub fn generate(&self, source: IpAddr) -> [u8; COOKIE_SIZE] {
        self.maybe_rotate();
        let secrets = self.secrets.read();
        mac_ip(&secrets.current, source)
    }

    /// Check whether `cookie` is valid for `source` under the current or
    /// previous secret.
    #[must_use]
    pub fn validate(&self, source: IpAddr, cookie: &[u8]) -> bool {
        if cookie.len() != COOKIE_SIZE {
            return false;
        }
        self.maybe_rotate();
        let secrets = self.secrets.read();

        let current = mac_ip(&secrets.current, source);
        let previous = mac_ip(&secrets.previous, source);
        let current_ok: bool = current[..].ct_eq(cookie).into();
        let previous_ok: bool = previous[..].ct_eq(cookie).into();
        current_ok || previous_ok
    }

    /// Rotate if the interval has elapsed since the last rotation.
    fn maybe_rotate(&self) {
        {
            let secrets = self.secrets.read();
            if secrets.rotated_at.elapsed() < ROTATION_INTERVAL {
                return;
            }
        }
        let mut secrets = self.secrets.write();
        // Another thread may have rotated between the two locks.
        if secrets.rotated_at.elapsed() < ROTATION_INTERVAL {
            return;
        }
        Self::rotate_now(&mut secrets);
    }

    fn rotate_now(secrets: &mut Secrets) {
        secrets.previous = secrets.current;
        // If the CSPRNG fails we keep the old secret rather than rotating to
        // a predictable one; cookies then simply stay valid longer.
        if let Ok(fresh) = random::random_32() {
            secrets.current = fresh;
        }
        secrets.rotated_at = Instant::now();
    }

    #[cfg(test)]
    fn force_rotate(&self) {
        Self::rotate_now(&mut self.secrets.write());
    }
}

fn mac_ip(secret: &[u8; SECRET_SIZE], source: IpAddr) -> [u8; COOKIE_SIZE] {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    match source {
        IpAddr::V4(ip) => mac.update(&ip.octets()),
        IpAddr::V6(ip) => mac.update(&ip.octets()),
    }
    let digest = mac.finalize().into_bytes();
    let mut cookie = [0u8; COOKIE_SIZE];
    cookie.copy_from_slice(&digest[..COOKIE_SIZE]);
    cookie
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 0, 2, last))
    }

    #[test]
    fn test_cookie_validates_now() {
        let p = CookieProtector::new().unwrap();
        let cookie = p.generate(ip(1));
        assert!(p.validate(ip(1), &cookie));
    }

    #[test]
    fn test_cookie_bound_to_source_ip() {
        let p = CookieProtector::new().unwrap();
        let cookie = p.generate(ip(1));
        assert!(!p.validate(ip(2), &cookie));
    }

    #[test]
    fn test_cookie_survives_one_rotation() {
        let p = CookieProtector::new().unwrap();
        let cookie = p.generate(ip(1));
        p.force_rotate();
        assert!(p.validate(ip(1), &cookie));
    }

    #[test]
    fn test_cookie_expires_after_two_rotations() {
        let p = CookieProtector::new().unwrap();
        let cookie = p.generate(ip(1));
        p.force_rotate();
        p.force_rotate();
        assert!(!p.validate(ip(1), &cookie));
    }

    #[test]
    fn test_wrong_length_rejected() {
        let p = CookieProtector::new().unwrap();
        let cookie = p.generate(ip(1));
        assert!(!p.validate(ip(1), &cookie[..8]));
        assert!(!p.validate(ip(1), &[]));
    }

    #[test]
    fn test_forged_cookie_rejected() {
        let p = CookieProtector::new().unwrap();
        let mut cookie = p.generate(ip(1));
        cookie[0] ^= 0xFF;
        assert!(!p.validate(ip(1), &cookie));
    }
}
