//! Admin account and JWT issuing.
//!
//! `server.json` stores `{admin, salt, hash, life_time}` where `hash` is
//! hex-encoded `sha512(password || salt)`. Tokens are HS256 JWTs signed
//! with a secret generated at process start, so a restart deliberately
//! invalidates outstanding tokens (single-node trade-off).

use std::path::PathBuf;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use subtle::ConstantTimeEq;
use uuid::Uuid;

use sp_domain::{Error, HumanDuration, Result};

type HmacSha256 = Hmac<Sha256>;

const DEFAULT_ADMIN: &str = "admin";
const DEFAULT_LIFE_TIME_HOURS: u64 = 30 * 24;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AdminConfig {
    admin: String,
    salt: String,
    /// hex(sha512(password || salt))
    hash: String,
    life_time: HumanDuration,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    iat: i64,
    exp: i64,
    user: String,
}

pub struct AdminAuth {
    config_path: PathBuf,
    config: RwLock<AdminConfig>,
    secret: String,
}

impl AdminAuth {
    /// Load `server.json`, or create it with the initial password.
    pub fn open(config_path: impl Into<PathBuf>, initial_password: &str) -> Result<AdminAuth> {
        let config_path = config_path.into();
        let config = match std::fs::read(&config_path) {
            Ok(data) => serde_json::from_slice(&data)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let salt = Uuid::new_v4().to_string();
                let config = AdminConfig {
                    admin: DEFAULT_ADMIN.to_string(),
                    hash: hash_password(initial_password, &salt),
                    salt,
                    life_time: HumanDuration::from_secs(DEFAULT_LIFE_TIME_HOURS * 3600),
                };
                sp_domain::config::atomic_write_json(&config_path, &config)?;
                config
            }
            Err(e) => return Err(e.into()),
        };
        Ok(AdminAuth {
            config_path,
            config: RwLock::new(config),
            secret: Uuid::new_v4().to_string(),
        })
    }

    /// Verify credentials and issue a signed token.
    pub fn login(&self, login: &str, password: &str) -> Result<String> {
        let config = self.config.read();
        let expected = hash_password(password, &config.salt);
        let hash_ok: bool = expected
            .as_bytes()
            .ct_eq(config.hash.as_bytes())
            .into();
        if !hash_ok || config.admin != login {
            return Err(Error::Forbidden("password or login is invalid".into()));
        }
        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            iat: now,
            exp: now + config.life_time.as_duration().as_secs() as i64,
            user: login.to_string(),
        };
        Ok(self.sign(&claims))
    }

    /// Validate a token and return the login it carries.
    pub fn validate(&self, token: &str) -> Result<String> {
        let mut parts = token.split('.');
        let (Some(header), Some(payload), Some(signature), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::Forbidden("malformed token".into()));
        };
        let expected = self.signature(header, payload);
        let given = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| Error::Forbidden("malformed token signature".into()))?;
        let sig_ok: bool = expected.ct_eq(&given).into();
        if !sig_ok {
            return Err(Error::Forbidden("token signature mismatch".into()));
        }
        let payload = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| Error::Forbidden("malformed token payload".into()))?;
        let claims: Claims = serde_json::from_slice(&payload)
            .map_err(|_| Error::Forbidden("malformed token claims".into()))?;
        if claims.exp <= chrono::Utc::now().timestamp() {
            return Err(Error::Forbidden("token expired".into()));
        }
        if claims.user.is_empty() {
            return Err(Error::Forbidden("no login in token payload".into()));
        }
        Ok(claims.user)
    }

    /// Re-salt and persist a new password.
    pub fn change_password(&self, password: &str) -> Result<()> {
        let mut config = self.config.write();
        config.salt = Uuid::new_v4().to_string();
        config.hash = hash_password(password, &config.salt);
        sp_domain::config::atomic_write_json(&self.config_path, &*config)
    }

    fn sign(&self, claims: &Claims) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let payload =
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).expect("claims serialize"));
        let signature = URL_SAFE_NO_PAD.encode(self.signature(&header, &payload));
        format!("{header}.{payload}.{signature}")
    }

    fn signature(&self, header: &str, payload: &str) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes()).expect("hmac key");
        mac.update(header.as_bytes());
        mac.update(b".");
        mac.update(payload.as_bytes());
        mac.finalize().into_bytes().to_vec()
    }
}

fn hash_password(password: &str, salt: &str) -> String {
    let mut hasher = Sha512::new();
    hasher.update(password.as_bytes());
    hasher.update(salt.as_bytes());
    hex::encode(hasher.finalize())
}
