//! Server configuration read from `QUILLHUB_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::events::DEFAULT_SUBSCRIBER_BUFFER;
use crate::relay::{RelayConfig, DEFAULT_IMAGE_HOST_URL, DEFAULT_MAX_UPLOAD_BYTES};

#[derive(Debug, Clone)]
pub struct AdminSeed {
    pub name: String,
    pub email: String,
    pub password: String,
}

#[derive(Clone)]
pub struct ServerConfig {
    pub http_port: u16,
    pub upload_dir: PathBuf,
    pub image_host_url: String,
    pub image_host_token: String,
    pub relay_timeout: Duration,
    pub max_upload_bytes: u64,
    pub event_buffer: usize,
    pub session_ttl: Duration,
    pub admin: Option<AdminSeed>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 7878,
            upload_dir: PathBuf::from("uploads"),
            image_host_url: DEFAULT_IMAGE_HOST_URL.to_string(),
            image_host_token: String::new(),
            relay_timeout: Duration::from_secs(30),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            event_buffer: DEFAULT_SUBSCRIBER_BUFFER,
            session_ttl: Duration::from_secs(60 * 60),
            admin: None,
        }
    }
}

// Secrets stay out of logs.
impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("http_port", &self.http_port)
            .field("upload_dir", &self.upload_dir)
            .field("image_host_url", &self.image_host_url)
            .field("image_host_token", &if self.image_host_token.is_empty() { "<unset>" } else { "<redacted>" })
            .field("relay_timeout", &self.relay_timeout)
            .field("max_upload_bytes", &self.max_upload_bytes)
            .field("event_buffer", &self.event_buffer)
            .field("session_ttl", &self.session_ttl)
            .field("admin", &self.admin.as_ref().map(|a| a.email.as_str()))
            .finish()
    }
}

fn parse_or<T: FromStr + Copy + std::fmt::Display>(key: &str, raw: Option<String>, default: T) -> T {
    match raw {
        None => default,
        Some(s) => match s.trim().parse::<T>() {
            Ok(v) => v,
            Err(_) => {
                warn!(target: "config", "{}='{}' is not valid, using {}", key, s, default);
                default
            }
        },
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Build from an arbitrary key lookup; `from_env` passes the process environment.
    pub fn from_lookup<F: Fn(&str) -> Option<String>>(get: F) -> Self {
        let d = Self::default();
        let admin = match (get("QUILLHUB_ADMIN_EMAIL"), get("QUILLHUB_ADMIN_PASSWORD")) {
            (Some(email), Some(password)) if !email.trim().is_empty() && !password.is_empty() => Some(AdminSeed {
                name: get("QUILLHUB_ADMIN_NAME").unwrap_or_else(|| "admin".to_string()),
                email,
                password,
            }),
            _ => None,
        };
        Self {
            http_port: parse_or("QUILLHUB_HTTP_PORT", get("QUILLHUB_HTTP_PORT"), d.http_port),
            upload_dir: get("QUILLHUB_UPLOAD_DIR").map(PathBuf::from).unwrap_or(d.upload_dir),
            image_host_url: get("QUILLHUB_IMAGE_HOST_URL").unwrap_or(d.image_host_url),
            image_host_token: get("QUILLHUB_IMAGE_HOST_TOKEN").unwrap_or(d.image_host_token),
            relay_timeout: Duration::from_secs(parse_or("QUILLHUB_RELAY_TIMEOUT_SECS", get("QUILLHUB_RELAY_TIMEOUT_SECS"), d.relay_timeout.as_secs())),
            max_upload_bytes: parse_or("QUILLHUB_MAX_UPLOAD_BYTES", get("QUILLHUB_MAX_UPLOAD_BYTES"), d.max_upload_bytes),
            event_buffer: parse_or("QUILLHUB_EVENT_BUFFER", get("QUILLHUB_EVENT_BUFFER"), d.event_buffer),
            session_ttl: Duration::from_secs(parse_or("QUILLHUB_SESSION_TTL_SECS", get("QUILLHUB_SESSION_TTL_SECS"), d.session_ttl.as_secs())),
            admin,
        }
    }

    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            upload_dir: self.upload_dir.clone(),
            timeout: self.relay_timeout,
            max_bytes: self.max_upload_bytes,
        }
    }
}
