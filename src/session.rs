use std::{path::PathBuf, sync::LazyLock, time::Duration};

use anyhow::Context;
use chrono::{DateTime, Local, Utc};
use indexmap::IndexMap;
use log::{debug, info, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{
    captcha::CaptchaSolver,
    config::{Endpoints, PortalConfig},
    credentials::{self, Credentials},
    error::{CredentialsError, LoginError},
    login::Authenticator,
    requests::RequestClient,
};

static NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"姓名：(.*?)<br/>").expect("static regex"));

const LOGGED_IN_MARKER: &str = "姓名：";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    LoggedOut,
    /// Cookies came from disk and haven't been checked against the portal yet.
    Restored,
    LoggedIn,
}

/// Where credentials come from when the session has to log in from scratch.
#[derive(Debug, Clone)]
pub enum CredentialSource {
    Fixed(Credentials),
    Resolve {
        config_file: PathBuf,
        force_input: bool,
    },
}

impl CredentialSource {
    pub fn credentials(&self) -> Result<Credentials, CredentialsError> {
        match self {
            CredentialSource::Fixed(creds) => Ok(creds.clone()),
            CredentialSource::Resolve {
                config_file,
                force_input,
            } => credentials::resolve(config_file, *force_input),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CookieFile {
    cookies: IndexMap<String, String>,
    timestamp: f64,
    #[serde(default)]
    created_at: String,
    #[serde(default)]
    user_info: IndexMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StoredCookies {
    Current(CookieFile),
    /// Older files were a bare name -> value map.
    Legacy(IndexMap<String, String>),
}

fn unix_now() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

/// Owns the portal session: cookie persistence, validity checks and falling
/// back to a fresh captcha login.
pub struct SessionManager {
    client: RequestClient,
    config: PortalConfig,
    endpoints: Endpoints,
    solver: Box<dyn CaptchaSolver>,
    credentials: CredentialSource,
    state: SessionState,
    user_info: IndexMap<String, String>,
    last_activity: Option<DateTime<Utc>>,
    retry_delay: Duration,
}

impl SessionManager {
    pub fn new(
        config: PortalConfig,
        solver: Box<dyn CaptchaSolver>,
        credentials: CredentialSource,
    ) -> anyhow::Result<Self> {
        let client = RequestClient::new(
            &config.edu_base_url,
            Duration::from_secs(config.edu_request_timeout_secs),
            config.edu_req_per_sec,
        )?;
        let endpoints = config.endpoints();
        Ok(Self {
            client,
            config,
            endpoints,
            solver,
            credentials,
            state: SessionState::LoggedOut,
            user_info: IndexMap::new(),
            last_activity: None,
            retry_delay: Duration::from_secs(1),
        })
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn client(&mut self) -> &RequestClient {
        self.last_activity = Some(Utc::now());
        &self.client
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    pub fn config(&self) -> &PortalConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_logged_in(&self) -> bool {
        self.state == SessionState::LoggedIn
    }

    pub fn user_info(&self) -> &IndexMap<String, String> {
        &self.user_info
    }

    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        self.last_activity
    }

    fn set_logged_in(&mut self, user_info: Option<IndexMap<String, String>>) {
        self.state = SessionState::LoggedIn;
        if let Some(user_info) = user_info {
            self.user_info = user_info;
        }
        self.last_activity = Some(Utc::now());
    }

    fn set_logged_out(&mut self) {
        self.state = SessionState::LoggedOut;
        self.user_info.clear();
    }

    /// Loads saved cookies into the jar. Returns false for a missing, expired
    /// or unreadable file.
    pub fn load_cookies(&mut self) -> bool {
        let path = self.config.cookies_file();
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(_) => {
                debug!("No cookie file at {}", path.display());
                return false;
            }
        };
        let stored = match serde_json::from_str::<StoredCookies>(&raw) {
            Ok(stored) => stored,
            Err(e) => {
                warn!("Failed to parse cookie file {}: {e}", path.display());
                return false;
            }
        };

        let cookies = match stored {
            StoredCookies::Current(file) => {
                let max_age = (self.config.edu_cookie_max_age_hours * 3600) as f64;
                if unix_now() - file.timestamp > max_age {
                    info!("Saved cookies have expired");
                    return false;
                }
                info!("Loaded saved cookies (created at {})", file.created_at);
                if !file.user_info.is_empty() {
                    self.user_info = file.user_info;
                }
                file.cookies
            }
            StoredCookies::Legacy(cookies) => {
                info!("Loaded legacy cookie file");
                cookies
            }
        };

        self.client.add_cookies(&cookies);
        self.state = SessionState::Restored;
        true
    }

    pub fn save_cookies(&self) -> anyhow::Result<()> {
        let path = self.config.cookies_file();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let file = CookieFile {
            cookies: self.client.cookie_pairs(),
            timestamp: unix_now(),
            created_at: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            user_info: self.user_info.clone(),
        };
        let json = serde_json::to_string_pretty(&file)?;
        std::fs::write(&path, json)
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!("Cookies saved to {}", path.display());
        Ok(())
    }

    pub fn clear_cookies(&mut self) -> anyhow::Result<()> {
        self.client.clear_cookies()?;
        let path = self.config.cookies_file();
        if path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("failed to remove {}", path.display()))?;
            info!("Removed cookie file {}", path.display());
        }
        self.set_logged_out();
        Ok(())
    }

    pub async fn is_session_valid(&mut self) -> bool {
        let response = match self.client.get(&self.endpoints.main_frame).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Session check failed: {e:#}");
                self.set_logged_out();
                return false;
            }
        };
        if response.status().as_u16() != 200 {
            warn!("Session check returned status {}", response.status());
            return false;
        }

        let final_url = response.url().to_string();
        if final_url.to_lowercase().contains("login") || final_url.contains("verifycode") {
            info!("Session check redirected to the login page");
            self.set_logged_out();
            return false;
        }

        let body = response.text().await.unwrap_or_default();
        if body.contains(LOGGED_IN_MARKER) && final_url.contains("xsMain.jsp") {
            debug!("Session is valid");
            self.set_logged_in(None);
            true
        } else {
            warn!("Session check returned an unexpected page");
            self.set_logged_out();
            false
        }
    }

    /// Valid session, then saved cookies, then a fresh captcha login.
    pub async fn ensure_logged_in(&mut self) -> Result<(), LoginError> {
        if !self.client.cookie_pairs().is_empty() && self.is_session_valid().await {
            return Ok(());
        }
        if self.load_cookies() && self.is_session_valid().await {
            return Ok(());
        }

        info!("Logging in with credentials");
        let credentials = self.credentials.credentials()?;
        let authenticator = Authenticator {
            client: &self.client,
            endpoints: &self.endpoints,
            solver: self.solver.as_ref(),
            captcha_dir: self.config.captcha_dir(),
            max_retries: self.config.edu_max_retry_count,
            retry_delay: self.retry_delay,
        };
        authenticator.login(&credentials).await?;

        let mut user_info = IndexMap::new();
        user_info.insert("username".to_string(), credentials.username.clone());
        self.set_logged_in(Some(user_info));
        if let Err(e) = self.save_cookies() {
            warn!("Could not persist cookies: {e:#}");
        }
        Ok(())
    }

    pub async fn user_name(&mut self) -> anyhow::Result<String> {
        self.ensure_logged_in().await?;
        self.last_activity = Some(Utc::now());
        let body = self.client.fetch_url_body(&self.endpoints.main_frame).await?;
        let name = extract_name(&body).context("main page has no name field")?;
        self.user_info.insert("name".to_string(), name.clone());
        Ok(name)
    }

    pub fn logout(&mut self) -> anyhow::Result<()> {
        self.clear_cookies()
    }
}

pub fn extract_name(body: &str) -> Option<String> {
    NAME_PATTERN
        .captures(body)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
}
