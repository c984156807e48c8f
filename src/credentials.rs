use std::{
    fmt,
    io::{self, BufRead, Write},
    path::Path,
};

use base64::{Engine, engine::general_purpose::STANDARD};
use log::{info, warn};
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::{config::LoadFromEnv, error::CredentialsError};

pub const DEFAULT_SCHOOL: &str = "10";
const MIN_USERNAME_LEN: usize = 3;
const MIN_PASSWORD_LEN: usize = 6;

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub school: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"********")
            .field("school", &self.school)
            .finish()
    }
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            school: DEFAULT_SCHOOL.to_string(),
        }
    }

    pub fn validate(&self) -> Result<(), CredentialsError> {
        if self.username.is_empty() {
            return Err(CredentialsError::EmptyUsername);
        }
        if self.password.is_empty() {
            return Err(CredentialsError::EmptyPassword);
        }
        if self.username.chars().count() < MIN_USERNAME_LEN {
            return Err(CredentialsError::UsernameTooShort {
                min: MIN_USERNAME_LEN,
            });
        }
        if self.password.chars().count() < MIN_PASSWORD_LEN {
            return Err(CredentialsError::PasswordTooShort {
                min: MIN_PASSWORD_LEN,
            });
        }
        Ok(())
    }

    /// Key identifying this exact username/password/school combination.
    pub fn hash_id(&self) -> String {
        hex_digest(&[&self.username, &self.password, &self.school])
    }

    /// Key identifying the account regardless of password.
    pub fn hash_username(&self) -> String {
        hex_digest(&[&self.username, &self.school])
    }
}

fn hex_digest(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// The portal's `conwork.js` `encodeInp` is plain Base64.
pub fn encode_inp(input: &str) -> String {
    STANDARD.encode(input.as_bytes())
}

/// Form fields the login endpoint expects, in the order the page submits them.
pub fn login_form(credentials: &Credentials, captcha: &str) -> Vec<(&'static str, String)> {
    let account = encode_inp(&credentials.username);
    let passwd = encode_inp(&credentials.password);
    let encoded = format!("{account}%%%{passwd}");
    vec![
        ("userAccount", account),
        ("userPassword", passwd),
        ("encoded", encoded),
        ("RANDOMCODE", captcha.to_string()),
    ]
}

#[derive(Debug, Default, Deserialize)]
struct CredentialsEnv {
    edu_username: Option<String>,
    edu_password: Option<String>,
    edu_school: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    educational_system: ConfigFileSection,
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFileSection {
    username: Option<String>,
    password: Option<String>,
    school: Option<String>,
}

fn complete(
    username: Option<String>,
    password: Option<String>,
    school: Option<String>,
) -> Option<Credentials> {
    match (username, password) {
        (Some(username), Some(password)) if !username.is_empty() && !password.is_empty() => {
            Some(Credentials {
                username,
                password,
                school: school
                    .filter(|s| !s.is_empty())
                    .unwrap_or_else(|| DEFAULT_SCHOOL.to_string()),
            })
        }
        _ => None,
    }
}

pub fn from_env() -> Option<Credentials> {
    let env = CredentialsEnv::load_from_env().ok()?;
    complete(env.edu_username, env.edu_password, env.edu_school)
}

pub fn from_config_file(path: &Path) -> Option<Credentials> {
    let raw = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str::<ConfigFile>(&raw) {
        Ok(config) => {
            let section = config.educational_system;
            complete(section.username, section.password, section.school)
        }
        Err(e) => {
            warn!("Failed to read config file {}: {e}", path.display());
            None
        }
    }
}

/// Asks for credentials line by line. Split from stdin so it can be driven from tests.
pub fn prompt_from<R: BufRead, W: Write>(
    input: &mut R,
    output: &mut W,
) -> Result<Credentials, CredentialsError> {
    let mut ask = |label: &str| -> Result<String, CredentialsError> {
        write!(output, "{label}")?;
        output.flush()?;
        let mut line = String::new();
        input.read_line(&mut line)?;
        Ok(line.trim().to_string())
    };

    let username = ask("Username / student id: ")?;
    if username.is_empty() {
        return Err(CredentialsError::EmptyUsername);
    }
    // Typed input is echoed.
    let password = ask("Password (input is visible): ")?;
    if password.is_empty() {
        return Err(CredentialsError::EmptyPassword);
    }
    let school = ask(&format!("School code [{DEFAULT_SCHOOL}]: "))?;

    Ok(Credentials {
        username,
        password,
        school: if school.is_empty() {
            DEFAULT_SCHOOL.to_string()
        } else {
            school
        },
    })
}

/// Resolves credentials from the environment, then the json config file,
/// then an interactive prompt.
pub fn resolve(config_file: &Path, force_input: bool) -> Result<Credentials, CredentialsError> {
    if !force_input {
        if let Some(creds) = from_env() {
            info!("Using credentials from environment");
            return Ok(creds);
        }
        if let Some(creds) = from_config_file(config_file) {
            info!("Using credentials from {}", config_file.display());
            return Ok(creds);
        }
        warn!("No credentials in environment or config file, prompting");
    }
    let stdin = io::stdin();
    let mut input = stdin.lock();
    prompt_from(&mut input, &mut io::stderr())
}
