use thiserror::Error;

#[derive(Debug, Error)]
pub enum CredentialsError {
    #[error("username must not be empty")]
    EmptyUsername,
    #[error("password must not be empty")]
    EmptyPassword,
    #[error("username is too short (need at least {min} characters)")]
    UsernameTooShort { min: usize },
    #[error("password is too short (need at least {min} characters)")]
    PasswordTooShort { min: usize },
    #[error("failed to read credentials from input: {0}")]
    Input(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum CaptchaError {
    #[error("captcha image was empty")]
    EmptyImage,
    #[error("captcha endpoint returned status {0}")]
    HttpStatus(u16),
    #[error("recognised captcha {0:?} is too short")]
    TooShort(String),
    #[error("captcha solver failed: {0}")]
    Solver(String),
    #[error("could not solve captcha after {0} attempts")]
    Exhausted(usize),
}

#[derive(Debug, Error)]
pub enum LoginError {
    #[error("portal rejected the credentials: {0}")]
    BadCredentials(String),
    #[error("portal is under maintenance (503 Service Unavailable)")]
    ServiceUnavailable,
    #[error("login still failing after {attempts} attempts (last: {last})")]
    RetriesExhausted { attempts: usize, last: String },
    #[error(transparent)]
    Captcha(#[from] CaptchaError),
    #[error(transparent)]
    Credentials(#[from] CredentialsError),
    #[error(transparent)]
    Http(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("stored record for this user belongs to different credentials")]
    CredentialMismatch,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("cache error: {0}")]
    Cache(#[from] redis::RedisError),
}

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("page at {url} has no {element}")]
    MissingElement { url: String, element: &'static str },
}
