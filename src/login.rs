use std::{path::PathBuf, sync::LazyLock, time::Duration};

use log::{error, info, warn};
use regex::Regex;

use crate::{
    captcha::{CaptchaFetcher, CaptchaSolver},
    config::{Endpoints, MAIN_FRAME_PATH},
    credentials::{Credentials, login_form},
    error::LoginError,
    requests::RequestClient,
};

static FONT_MESSAGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<font[^>]*>(.*?)</font>").expect("static regex"));

/// What a single POST to the login endpoint told us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    Success,
    ServiceUnavailable,
    CaptchaRejected(String),
    BadCredentials(String),
    /// 200 without a redirect and without an error message we recognise.
    Unrecognised,
    HttpStatus(u16),
}

impl LoginOutcome {
    /// Whether another captcha round has a chance of succeeding.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LoginOutcome::CaptchaRejected(_)
                | LoginOutcome::Unrecognised
                | LoginOutcome::HttpStatus(_)
        )
    }
}

/// First `<font>` text on the page; the portal renders its login errors that way.
pub fn error_message(body: &str) -> Option<String> {
    FONT_MESSAGE
        .captures(body)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|m| !m.is_empty())
}

pub fn classify(status: u16, final_url: &str, body: &str) -> LoginOutcome {
    if status == 503 || body.contains("503 Service Unavailable") {
        return LoginOutcome::ServiceUnavailable;
    }
    if status != 200 {
        return LoginOutcome::HttpStatus(status);
    }
    let landed_on_main = final_url
        .split(['?', '#'])
        .next()
        .is_some_and(|path| path.ends_with(MAIN_FRAME_PATH));
    if landed_on_main {
        return LoginOutcome::Success;
    }
    match error_message(body) {
        Some(message) if message.contains("验证码") => LoginOutcome::CaptchaRejected(message),
        Some(message) => LoginOutcome::BadCredentials(message),
        None => LoginOutcome::Unrecognised,
    }
}

/// Drives the captcha-gated login form until the portal lets us in, gives a
/// definitive no, or we run out of attempts.
pub struct Authenticator<'a> {
    pub client: &'a RequestClient,
    pub endpoints: &'a Endpoints,
    pub solver: &'a dyn CaptchaSolver,
    pub captcha_dir: PathBuf,
    pub max_retries: usize,
    pub retry_delay: Duration,
}

impl Authenticator<'_> {
    pub async fn login(&self, credentials: &Credentials) -> Result<(), LoginError> {
        credentials.validate()?;

        let fetcher = CaptchaFetcher {
            client: self.client,
            url: &self.endpoints.captcha,
            dir: self.captcha_dir.clone(),
            max_retries: self.max_retries,
            retry_delay: self.retry_delay,
        };

        let attempts = self.max_retries.max(1);
        let mut last = LoginOutcome::Unrecognised;
        for attempt in 1..=attempts {
            let code = fetcher
                .fetch_code(&credentials.username, self.solver)
                .await?;

            info!("Logging in as {} (attempt {attempt}/{attempts})", credentials.username);
            let form = login_form(credentials, &code);
            let response = self.client.post_form(&self.endpoints.login, &form).await?;
            let status = response.status().as_u16();
            let final_url = response.url().to_string();
            let body = response.text().await.unwrap_or_default();

            let outcome = classify(status, &final_url, &body);
            match &outcome {
                LoginOutcome::Success => {
                    info!("Login succeeded for {}", credentials.username);
                    return Ok(());
                }
                LoginOutcome::ServiceUnavailable => {
                    error!("Portal is under maintenance");
                    return Err(LoginError::ServiceUnavailable);
                }
                LoginOutcome::BadCredentials(message) => {
                    error!("Login rejected: {message}");
                    return Err(LoginError::BadCredentials(message.clone()));
                }
                retryable => warn!("Login attempt {attempt} failed: {retryable:?}"),
            }
            last = outcome;

            if attempt < attempts {
                tokio::time::sleep(self.retry_delay).await;
            }
        }

        Err(LoginError::RetriesExhausted {
            attempts,
            last: format!("{last:?}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAIN: &str = "http://portal.example:8099/jsxsd/framework/xsMain.jsp";
    const LOGIN: &str = "http://portal.example:8099/jsxsd/xk/LoginToXk";

    #[test]
    fn redirect_to_main_frame_is_success() {
        assert_eq!(classify(200, MAIN, "<html></html>"), LoginOutcome::Success);
        assert_eq!(
            classify(200, &format!("{MAIN}?t=1"), ""),
            LoginOutcome::Success
        );
    }

    #[test]
    fn maintenance_wins_over_everything() {
        assert_eq!(
            classify(200, LOGIN, "<h1>503 Service Unavailable</h1>"),
            LoginOutcome::ServiceUnavailable
        );
        assert_eq!(classify(503, LOGIN, ""), LoginOutcome::ServiceUnavailable);
    }

    #[test]
    fn font_messages_are_split_by_cause() {
        let captcha = r#"<font style="display:inline;white-space:nowrap;" color="red">验证码错误!!</font>"#;
        let password = r#"<font color="red">该帐号不存在或密码错误,请联系管理员!</font>"#;
        assert_eq!(
            classify(200, LOGIN, captcha),
            LoginOutcome::CaptchaRejected("验证码错误!!".to_string())
        );
        let outcome = classify(200, LOGIN, password);
        assert!(matches!(outcome, LoginOutcome::BadCredentials(ref m) if m.contains("密码错误")));
        assert!(!outcome.is_retryable());
    }

    #[test]
    fn unknown_pages_are_retryable() {
        assert_eq!(classify(200, LOGIN, "<p>hi</p>"), LoginOutcome::Unrecognised);
        assert_eq!(classify(500, LOGIN, ""), LoginOutcome::HttpStatus(500));
        assert!(LoginOutcome::HttpStatus(500).is_retryable());
        assert!(LoginOutcome::Unrecognised.is_retryable());
    }
}
