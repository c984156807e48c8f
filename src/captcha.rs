use std::{
    io::{self, BufRead, Write},
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use anyhow::{Context, bail};
use async_trait::async_trait;
use chrono::Utc;
use log::{debug, info, warn};

use crate::{error::CaptchaError, requests::RequestClient};

const MIN_CODE_LEN: usize = 4;
const STALE_AFTER: Duration = Duration::from_secs(24 * 3600);

/// Turns a captcha image into the code typed into the login form.
#[async_trait]
pub trait CaptchaSolver: Send + Sync {
    /// `path` is where the image has been saved, for solvers that work on files.
    async fn solve(&self, image: &[u8], path: &Path) -> anyhow::Result<String>;
}

/// Runs an external OCR program with the image path as its last argument and
/// takes its trimmed stdout as the code.
pub struct CommandSolver {
    program: String,
    args: Vec<String>,
}

impl CommandSolver {
    pub fn from_command_line(command: &str) -> Option<Self> {
        let mut parts = command.split_whitespace().map(String::from);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
        })
    }
}

#[async_trait]
impl CaptchaSolver for CommandSolver {
    async fn solve(&self, _image: &[u8], path: &Path) -> anyhow::Result<String> {
        let output = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .arg(path)
            .output()
            .await
            .with_context(|| format!("failed to run captcha command {}", self.program))?;
        if !output.status.success() {
            bail!(
                "captcha command exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Asks a human to read the saved image.
pub struct PromptSolver;

#[async_trait]
impl CaptchaSolver for PromptSolver {
    async fn solve(&self, _image: &[u8], path: &Path) -> anyhow::Result<String> {
        let path = path.to_path_buf();
        let code = tokio::task::spawn_blocking(move || -> io::Result<String> {
            let mut stderr = io::stderr();
            write!(stderr, "Captcha saved to {}. Enter code: ", path.display())?;
            stderr.flush()?;
            let mut line = String::new();
            io::stdin().lock().read_line(&mut line)?;
            Ok(line.trim().to_string())
        })
        .await??;
        Ok(code)
    }
}

/// Picks the configured command solver, falling back to asking on stdin.
pub fn solver_from_config(command: Option<&str>) -> Box<dyn CaptchaSolver> {
    match command.and_then(CommandSolver::from_command_line) {
        Some(solver) => Box::new(solver),
        None => Box::new(PromptSolver),
    }
}

/// Deletes `captcha_*.png` files in `dir` older than `max_age`. Returns how many went.
pub fn clean_old_captcha_files(dir: &Path, max_age: Duration) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    let now = SystemTime::now();
    let mut removed = 0;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !(name.starts_with("captcha_") && name.ends_with(".png")) {
            continue;
        }
        let age = entry
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| now.duration_since(modified).ok());
        if age.is_some_and(|age| age > max_age) && std::fs::remove_file(entry.path()).is_ok() {
            debug!("Removed stale captcha file {name}");
            removed += 1;
        }
    }
    removed
}

fn file_safe(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// One fetch-and-solve round against the captcha servlet, retried on failure.
pub struct CaptchaFetcher<'a> {
    pub client: &'a RequestClient,
    pub url: &'a str,
    pub dir: PathBuf,
    pub max_retries: usize,
    pub retry_delay: Duration,
}

impl CaptchaFetcher<'_> {
    pub async fn fetch_code(
        &self,
        username: &str,
        solver: &dyn CaptchaSolver,
    ) -> Result<String, CaptchaError> {
        if let Err(e) = std::fs::create_dir_all(&self.dir) {
            warn!("Could not create captcha dir {}: {e}", self.dir.display());
        }
        clean_old_captcha_files(&self.dir, STALE_AFTER);

        let attempts = self.max_retries.max(1);
        for attempt in 1..=attempts {
            info!("Fetching captcha (attempt {attempt}/{attempts})");
            match self.attempt(username, solver).await {
                Ok(code) => {
                    info!("Captcha recognised: {code}");
                    return Ok(code);
                }
                Err(e) => warn!("Captcha attempt {attempt} failed: {e:#}"),
            }
            if attempt < attempts {
                tokio::time::sleep(self.retry_delay).await;
            }
        }
        Err(CaptchaError::Exhausted(attempts))
    }

    async fn attempt(&self, username: &str, solver: &dyn CaptchaSolver) -> anyhow::Result<String> {
        let stamp = Utc::now().timestamp_millis() as f64 / 1000.0;
        let response = self
            .client
            .get_with_query(self.url, &[("t", stamp.to_string())])
            .await?;
        if !response.status().is_success() {
            return Err(CaptchaError::HttpStatus(response.status().as_u16()).into());
        }
        let image = response.bytes().await?;
        if image.is_empty() {
            return Err(CaptchaError::EmptyImage.into());
        }

        let path = self.dir.join(format!(
            "captcha_{}_{}.png",
            file_safe(username),
            Utc::now().timestamp()
        ));
        std::fs::write(&path, &image)
            .with_context(|| format!("failed to save captcha to {}", path.display()))?;

        let solved = solver.solve(&image, &path).await;
        // The image is only useful for this one attempt.
        let _ = std::fs::remove_file(&path);

        let code = solved.map_err(|e| CaptchaError::Solver(format!("{e:#}")))?;
        if code.chars().count() < MIN_CODE_LEN {
            return Err(CaptchaError::TooShort(code).into());
        }
        Ok(code)
    }
}
