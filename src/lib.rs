pub mod achievement_scraper;
pub mod captcha;
pub mod config;
pub mod credentials;
pub mod curriculum_scraper;
pub mod error;
pub mod export;
pub mod login;
mod ratelimit;
pub mod requests;
pub mod semester_scraper;
pub mod session;
pub mod store;
pub mod student_info_scraper;
pub mod sync;
pub mod table_scraper;
mod text_manipulators;

pub use achievement_scraper::{AchievementScraper, Grade, GradeQuery};
pub use captcha::CaptchaSolver;
pub use config::{LoadFromEnv, PortalConfig, StoreConfig};
pub use credentials::Credentials;
pub use curriculum_scraper::{CurriculumScraper, ScheduleEntry, ScheduleQuery};
pub use error::{CaptchaError, CredentialsError, LoginError, ScrapeError, StoreError};
pub use session::{CredentialSource, SessionManager, SessionState};
pub use store::{RecordStore, SearchOutcome, StudentRecord, UpsertOutcome};
