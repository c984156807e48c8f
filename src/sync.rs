use log::{info, warn};

use crate::{
    achievement_scraper::{AchievementScraper, GradeQuery},
    credentials::Credentials,
    curriculum_scraper::{CurriculumScraper, ScheduleQuery},
    session::SessionManager,
    store::{RecordCache, RecordDatabase, RecordStore, StudentRecord, UpsertOutcome},
};

#[derive(Debug, Clone, PartialEq)]
pub struct SyncReport {
    pub name: String,
    pub grades: usize,
    pub schedule_entries: usize,
    pub outcome: UpsertOutcome,
}

/// Scrapes everything we persist for the logged in student and writes it
/// through the store. A failing schedule page is stored as an empty list.
pub async fn sync<C: RecordCache, D: RecordDatabase>(
    session: &mut SessionManager,
    store: &RecordStore<C, D>,
    credentials: &Credentials,
) -> anyhow::Result<SyncReport> {
    let achievement_cache = session.config().achievement_cache();
    let curriculum_cache = session.config().curriculum_cache();

    let grades = AchievementScraper::new(GradeQuery::default(), achievement_cache)
        .scrape(session)
        .await?;
    let schedule = match CurriculumScraper::new(ScheduleQuery::default(), curriculum_cache)
        .scrape(session)
        .await
    {
        Ok(schedule) => schedule,
        Err(e) => {
            warn!("Schedule unavailable, syncing without it: {e:#}");
            Vec::new()
        }
    };
    let name = session.user_name().await?;

    let record = StudentRecord::new(
        credentials,
        name.clone(),
        serde_json::to_string(&schedule)?,
        serde_json::to_string(&grades)?,
    );
    let outcome = store.upsert(&record).await?;
    info!(
        "Synced {} grades and {} schedule entries for {name}",
        grades.len(),
        schedule.len()
    );

    Ok(SyncReport {
        name,
        grades: grades.len(),
        schedule_entries: schedule.len(),
        outcome,
    })
}
