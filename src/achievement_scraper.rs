use std::{path::PathBuf, sync::LazyLock};

use log::{info, warn};
use regex::Regex;
use scraper::{ElementRef, Html};
use serde::{Deserialize, Serialize};

use crate::{
    export::{Tabular, load_json, save_json},
    session::SessionManager,
    text_manipulators::{clean_text, selector},
};

static TOTAL_SCORE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"zcj=(\d{1,3}(?:\.\d+)?|通过)").expect("static regex"));

// serial number + 15 data columns
const GRADE_COLUMNS: usize = 16;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Grade {
    pub term: String,
    pub course_code: String,
    pub course_name: String,
    pub score: String,
    pub skill_score: String,
    pub regular_score: String,
    pub exam_score: String,
    pub score_flag: String,
    pub credit: String,
    /// Regular exam, resit, ...
    pub exam_nature: String,
    pub hours: String,
    pub grade_point: String,
    pub assessment_method: String,
    pub course_attribute: String,
    pub course_nature: String,
}

impl Tabular for Grade {
    fn headers() -> Vec<&'static str> {
        vec![
            "term",
            "course_code",
            "course_name",
            "score",
            "skill_score",
            "regular_score",
            "exam_score",
            "score_flag",
            "credit",
            "exam_nature",
            "hours",
            "grade_point",
            "assessment_method",
            "course_attribute",
            "course_nature",
        ]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.term.clone(),
            self.course_code.clone(),
            self.course_name.clone(),
            self.score.clone(),
            self.skill_score.clone(),
            self.regular_score.clone(),
            self.exam_score.clone(),
            self.score_flag.clone(),
            self.credit.clone(),
            self.exam_nature.clone(),
            self.hours.clone(),
            self.grade_point.clone(),
            self.assessment_method.clone(),
            self.course_attribute.clone(),
            self.course_nature.clone(),
        ]
    }
}

/// Form posted to the grade list page. Empty fields mean "any".
#[derive(Debug, Clone, Serialize)]
pub struct GradeQuery {
    #[serde(rename = "kksj")]
    pub term: String,
    #[serde(rename = "kcxz")]
    pub course_nature: String,
    #[serde(rename = "kcmc")]
    pub course_name: String,
    #[serde(rename = "xsfs")]
    pub display_mode: String,
}

impl Default for GradeQuery {
    fn default() -> Self {
        Self {
            term: String::new(),
            course_nature: String::new(),
            course_name: String::new(),
            // best attempt per course
            display_mode: "max".to_string(),
        }
    }
}

fn score_from_cell(cell: ElementRef) -> String {
    TOTAL_SCORE
        .captures(&cell.inner_html())
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| clean_text(cell))
}

fn parse_row(cells: &[ElementRef]) -> Grade {
    let text = |i: usize| clean_text(cells[i]);
    Grade {
        term: text(1),
        course_code: text(2),
        course_name: text(3),
        score: score_from_cell(cells[4]),
        skill_score: text(5),
        regular_score: text(6),
        exam_score: text(7),
        score_flag: text(8),
        credit: text(9),
        exam_nature: text(10),
        hours: text(11),
        grade_point: text(12),
        assessment_method: text(13),
        course_attribute: text(14),
        course_nature: text(15),
    }
}

pub fn parse_grades(html: &str) -> Vec<Grade> {
    let document = Html::parse_document(html);
    let cell_selector = selector("td");

    let mut rows: Vec<ElementRef> = document.select(&selector("table#dataList tr")).collect();
    if rows.is_empty() {
        rows = document.select(&selector("tr")).collect();
    }

    // Header rows are made of <th>, so the cell count filter drops them too.
    rows.into_iter()
        .filter_map(|row| {
            let cells: Vec<_> = row.select(&cell_selector).collect();
            if cells.len() < GRADE_COLUMNS {
                return None;
            }
            Some(parse_row(&cells))
        })
        .collect()
}

#[derive(Debug)]
pub struct AchievementScraper {
    pub query: GradeQuery,
    pub cache_path: PathBuf,
}

impl AchievementScraper {
    pub fn new(query: GradeQuery, cache_path: PathBuf) -> Self {
        Self { query, cache_path }
    }

    async fn fetch(&self, session: &mut SessionManager) -> anyhow::Result<Vec<Grade>> {
        session.ensure_logged_in().await?;
        let url = session.endpoints().grades.clone();
        let html = session.client().post_form_body(&url, &self.query).await?;
        Ok(parse_grades(&html))
    }

    /// Live grades, falling back to the last saved copy when the portal can't be reached.
    pub async fn scrape(&self, session: &mut SessionManager) -> anyhow::Result<Vec<Grade>> {
        match self.fetch(session).await {
            Ok(grades) => {
                info!("Fetched {} grade records", grades.len());
                if let Err(e) = save_json(&self.cache_path, &grades) {
                    warn!("Could not cache grades: {e:#}");
                }
                Ok(grades)
            }
            Err(e) => match load_json::<Vec<Grade>>(&self.cache_path) {
                Some(cached) => {
                    warn!(
                        "Fetching grades failed ({e:#}), using {} cached records",
                        cached.len()
                    );
                    Ok(cached)
                }
                None => Err(e),
            },
        }
    }
}
