use std::{path::PathBuf, sync::LazyLock};

use log::{debug, info, warn};
use regex::Regex;
use scraper::{ElementRef, Html, Node};
use serde::{Deserialize, Serialize};

use crate::{
    export::{Tabular, save_json},
    session::SessionManager,
    text_manipulators::{clean_text, selector, strip_nbsp},
};

const BLOCK_SEPARATOR: &str = "---------------------";
// No term runs longer than this many teaching weeks.
const MAX_WEEK: u32 = 60;

static NAME_BEFORE_BR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r">([^<]+)<br").expect("static regex"));
static WEEKS_AND_PERIODS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+(?:[-,]\d+)*)\(周\)\[([^\]]+)\]").expect("static regex")
});
static BRACKETED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[(.*?)\]").expect("static regex"));

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub course_name: String,
    pub teacher: String,
    pub classroom: String,
    /// 1 = Monday .. 7 = Sunday
    pub weekday: u8,
    pub weekday_name: String,
    pub week: u32,
    pub periods: String,
    pub period_name: String,
    pub time_slot: String,
    pub div_id: String,
}

impl Tabular for ScheduleEntry {
    fn headers() -> Vec<&'static str> {
        vec![
            "course_name",
            "teacher",
            "classroom",
            "weekday",
            "weekday_name",
            "week",
            "periods",
            "period_name",
            "time_slot",
        ]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.course_name.clone(),
            self.teacher.clone(),
            self.classroom.clone(),
            self.weekday.to_string(),
            self.weekday_name.clone(),
            self.week.to_string(),
            self.periods.clone(),
            self.period_name.clone(),
            self.time_slot.clone(),
        ]
    }
}

/// Empty week means every week; empty term means the current one.
#[derive(Debug, Clone, Default)]
pub struct ScheduleQuery {
    pub week: String,
    pub term: String,
}

impl ScheduleQuery {
    pub fn form(&self) -> Vec<(&'static str, String)> {
        vec![
            ("cj0701id", String::new()),
            ("zc", self.week.clone()),
            ("demo", String::new()),
            ("xnxq01id", self.term.clone()),
            ("sfFD", "1".to_string()),
        ]
    }
}

pub fn weekday_name(weekday: u8) -> String {
    match weekday {
        1 => "星期一".to_string(),
        2 => "星期二".to_string(),
        3 => "星期三".to_string(),
        4 => "星期四".to_string(),
        5 => "星期五".to_string(),
        6 => "星期六".to_string(),
        7 => "星期日".to_string(),
        other => format!("星期{other}"),
    }
}

const PERIOD_TABLE: [(&str, &str, &str); 6] = [
    ("01-02", "12", "第1-2节"),
    ("03-04", "34", "第3-4节"),
    ("05-06", "56", "第5-6节"),
    ("07-08", "78", "第7-8节"),
    ("09-10", "910", "第9-10节"),
    ("11-12", "1112", "第11-12节"),
];

pub fn time_slot(periods: &str) -> String {
    PERIOD_TABLE
        .iter()
        .find(|(key, _, _)| periods.contains(*key))
        .map_or("12", |&(_, slot, _)| slot)
        .to_string()
}

pub fn period_name(periods: &str) -> String {
    match PERIOD_TABLE.iter().find(|(key, _, _)| periods.contains(*key)) {
        Some((_, _, name)) => name.to_string(),
        None if periods.is_empty() => "未知时间".to_string(),
        None => periods.to_string(),
    }
}

/// Splits `"1-3,5(周)[01-02节]"` into `([1, 2, 3, 5], "01-02节")`.
pub fn parse_time_info(time_info: &str) -> (Vec<u32>, String) {
    let Some((week_part, rest)) = time_info.split_once("(周)") else {
        return (Vec::new(), String::new());
    };

    let periods = BRACKETED
        .captures(rest)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_default();

    let mut weeks = Vec::new();
    for range in week_part.split(',').map(str::trim) {
        if let Some((start, end)) = range.split_once('-') {
            match (start.trim().parse::<u32>(), end.trim().parse::<u32>()) {
                (Ok(start), Ok(end)) if start <= end && end <= MAX_WEEK => {
                    weeks.extend(start..=end)
                }
                (Ok(_), Ok(_)) => warn!("Skipping out of range weeks {range:?}"),
                _ => warn!("Could not parse week range {range:?}"),
            }
        } else if let Ok(week) = range.parse::<u32>() {
            if week <= MAX_WEEK {
                weeks.push(week);
            } else {
                warn!("Skipping out of range week {week}");
            }
        }
    }
    weeks.sort_unstable();
    weeks.dedup();

    (weeks, periods)
}

#[derive(Debug, Default)]
struct CourseBlock {
    name: String,
    teacher: String,
    time_info: String,
    classroom: String,
}

fn font_text(fragment: &Html, title: &str) -> String {
    fragment
        .select(&selector(&format!(r#"font[title="{title}"]"#)))
        .next()
        .map(clean_text)
        .unwrap_or_default()
}

/// Direct text before the first `<br>` that follows some text.
fn name_before_first_br(fragment: &Html) -> String {
    let mut name = String::new();
    for node in fragment.root_element().children() {
        match node.value() {
            Node::Element(el) if el.name() == "br" => {
                if !name.trim().is_empty() {
                    break;
                }
            }
            Node::Text(text) => name.push_str(text.trim()),
            _ => {}
        }
    }
    strip_nbsp(&name)
}

fn parse_block(block_html: &str) -> CourseBlock {
    let fragment = Html::parse_fragment(block_html);

    let mut name = name_before_first_br(&fragment);
    if name.is_empty() {
        if let Some(m) = NAME_BEFORE_BR.captures(block_html).and_then(|c| c.get(1)) {
            name = strip_nbsp(m.as_str());
        }
    }

    let mut block = CourseBlock {
        name,
        teacher: font_text(&fragment, "老师"),
        time_info: font_text(&fragment, "周次(节次)"),
        classroom: font_text(&fragment, "教室"),
    };

    // Pages without the titled <font> tags: find the time in the plain text.
    if block.time_info.is_empty() {
        let text = fragment
            .root_element()
            .text()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        if let Some(m) = WEEKS_AND_PERIODS.find(&text) {
            block.time_info = m.as_str().to_string();
            let before = text[..m.start()].trim();
            if block.name.is_empty() {
                block.name = before
                    .split(|c: char| c.is_ascii_digit())
                    .next()
                    .unwrap_or_default()
                    .split_whitespace()
                    .next()
                    .unwrap_or_default()
                    .to_string();
            }
            if block.classroom.is_empty() {
                block.classroom = text[m.end()..].trim().to_string();
            }
        }
    }

    block
}

fn parse_course_div(div: ElementRef) -> Vec<ScheduleEntry> {
    let Some(div_id) = div.value().attr("id") else {
        return Vec::new();
    };
    // <slot>-<weekday>-<n>
    let id_parts: Vec<_> = div_id.split('-').collect();
    if id_parts.len() < 3 {
        debug!("Skipping div with unexpected id {div_id}");
        return Vec::new();
    }
    let weekday = id_parts[1].parse::<u8>().unwrap_or(0);
    if !(1..=7).contains(&weekday) {
        debug!("Skipping div {div_id} with weekday {weekday}");
        return Vec::new();
    }

    let inner = div.inner_html();
    if strip_nbsp(&inner).is_empty() {
        return Vec::new();
    }

    let mut entries = Vec::new();
    for block_html in inner.split(BLOCK_SEPARATOR) {
        let block = parse_block(block_html);
        if block.name.is_empty() || block.time_info.is_empty() {
            continue;
        }
        let (weeks, periods) = parse_time_info(&block.time_info);
        for week in weeks {
            entries.push(ScheduleEntry {
                course_name: block.name.clone(),
                teacher: block.teacher.clone(),
                classroom: block.classroom.clone(),
                weekday,
                weekday_name: weekday_name(weekday),
                week,
                periods: periods.clone(),
                period_name: period_name(&periods),
                time_slot: time_slot(&periods),
                div_id: div_id.to_string(),
            });
        }
    }
    entries
}

pub fn parse_schedule(html: &str) -> Vec<ScheduleEntry> {
    let document = Html::parse_document(html);
    let has_table = document.select(&selector("table#kbtable")).next().is_some()
        || document.select(&selector("table.kbcontent")).next().is_some();
    if !has_table {
        warn!("No schedule table on the page");
        return Vec::new();
    }

    document
        .select(&selector("div.kbcontent"))
        .flat_map(parse_course_div)
        .collect()
}

#[derive(Debug)]
pub struct CurriculumScraper {
    pub query: ScheduleQuery,
    pub cache_path: PathBuf,
}

impl CurriculumScraper {
    pub fn new(query: ScheduleQuery, cache_path: PathBuf) -> Self {
        Self { query, cache_path }
    }

    pub async fn scrape(&self, session: &mut SessionManager) -> anyhow::Result<Vec<ScheduleEntry>> {
        session.ensure_logged_in().await?;
        info!(
            "Fetching schedule (week: {}, term: {})",
            if self.query.week.is_empty() { "all" } else { self.query.week.as_str() },
            if self.query.term.is_empty() { "current" } else { self.query.term.as_str() },
        );
        let url = session.endpoints().schedule.clone();
        let html = session.client().post_form_body(&url, &self.query.form()).await?;
        let entries = parse_schedule(&html);
        info!("Parsed {} schedule entries", entries.len());

        if !entries.is_empty() {
            if let Err(e) = save_json(&self.cache_path, &entries) {
                warn!("Could not cache schedule: {e:#}");
            }
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<html><body><table id="kbtable">
        <tr><td>
          <div id="1FB6E9938A9149589F498C24834EB7E3-1-1" class="kbcontent1">护理学基础</div>
          <div id="1FB6E9938A9149589F498C24834EB7E3-1-2" style="display: none;" class="kbcontent">护理学基础<br/><font title='老师'>李四讲师</font><br/><font title='周次(节次)'>1-3(周)[01-02节]</font><br/><font title='教室'>护理楼101</font><br/></div>
        </td><td>
          <div id="7A0C-3-2" class="kbcontent">内科护理学<br/><font title='老师'>王五</font><br/><font title='周次(节次)'>2,4(周)[05-06节]</font><br/><font title='教室'>实验楼203</font><br/>---------------------<br>外科护理学<br/><font title='老师'>赵六</font><br/><font title='周次(节次)'>5(周)[07-08节]</font><br/><font title='教室'>护理楼305</font><br/></div>
        </td><td>
          <div id="7A0C-5-2" class="kbcontent">&nbsp;</div>
          <div id="broken" class="kbcontent">孤儿<br/></div>
          <div id="7A0C-9-2" class="kbcontent">越界<br/><font title='周次(节次)'>1(周)[01-02节]</font></div>
        </td></tr></table></body></html>"#;

    #[test]
    fn time_info_expands_ranges() {
        assert_eq!(
            parse_time_info("1-3,5(周)[01-02节]"),
            (vec![1, 2, 3, 5], "01-02节".to_string())
        );
        assert_eq!(
            parse_time_info("3,1-2,2(周)[03-04节]"),
            (vec![1, 2, 3], "03-04节".to_string())
        );
        assert_eq!(parse_time_info("x-y,4(周)"), (vec![4], String::new()));
        assert_eq!(parse_time_info("no weeks here"), (vec![], String::new()));
    }

    #[test]
    fn time_info_skips_absurd_week_ranges() {
        assert_eq!(
            parse_time_info("1-20000000(周)[01-02节]"),
            (vec![], "01-02节".to_string())
        );
        assert_eq!(
            parse_time_info("9-3,2,4000000000,5-6(周)[03-04节]"),
            (vec![2, 5, 6], "03-04节".to_string())
        );
        assert_eq!(parse_time_info("1-60(周)").0.len(), 60);
    }

    #[test]
    fn period_helpers_map_known_slots() {
        assert_eq!(time_slot("09-10节"), "910");
        assert_eq!(time_slot("13-14节"), "12");
        assert_eq!(period_name("11-12节"), "第11-12节");
        assert_eq!(period_name("13-14节"), "13-14节");
        assert_eq!(period_name(""), "未知时间");
        assert_eq!(weekday_name(7), "星期日");
    }

    #[test]
    fn parses_one_entry_per_week() {
        let entries = parse_schedule(PAGE);

        let basics: Vec<_> = entries
            .iter()
            .filter(|e| e.course_name == "护理学基础")
            .collect();
        assert_eq!(basics.len(), 3);
        assert_eq!(basics[0].teacher, "李四讲师");
        assert_eq!(basics[0].classroom, "护理楼101");
        assert_eq!(basics[0].weekday, 1);
        assert_eq!(basics[0].weekday_name, "星期一");
        assert_eq!(basics[0].period_name, "第1-2节");
        assert_eq!(basics[0].time_slot, "12");
        assert_eq!(
            basics.iter().map(|e| e.week).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[test]
    fn splits_stacked_courses_in_one_cell() {
        let entries = parse_schedule(PAGE);
        let wednesday: Vec<_> = entries.iter().filter(|e| e.weekday == 3).collect();
        assert_eq!(wednesday.len(), 3);
        assert_eq!(wednesday[0].course_name, "内科护理学");
        assert_eq!(wednesday[0].time_slot, "56");
        assert_eq!(wednesday[2].course_name, "外科护理学");
        assert_eq!(wednesday[2].teacher, "赵六");
        assert_eq!(wednesday[2].week, 5);
    }

    #[test]
    fn skips_empty_malformed_and_out_of_range_divs() {
        let entries = parse_schedule(PAGE);
        assert_eq!(entries.len(), 6);
        assert!(entries.iter().all(|e| e.course_name != "孤儿"));
        assert!(entries.iter().all(|e| e.course_name != "越界"));
    }

    #[test]
    fn plain_text_blocks_fall_back_to_pattern() {
        let page = r#"<table id="kbtable"><tr><td>
            <div id="AB-2-1" class="kbcontent">病理学<br/>张三<br/>1-2(周)[03-04节]<br/>教学楼A101</div>
            </td></tr></table>"#;
        let entries = parse_schedule(page);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].course_name, "病理学");
        assert_eq!(entries[0].classroom, "教学楼A101");
        assert_eq!(entries[0].periods, "03-04节");
    }

    #[test]
    fn page_without_table_is_empty() {
        assert!(parse_schedule("<html><body><p>请先登录</p></body></html>").is_empty());
    }

    #[test]
    fn query_form_fixes_hidden_fields() {
        let form = ScheduleQuery {
            week: "3".into(),
            term: "2024-2025-2".into(),
        }
        .form();
        assert!(form.contains(&("zc", "3".to_string())));
        assert!(form.contains(&("xnxq01id", "2024-2025-2".to_string())));
        assert!(form.contains(&("sfFD", "1".to_string())));
    }
}
