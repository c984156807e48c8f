use indexmap::IndexMap;
use log::info;
use scraper::Html;

use crate::{
    session::SessionManager,
    text_manipulators::{clean_text, selector},
};

pub type Record = IndexMap<String, String>;

/// Every table on the page, read as a header row followed by data rows.
/// Rows shorter than the header are skipped; extra cells are ignored.
pub fn parse_header_tables(html: &str) -> Vec<Record> {
    let document = Html::parse_document(html);
    let row_selector = selector("tr");
    let cell_selector = selector("th, td");

    let mut records = Vec::new();
    for table in document.select(&selector("table")) {
        let mut rows = table.select(&row_selector);
        let Some(header_row) = rows.next() else {
            continue;
        };
        let headers: Vec<String> = header_row.select(&cell_selector).map(clean_text).collect();

        for row in rows {
            let cells: Vec<_> = row.select(&cell_selector).collect();
            if cells.len() < headers.len() {
                continue;
            }
            let record: Record = headers
                .iter()
                .cloned()
                .zip(cells.into_iter().map(clean_text))
                .collect();
            if !record.is_empty() {
                records.push(record);
            }
        }
    }
    records
}

/// Numbered text blocks, one per record, leaving out empty values.
pub fn format_records(title: &str, records: &[Record]) -> String {
    if records.is_empty() {
        return format!("暂无{title}");
    }

    let mut out = vec![title.to_string(), "=".repeat(60)];
    for (i, record) in records.iter().enumerate() {
        out.push(String::new());
        out.push(format!("[{}]", i + 1));
        out.push("-".repeat(30));
        out.extend(
            record
                .iter()
                .filter(|(_, value)| !value.is_empty())
                .map(|(key, value)| format!("{key}: {value}")),
        );
    }
    out.join("\n")
}

/// Which listing page to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Listing {
    Exams,
    Evaluations,
}

impl Listing {
    pub fn title(self) -> &'static str {
        match self {
            Listing::Exams => "考试安排",
            Listing::Evaluations => "课程评价",
        }
    }
}

pub async fn scrape_listing(
    session: &mut SessionManager,
    listing: Listing,
) -> anyhow::Result<Vec<Record>> {
    session.ensure_logged_in().await?;
    let url = match listing {
        Listing::Exams => session.endpoints().exams.clone(),
        Listing::Evaluations => session.endpoints().evaluations.clone(),
    };
    let html = session.client().fetch_url_body(&url).await?;
    let records = parse_header_tables(&html);
    info!("Parsed {} {} rows", records.len(), listing.title());
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMS: &str = r#"<html><body>
        <table id="dataList">
          <tr><th>序号</th><th>课程名称</th><th>考试时间</th><th>考场</th></tr>
          <tr><td>1</td><td>内科护理学</td><td>2025-01-06 09:00~11:00</td><td>A101</td></tr>
          <tr><td>2</td><td>病理学</td><td>2025-01-08 14:00~16:00</td><td></td><td>extra</td></tr>
          <tr><td colspan="4">未查询到数据</td></tr>
        </table></body></html>"#;

    #[test]
    fn rows_map_onto_headers() {
        let records = parse_header_tables(EXAMS);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["课程名称"], "内科护理学");
        assert_eq!(records[0]["考场"], "A101");
        assert_eq!(records[1].len(), 4);
        assert_eq!(
            records[1].keys().collect::<Vec<_>>(),
            vec!["序号", "课程名称", "考试时间", "考场"]
        );
    }

    #[test]
    fn format_skips_empty_values() {
        let records = parse_header_tables(EXAMS);
        let text = format_records("考试安排", &records);
        assert!(text.starts_with("考试安排\n"));
        assert!(text.contains("[2]\n"));
        assert!(text.contains("课程名称: 病理学"));
        assert!(!text.contains("考场: \n"));
        assert!(!text.ends_with("考场: "));
    }

    #[test]
    fn empty_listing_says_so() {
        assert_eq!(format_records("课程评价", &[]), "暂无课程评价");
        assert!(parse_header_tables("<table></table><p>none</p>").is_empty());
    }
}
