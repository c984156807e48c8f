use indexmap::IndexMap;
use log::{debug, info, warn};
use scraper::{ElementRef, Html};
use serde::Serialize;

use crate::{
    session::SessionManager,
    text_manipulators::{clean_text, selector},
};

const IMPORTANT_KEYS: [&str; 8] = ["姓名", "学号", "性别", "专业", "班级", "年级", "学院", "院系"];
const BORDERED_ROW: &str = "border:1px solid black";
// Index of the row holding "院系：..  专业：.." style cells.
const SUMMARY_ROW: usize = 2;
const MAX_KEY_CHARS: usize = 20;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StudentInfo {
    pub title: String,
    pub fields: IndexMap<String, String>,
    pub photo_url: Option<String>,
}

fn parse_summary_row(row: ElementRef, fields: &mut IndexMap<String, String>) {
    for cell in row.select(&selector("td")) {
        let text = clean_text(cell);
        let parts: Vec<_> = text.split('：').collect();
        if let [key, value] = parts.as_slice() {
            fields.insert(key.to_string(), value.to_string());
        }
    }
}

/// Label and value cells alternate, but blank spacer cells and long notes
/// break the rhythm, so walk with a cursor and only consume a pair when it
/// looks like one.
fn parse_bordered_row(row: ElementRef, fields: &mut IndexMap<String, String>) {
    let img = selector("img");
    let texts: Vec<String> = row
        .select(&selector("td"))
        .filter(|cell| cell.select(&img).next().is_none() && !cell.html().contains("rowspan"))
        .map(clean_text)
        .collect();

    let mut i = 0;
    while i + 1 < texts.len() {
        let (key, value) = (&texts[i], &texts[i + 1]);
        if !key.is_empty() && !value.is_empty() && key != value && key.chars().count() < MAX_KEY_CHARS
        {
            fields.insert(key.clone(), value.clone());
            i += 2;
        } else {
            i += 1;
        }
    }
}

pub fn parse_student_info(html: &str) -> StudentInfo {
    let document = Html::parse_document(html);
    let mut info = StudentInfo {
        title: document
            .select(&selector("title"))
            .next()
            .map(clean_text)
            .unwrap_or_default(),
        ..StudentInfo::default()
    };

    match document.select(&selector("table#xjkpTable")).next() {
        Some(table) => {
            let td = selector("td");
            for (idx, row) in table.select(&selector("tr")).enumerate() {
                if row.select(&td).next().is_none() {
                    continue;
                }
                if idx == SUMMARY_ROW {
                    parse_summary_row(row, &mut info.fields);
                } else if row.html().contains(BORDERED_ROW) {
                    parse_bordered_row(row, &mut info.fields);
                }
            }
        }
        None => warn!("Student card table not found"),
    }

    info.photo_url = document.select(&selector("img")).find_map(|img| {
        let src = img.value().attr("src").unwrap_or_default();
        let alt = img.value().attr("alt").unwrap_or_default();
        (src.contains("xszpLoad") || alt.contains("照片")).then(|| src.to_string())
    });

    debug!("Parsed {} student info fields", info.fields.len());
    info
}

pub fn format_student_info(info: &StudentInfo) -> String {
    if info.fields.is_empty() && info.photo_url.is_none() {
        return "无学生信息".to_string();
    }

    let mut out = vec!["学生信息".to_string(), "=".repeat(40)];
    for key in IMPORTANT_KEYS {
        if let Some(value) = info.fields.get(key) {
            out.push(format!("{key}: {value}"));
        }
    }
    out.push("-".repeat(40));
    out.extend(
        info.fields
            .iter()
            .filter(|(key, _)| !IMPORTANT_KEYS.contains(&key.as_str()))
            .map(|(key, value)| format!("{key}: {value}")),
    );
    if let Some(photo) = &info.photo_url {
        out.push("-".repeat(40));
        out.push(format!("学生照片: {photo}"));
    }
    out.join("\n")
}

pub async fn scrape_student_info(session: &mut SessionManager) -> anyhow::Result<StudentInfo> {
    session.ensure_logged_in().await?;
    let url = session.endpoints().student_info.clone();
    let html = session.client().fetch_url_body(&url).await?;
    let info = parse_student_info(&html);
    info!("Fetched {} student info fields", info.fields.len());
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CARD: &str = r#"<html><head><title>学籍卡片</title></head><body>
        <table id="xjkpTable">
          <tr><td>长沙医学院学生学籍卡片</td></tr>
          <tr><td>&nbsp;</td></tr>
          <tr><td>院系：护理学院</td><td>专业：护理学</td><td>学制：4</td><td>no colon</td></tr>
          <tr style="border:1px solid black">
            <td>姓名</td><td>张三</td><td>性别</td><td>女</td>
            <td rowspan="4"><img src="/jsxsd/grxx/xszpLoad?xh=1" alt="照片"/></td>
          </tr>
          <tr>
            <td style="border:1px solid black">学号</td><td>2023010101</td>
            <td></td><td>民族</td><td>汉族</td>
          </tr>
          <tr style="border:1px solid black">
            <td>这是一段非常非常非常长的说明文字并不是字段名称</td><td>备注</td><td>无</td>
            <td>班级</td><td>班级</td>
          </tr>
        </table></body></html>"#;

    #[test]
    fn reads_summary_and_bordered_rows() {
        let info = parse_student_info(CARD);
        assert_eq!(info.title, "学籍卡片");
        assert_eq!(info.fields["院系"], "护理学院");
        assert_eq!(info.fields["专业"], "护理学");
        assert_eq!(info.fields["姓名"], "张三");
        assert_eq!(info.fields["性别"], "女");
        assert_eq!(info.fields["学号"], "2023010101");
        assert_eq!(info.fields["民族"], "汉族");
        assert_eq!(info.fields["备注"], "无");
        assert!(!info.fields.contains_key("班级"));
        assert_eq!(info.photo_url.as_deref(), Some("/jsxsd/grxx/xszpLoad?xh=1"));
    }

    #[test]
    fn important_fields_print_first() {
        let text = format_student_info(&parse_student_info(CARD));
        let name = text.find("姓名: 张三").unwrap();
        let dept = text.find("院系: 护理学院").unwrap();
        let nation = text.find("民族: 汉族").unwrap();
        assert!(name < dept);
        assert!(dept < nation);
        assert!(text.ends_with("学生照片: /jsxsd/grxx/xszpLoad?xh=1"));
    }

    #[test]
    fn empty_page_formats_as_none() {
        let info = parse_student_info("<html><body></body></html>");
        assert!(info.fields.is_empty());
        assert_eq!(format_student_info(&info), "无学生信息");
    }
}
