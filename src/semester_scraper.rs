use log::info;
use scraper::Html;
use serde::Serialize;

use crate::{
    error::ScrapeError,
    session::SessionManager,
    text_manipulators::{clean_text, selector},
};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Semesters {
    pub terms: Vec<String>,
    pub current: String,
    pub user_name: String,
}

pub fn parse_semesters(html: &str) -> Option<Semesters> {
    let document = Html::parse_document(html);
    let select = document.select(&selector("select#xnxq01id")).next()?;

    let terms = select
        .select(&selector("option"))
        .map(clean_text)
        .filter(|t| !t.is_empty())
        .collect();
    let current = select
        .select(&selector(r#"option[selected="selected"]"#))
        .next()
        .map(clean_text)
        .unwrap_or_default();
    let user_name = document
        .select(&selector("div#Top1_divLoginName"))
        .next()
        .map(|div| {
            let text = clean_text(div);
            text.split('(').next().unwrap_or_default().to_string()
        })
        .unwrap_or_default();

    Some(Semesters {
        terms,
        current,
        user_name,
    })
}

pub async fn scrape_semesters(session: &mut SessionManager) -> anyhow::Result<Semesters> {
    session.ensure_logged_in().await?;
    let url = session.endpoints().schedule.clone();
    let html = session.client().fetch_url_body(&url).await?;
    let semesters = parse_semesters(&html).ok_or(ScrapeError::MissingElement {
        url,
        element: "term selector",
    })?;
    info!(
        "{} terms available, current term {:?}",
        semesters.terms.len(),
        semesters.current
    );
    Ok(semesters)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_terms_current_and_name() {
        let html = r#"<html><body>
            <div id="Top1_divLoginName" class="Nsb_top_menu_nc">张三(2023010101)</div>
            <select id="xnxq01id" name="xnxq01id">
              <option value=""></option>
              <option value="2024-2025-2">2024-2025-2</option>
              <option selected="selected" value="2024-2025-1">2024-2025-1</option>
              <option value="2023-2024-2">2023-2024-2</option>
            </select></body></html>"#;
        let semesters = parse_semesters(html).unwrap();
        assert_eq!(
            semesters.terms,
            vec!["2024-2025-2", "2024-2025-1", "2023-2024-2"]
        );
        assert_eq!(semesters.current, "2024-2025-1");
        assert_eq!(semesters.user_name, "张三");
    }

    #[test]
    fn missing_select_is_none() {
        assert_eq!(parse_semesters("<html><body>登录超时</body></html>"), None);
    }

    #[test]
    fn missing_name_and_selection_default_to_empty() {
        let html = r#"<select id="xnxq01id"><option>2024-2025-1</option></select>"#;
        let semesters = parse_semesters(html).unwrap();
        assert_eq!(semesters.current, "");
        assert_eq!(semesters.user_name, "");
    }
}
