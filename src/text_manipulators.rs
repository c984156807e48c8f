use scraper::{ElementRef, Selector};

/// Text with nbsp entities dropped and every text node trimmed before the
/// nodes are joined.
pub fn clean_text(node: ElementRef) -> String {
    strip_nbsp(&node.text().map(str::trim).collect::<String>())
}

pub fn strip_nbsp(text: &str) -> String {
    text.replace('\u{a0}', "").replace("&nbsp;", "").trim().to_string()
}

/// Selectors here are string literals, so a parse failure is a programming error
/// and is reported as such instead of being propagated.
pub fn selector(css: &str) -> Selector {
    match Selector::parse(css) {
        Ok(sel) => sel,
        Err(e) => panic!("invalid built-in selector {css:?}: {e}"),
    }
}
