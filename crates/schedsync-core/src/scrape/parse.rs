//! HTML -> RawSlot
//!
//! `scraper::Html` は Send ではないので、このモジュールは同期関数だけで構成し
//! await を跨いで DOM を持たないようにしています。

use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};

use super::selectors::CompiledSelectors;

/// One slot as it appears in the DOM, before normalization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawSlot {
    pub time_text: Option<String>,
    pub program: Option<String>,
    pub instructor: Option<String>,
    pub status_text: Option<String>,
    /// Coarse flag: attribute first, then the "full" class.
    pub flag_available: bool,
    pub background_color: Option<String>,
    pub text_color: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedPage {
    /// Container found; slots may be empty.
    Schedule(Vec<RawSlot>),
    /// Page rendered something, but not a schedule.
    MissingContainer,
    /// Nothing in `<body>` yet.
    Blank,
}

pub(crate) fn parse_document(html: &str, sel: &CompiledSelectors) -> ParsedPage {
    let doc = Html::parse_document(html);
    let Some(container) = doc.select(&sel.container).next() else {
        return if has_body_content(&doc) {
            ParsedPage::MissingContainer
        } else {
            ParsedPage::Blank
        };
    };
    ParsedPage::Schedule(
        container
            .select(&sel.slot)
            .map(|slot| read_slot(slot, sel))
            .collect(),
    )
}

fn has_body_content(doc: &Html) -> bool {
    static BODY: LazyLock<Selector> =
        LazyLock::new(|| Selector::parse("body").expect("static selector"));
    doc.select(&BODY)
        .next()
        .is_some_and(|body| body.text().any(|t| !t.trim().is_empty()))
}

fn read_slot(slot: ElementRef<'_>, sel: &CompiledSelectors) -> RawSlot {
    let style = slot.value().attr("style").unwrap_or_default();
    RawSlot {
        time_text: text_of(slot, &sel.time),
        program: text_of(slot, &sel.program),
        instructor: text_of(slot, &sel.instructor),
        status_text: text_of(slot, &sel.status),
        flag_available: flag(slot, sel),
        background_color: style_value(style, "background-color")
            .or_else(|| style_value(style, "background")),
        text_color: style_value(style, "color"),
    }
}

/// Trimmed, whitespace-collapsed text of the first match. Empty -> None.
fn text_of(scope: ElementRef<'_>, sel: &Selector) -> Option<String> {
    let el = scope.select(sel).next()?;
    let text = el.text().collect::<Vec<_>>().join(" ");
    let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
    (!text.is_empty()).then_some(text)
}

fn flag(slot: ElementRef<'_>, sel: &CompiledSelectors) -> bool {
    match slot.value().attr(&sel.available_attr).map(str::trim) {
        Some(v) if v.eq_ignore_ascii_case("false") || v == "0" || v.eq_ignore_ascii_case("no") => {
            false
        }
        Some(_) => true,
        None => !slot.value().classes().any(|c| c == sel.full_class),
    }
}

/// Value of one declaration in an inline style attribute.
fn style_value(style: &str, property: &str) -> Option<String> {
    static DECL: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?i)(?:^|;)\s*([a-z-]+)\s*:\s*([^;]+)").expect("static regex")
    });
    DECL.captures_iter(style)
        .find(|c| c[1].eq_ignore_ascii_case(property))
        .map(|c| c[2].trim().to_string())
        .filter(|v| !v.is_empty())
}
