pub mod card;
pub mod discover;
pub mod keyword;
pub mod structural;

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use scraper::{ElementRef, Html, Selector};

use crate::model::{Extraction, ExtractionMethod, ProjectRecord, AREA_UNIT, SOURCE};
use crate::util::{district_from_url, normalize_text, slugify};
use keyword::KeywordScan;
use structural::Structural;

static BODY: LazyLock<Selector> = LazyLock::new(|| Selector::parse("body").unwrap());
static DESCRIPTION: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("meta[name='description']").unwrap());

const HIDDEN: &[&str] = &["script", "style", "noscript", "template"];

/// What one strategy recovered from a page, before typology parsing.
#[derive(Debug, Default)]
pub struct Candidate {
    pub name: Option<String>,
    pub address: Option<String>,
    pub card_texts: Vec<String>,
}

impl Candidate {
    /// Fallback is skipped only when both a title and at least one card were found.
    fn is_confident(&self) -> bool {
        self.name.is_some() && !self.card_texts.is_empty()
    }
}

pub trait Strategy {
    fn method(&self) -> ExtractionMethod;
    fn extract(&self, doc: &Html) -> Candidate;
}

/// Two-pass extraction: layout selectors first, keyword scan when they come up short.
/// Never fails; a page with nothing recognisable yields a blank record with no rows.
pub fn extract(html: &str, url: &str) -> Extraction {
    extract_at(html, url, Utc::now())
}

pub fn extract_at(html: &str, url: &str, extracted_at: DateTime<Utc>) -> Extraction {
    let doc = Html::parse_document(html);
    let (method, candidate) = run_strategies(&doc, &Structural, &KeywordScan);

    let slug = slugify(url);
    // Without a title or any card this is not a listing page (search, landing, 404).
    let is_listing = candidate.name.is_some() || !candidate.card_texts.is_empty();
    let page_text = doc
        .select(&BODY)
        .next()
        .map(visible_text)
        .filter(|_| is_listing)
        .unwrap_or_default();
    let (currency, price_from) = match card::price_from(&page_text) {
        Some((cur, amount)) => (amount.map(|_| cur), amount),
        None => (None, None),
    };
    let description = attr_text(&doc, &DESCRIPTION, "content").filter(|_| is_listing);

    let typologies: Vec<_> = candidate
        .card_texts
        .iter()
        .map(|t| card::parse_card(&slug, t))
        .collect();

    let project = ProjectRecord {
        source: SOURCE.to_string(),
        url: url.to_string(),
        slug,
        name: candidate.name,
        address: candidate.address,
        district: district_from_url(url),
        price_from,
        currency,
        area_unit: AREA_UNIT.to_string(),
        description,
        typology_count: typologies.len(),
        extracted_at,
        extraction_method: method,
    };

    Extraction {
        project,
        typologies,
        card_texts: candidate.card_texts,
    }
}

fn run_strategies(
    doc: &Html,
    primary: &dyn Strategy,
    fallback: &dyn Strategy,
) -> (ExtractionMethod, Candidate) {
    let first = primary.extract(doc);
    if first.is_confident() {
        return (primary.method(), first);
    }

    // The flag names the strategy whose cards became the typology rows.
    let second = fallback.extract(doc);
    let (method, card_texts) = if !second.card_texts.is_empty() {
        (fallback.method(), second.card_texts)
    } else if !first.card_texts.is_empty() {
        (primary.method(), first.card_texts)
    } else {
        (ExtractionMethod::FallbackAttempted, Vec::new())
    };

    (
        method,
        Candidate {
            name: first.name.or(second.name),
            address: first.address.or(second.address),
            card_texts,
        },
    )
}

/// Whitespace-normalized text of an element, skipping script/style content.
pub fn visible_text(el: ElementRef) -> String {
    let parts: Vec<&str> = el
        .descendants()
        .filter_map(|node| {
            let text = node.value().as_text()?;
            let parent = node.parent()?.value().as_element()?;
            if HIDDEN.contains(&parent.name()) {
                return None;
            }
            let t = text.trim();
            (!t.is_empty()).then_some(t)
        })
        .collect();
    normalize_text(&parts.join(" "))
}

/// Text of the first element matched by any selector, in selector order.
pub fn first_text(doc: &Html, selectors: &[Selector]) -> Option<String> {
    selectors.iter().find_map(|sel| {
        doc.select(sel)
            .map(visible_text)
            .find(|t| !t.is_empty())
    })
}

pub fn attr_text(doc: &Html, selector: &Selector, attr: &str) -> Option<String> {
    doc.select(selector)
        .filter_map(|el| el.value().attr(attr))
        .map(normalize_text)
        .find(|t| !t.is_empty())
}
