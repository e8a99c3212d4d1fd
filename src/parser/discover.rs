use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use url::Url;

use super::visible_text;
use crate::util::normalize_url;

pub const SITE_BASE: &str = "https://nexoinmobiliario.pe";

static CARD: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("div.carousel-extra-section-otros-card").unwrap());
static BUTTON: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a.carousel-extra-section-otros-btn[href]").unwrap());
static SHARE: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("div.carousel-extra-section-otros-share[data-url]").unwrap());
static TITLE: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("h3.carousel-extra-section-otros-title").unwrap());
static PRICE: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("div.carousel-extra-section-otros-price").unwrap());
static BADGE: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("div.carousel-extra-section-otros-badge").unwrap());
static ID_SUFFIX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"-(\d+)$").unwrap());

/// A project linked from another project's "otros proyectos" carousel.
#[derive(Debug, Clone, PartialEq)]
pub struct RelatedProject {
    pub url: String,
    pub project_id: Option<String>,
    pub title: Option<String>,
    pub price_text: Option<String>,
    pub badge: Option<String>,
}

fn child_text(card: ElementRef, sel: &Selector) -> Option<String> {
    card.select(sel)
        .next()
        .map(visible_text)
        .filter(|t| !t.is_empty())
}

fn project_id(url: &Url) -> Option<String> {
    ID_SUFFIX
        .captures(url.path().trim_end_matches('/'))
        .map(|c| c[1].to_string())
}

/// Carousel links of one page, deduplicated in page order. Relative links resolve
/// against `base`.
pub fn related_projects(html: &str, base: &str) -> Vec<RelatedProject> {
    let doc = Html::parse_document(html);
    let base = Url::parse(base).or_else(|_| Url::parse(SITE_BASE)).ok();
    let mut seen = HashSet::new();

    doc.select(&CARD)
        .filter_map(|card| {
            let href = card
                .select(&BUTTON)
                .next()
                .and_then(|a| a.value().attr("href"))
                .map(str::trim)
                .filter(|h| !h.is_empty());
            let resolved = match href {
                Some(h) => base.as_ref().and_then(|b| b.join(h).ok()),
                None => card
                    .select(&SHARE)
                    .next()
                    .and_then(|d| d.value().attr("data-url"))
                    .and_then(|u| Url::parse(u.trim()).ok()),
            }?;

            let url = normalize_url(resolved.as_str());
            if !seen.insert(url.clone()) {
                return None;
            }
            Some(RelatedProject {
                project_id: project_id(&resolved),
                title: child_text(card, &TITLE),
                price_text: child_text(card, &PRICE),
                badge: child_text(card, &BADGE),
                url,
            })
        })
        .collect()
}
