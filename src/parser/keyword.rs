use std::collections::HashSet;
use std::sync::LazyLock;

use itertools::Itertools;
use scraper::{Html, Selector};

use super::{attr_text, first_text, visible_text, Candidate, Strategy};
use crate::model::ExtractionMethod;
use crate::util::fix_mojibake;

static BLOCKS: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("div, section, article, li, p, tr").unwrap());
static OG_TITLE: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("meta[property='og:title']").unwrap());
static TITLE: LazyLock<Vec<Selector>> = LazyLock::new(|| vec![Selector::parse("title").unwrap()]);

const MIN_MARKERS: usize = 2;

/// Count of distinct typology markers in a text block.
pub fn marker_count(text: &str) -> usize {
    let t = fix_mojibake(text).to_lowercase();
    [
        t.contains("modelo"),
        t.contains("desde"),
        t.contains("m²") || t.contains("m2"),
    ]
    .into_iter()
    .filter(|hit| *hit)
    .count()
}

/// Scans every text block for typology markers. Used when the layout-driven pass
/// finds no unit cards or no title.
pub struct KeywordScan;

impl Strategy for KeywordScan {
    fn method(&self) -> ExtractionMethod {
        ExtractionMethod::Fallback
    }

    fn extract(&self, doc: &Html) -> Candidate {
        let matched: Vec<_> = doc
            .select(&BLOCKS)
            .filter_map(|el| {
                let text = visible_text(el);
                (marker_count(&text) >= MIN_MARKERS).then_some((el, text))
            })
            .collect();

        // Keep the innermost matches; an outer container repeats its children's text.
        let ids: HashSet<_> = matched.iter().map(|(el, _)| el.id()).collect();
        let card_texts = matched
            .iter()
            .filter(|(el, _)| !el.descendants().skip(1).any(|n| ids.contains(&n.id())))
            .map(|(_, text)| text.clone())
            .unique()
            .collect::<Vec<_>>();

        // The document title only names the project when the page carries typologies.
        let name = if card_texts.is_empty() {
            None
        } else {
            attr_text(doc, &OG_TITLE, "content")
                .or_else(|| first_text(doc, &TITLE))
                .and_then(|t| {
                    let head = t.split('|').next().unwrap_or_default().trim().to_string();
                    (!head.is_empty()).then_some(head)
                })
        };

        Candidate {
            name,
            address: None,
            card_texts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markers() {
        assert_eq!(marker_count("Modelo A Desde S/ 1 57 m²"), 3);
        assert_eq!(marker_count("Modelo A 57 mÂ²"), 2);
        assert_eq!(marker_count("Desde hoy"), 1);
    }

    #[test]
    fn innermost_blocks_only() {
        let doc = Html::parse_document(
            r#"<html><head><title>Residencial Luna | Nexo</title></head><body>
                <section>
                  <div><b>Modelo L1</b> Desde S/ 300,000 · 61 m²</div>
                  <div><b>Modelo L2</b> Desde S/ 410,000 · 80 m²</div>
                  <div><b>Modelo L2</b> Desde S/ 410,000 · 80 m²</div>
                  <p>Desde el parque, a dos cuadras</p>
                </section>
            </body></html>"#,
        );
        let c = KeywordScan.extract(&doc);
        assert_eq!(c.name.as_deref(), Some("Residencial Luna"));
        assert_eq!(c.card_texts.len(), 2);
        assert!(c.card_texts[0].starts_with("Modelo L1"));
    }
}
