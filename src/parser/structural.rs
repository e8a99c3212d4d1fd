use std::sync::LazyLock;

use scraper::{Html, Selector};

use super::{first_text, visible_text, Candidate, Strategy};
use crate::model::ExtractionMethod;

static TITLE: LazyLock<Vec<Selector>> =
    LazyLock::new(|| selectors(&["h1", ".project-title", ".titulo"]));

static ADDRESS: LazyLock<Vec<Selector>> = LazyLock::new(|| {
    selectors(&[
        "[data-testid='project-address']",
        ".direccion",
        ".address",
        ".project-address",
    ])
});

/// Unit-card selectors with the minimum hit count that makes each one believable.
/// The bare `.card` class is used all over the site, so it needs at least two hits.
static CARDS: LazyLock<Vec<(Selector, usize)>> = LazyLock::new(|| {
    [
        (".modelo-card", 1),
        (".model-card", 1),
        ("[data-testid='model-card']", 1),
        (".card-modelo", 1),
        (".card", 2),
    ]
    .into_iter()
    .map(|(s, min)| (Selector::parse(s).unwrap(), min))
    .collect()
});

fn selectors(list: &[&str]) -> Vec<Selector> {
    list.iter().map(|s| Selector::parse(s).unwrap()).collect()
}

/// Reads the listing through the site's own layout: title, address block and
/// repeated unit cards.
pub struct Structural;

impl Strategy for Structural {
    fn method(&self) -> ExtractionMethod {
        ExtractionMethod::Primary
    }

    fn extract(&self, doc: &Html) -> Candidate {
        let name = first_text(doc, &TITLE);
        let address = first_text(doc, &ADDRESS);

        let card_texts = CARDS
            .iter()
            .map(|(sel, min)| {
                let texts: Vec<String> = doc
                    .select(sel)
                    .map(visible_text)
                    .filter(|t| !t.is_empty())
                    .collect();
                (texts, *min)
            })
            .find(|(texts, min)| texts.len() >= *min)
            .map(|(texts, _)| texts)
            .unwrap_or_default();

        Candidate {
            name,
            address,
            card_texts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_card_class_is_not_enough() {
        let doc = Html::parse_document(
            r#"<html><body><h1>Torre Sol</h1><div class="card">Modelo A Desde S/ 1</div></body></html>"#,
        );
        let c = Structural.extract(&doc);
        assert_eq!(c.name.as_deref(), Some("Torre Sol"));
        assert!(c.card_texts.is_empty());
    }

    #[test]
    fn specific_card_class_wins() {
        let doc = Html::parse_document(
            r#"<html><body>
                <h1> Torre   Sol </h1>
                <p class="direccion">Av. Brasil 123</p>
                <div class="modelo-card"><span>Modelo A</span><span>Desde S/ 250,000</span></div>
            </body></html>"#,
        );
        let c = Structural.extract(&doc);
        assert_eq!(c.name.as_deref(), Some("Torre Sol"));
        assert_eq!(c.address.as_deref(), Some("Av. Brasil 123"));
        assert_eq!(c.card_texts, vec!["Modelo A Desde S/ 250,000"]);
    }
}
