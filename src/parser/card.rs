use std::sync::LazyLock;

use regex::Regex;

use crate::model::TypologyRecord;
use crate::util::{normalize_text, parse_area, parse_money};

static MODEL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bModelo\s*([A-Za-z0-9][A-Za-z0-9_-]*)").unwrap());
static UNITS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\d+)\s+unidad(?:es)?\s+disponibles?").unwrap());
static PRICE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)Desde\s*(S/|US\$)\s*([\d.,]+)").unwrap());
static AREA_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"([\d.,]+)\s*m(?:²|2)").unwrap());
static FLOORS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bPisos?\s*(\d+)(?:\s*al\s*(\d+))?").unwrap());
static BEDS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)(\d+)\s*dorm").unwrap());
static BATHS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)(\d+)\s*baño").unwrap());

/// First `Desde <currency> <amount>` in a text.
pub fn price_from(text: &str) -> Option<(String, Option<f64>)> {
    let caps = PRICE_RE.captures(text)?;
    let currency = caps[1].to_uppercase();
    Some((currency, parse_money(&caps[2])))
}

/// Parse one unit card's text into a typology row.
///
/// Each field is matched on its own, so a card missing one attribute still yields
/// the others. `parse_ok` is set only when label, area and price were all found.
pub fn parse_card(project_slug: &str, text: &str) -> TypologyRecord {
    let raw = normalize_text(text);

    let label = MODEL_RE.captures(&raw).map(|c| c[1].to_string());
    let units_available = capture_u32(&UNITS_RE, &raw, 1);
    let (currency, price) = match price_from(&raw) {
        Some((cur, amount)) => (Some(cur), amount),
        None => (None, None),
    };
    let area_m2 = AREA_RE.captures(&raw).and_then(|c| parse_area(&c[1]));

    let (floor_min, floor_max) = match FLOORS_RE.captures(&raw) {
        Some(c) => {
            let min = c.get(1).and_then(|m| m.as_str().parse::<u32>().ok());
            let max = c.get(2).and_then(|m| m.as_str().parse::<u32>().ok()).or(min);
            (min, max)
        }
        None => (None, None),
    };

    let bedrooms = capture_u32(&BEDS_RE, &raw, 1);
    let bathrooms = capture_u32(&BATHS_RE, &raw, 1);
    let parse_ok = label.is_some() && area_m2.is_some() && price.is_some();

    TypologyRecord {
        project_slug: project_slug.to_string(),
        label,
        area_m2,
        price_from: price,
        currency: if price.is_some() { currency } else { None },
        units_available,
        floor_min,
        floor_max,
        bedrooms,
        bathrooms,
        raw: Some(raw),
        parse_ok,
    }
}

fn capture_u32(re: &Regex, text: &str, group: usize) -> Option<u32> {
    re.captures(text)?.get(group)?.as_str().parse().ok()
}
