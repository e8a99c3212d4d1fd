use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use itertools::Itertools;
use regex::Regex;

static NON_ALNUM_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^a-zA-Z0-9]+").unwrap());
static SPACES_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());
static MONEY_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d[\d.,]*)").unwrap());
static DECIMAL_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+[.,]?\d*)").unwrap());
static DISTRICT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/departamentos/([^/]+)/([^/?#]+)").unwrap());

const SLUG_MAX: usize = 80;

/// Stable file-name component for a URL. Keeps the tail, where the project id lives.
pub fn slugify(url: &str) -> String {
    let s = NON_ALNUM_RE.replace_all(url, "-");
    let s = s.trim_matches('-');
    if s.len() > SLUG_MAX {
        s[s.len() - SLUG_MAX..].trim_start_matches('-').to_string()
    } else {
        s.to_string()
    }
}

/// Trim, drop the fragment and a trailing slash.
pub fn normalize_url(raw: &str) -> String {
    let u = raw.trim();
    let u = u.split('#').next().unwrap_or_default();
    match u.strip_suffix('/') {
        Some(rest) if rest.len() > "https://".len() => rest.to_string(),
        _ => u.to_string(),
    }
}

/// Parse a newline-delimited URL list. `#` starts a comment line; blanks are skipped;
/// duplicates are dropped keeping first occurrence.
pub fn parse_url_list(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(normalize_url)
        .filter(|u| !u.is_empty())
        .unique()
        .collect()
}

pub fn read_url_list(path: &Path) -> Result<Vec<String>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read URL list {}", path.display()))?;
    Ok(parse_url_list(&contents))
}

pub fn clean_text(s: &str) -> String {
    SPACES_RE.replace_all(s, " ").trim().to_string()
}

/// Repair UTF-8 text that was decoded as latin-1 ("NÃ¡poles" -> "Nápoles").
/// Text that does not round-trip cleanly is returned as is.
pub fn fix_mojibake(s: &str) -> String {
    if !s.chars().any(|c| ('\u{80}'..='\u{FF}').contains(&c)) {
        return s.to_string();
    }
    if s.chars().any(|c| c as u32 > 0xFF) {
        return s.to_string();
    }
    let bytes: Vec<u8> = s.chars().map(|c| c as u32 as u8).collect();
    String::from_utf8(bytes).unwrap_or_else(|_| s.to_string())
}

pub fn normalize_text(s: &str) -> String {
    fix_mojibake(&clean_text(s))
}

/// First numeric chunk of a money-like text; `.` and `,` are thousands separators.
/// "Desde S/ 327,550" -> 327550.0
pub fn parse_money(text: &str) -> Option<f64> {
    let t = normalize_text(text);
    let num = MONEY_RE.captures(&t)?.get(1)?.as_str().replace(['.', ','], "");
    num.parse::<f64>().ok()
}

/// Decimal number from an area text; a lone comma is the decimal separator.
/// "57.04 m²" -> 57.04, "44,63 m²" -> 44.63
pub fn parse_area(text: &str) -> Option<f64> {
    let t = normalize_text(text);
    let raw = DECIMAL_RE.captures(&t)?.get(1)?.as_str().replace(',', ".");
    raw.trim_end_matches('.').parse::<f64>().ok()
}

/// District segment of a listing URL: `/departamentos/<district>/<project>`.
pub fn district_from_url(url: &str) -> Option<String> {
    DISTRICT_RE.captures(url).map(|c| c[1].to_string())
}
