use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::model::{Extraction, TypologyRecord};
use crate::util::clean_text;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffClass {
    FirstSeen,
    Unchanged,
    Changed,
    Empty,
}

impl DiffClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiffClass::FirstSeen => "first_seen",
            DiffClass::Unchanged => "unchanged",
            DiffClass::Changed => "changed",
            DiffClass::Empty => "empty",
        }
    }

    /// Whether an entry with this class can serve as a comparison baseline.
    pub fn is_baseline(&self) -> bool {
        !matches!(self, DiffClass::Empty)
    }
}

impl fmt::Display for DiffClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DiffClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "first_seen" => Ok(DiffClass::FirstSeen),
            "unchanged" => Ok(DiffClass::Unchanged),
            "changed" => Ok(DiffClass::Changed),
            "empty" => Ok(DiffClass::Empty),
            other => Err(format!("unknown diff class '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffOutcome {
    pub classification: DiffClass,
    pub new_hash: String,
}

// ── Canonical form ──
// Field order is the declaration order; timestamps, extraction method and raw card
// text are left out so that re-extracting the same content hashes the same.

#[derive(Serialize)]
struct CanonicalProject {
    url: String,
    slug: String,
    name: Option<String>,
    address: Option<String>,
    district: Option<String>,
    price_from: Option<f64>,
    currency: Option<String>,
    area_unit: String,
    description: Option<String>,
    typologies: Vec<CanonicalTypology>,
}

#[derive(Serialize)]
struct CanonicalTypology {
    label: Option<String>,
    area_m2: Option<f64>,
    price_from: Option<f64>,
    currency: Option<String>,
    units_available: Option<u32>,
    floor_min: Option<u32>,
    floor_max: Option<u32>,
    bedrooms: Option<u32>,
    bathrooms: Option<u32>,
}

impl From<&TypologyRecord> for CanonicalTypology {
    fn from(t: &TypologyRecord) -> Self {
        CanonicalTypology {
            label: norm(&t.label),
            area_m2: t.area_m2,
            price_from: t.price_from,
            currency: norm(&t.currency),
            units_available: t.units_available,
            floor_min: t.floor_min,
            floor_max: t.floor_max,
            bedrooms: t.bedrooms,
            bathrooms: t.bathrooms,
        }
    }
}

fn norm(s: &Option<String>) -> Option<String> {
    s.as_deref().map(clean_text)
}

fn cmp_f64(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => x.total_cmp(&y),
        (a, b) => a.is_some().cmp(&b.is_some()),
    }
}

/// Label + area first, then every remaining field so the order is total.
fn cmp_typology(a: &CanonicalTypology, b: &CanonicalTypology) -> Ordering {
    a.label
        .cmp(&b.label)
        .then_with(|| cmp_f64(a.area_m2, b.area_m2))
        .then_with(|| cmp_f64(a.price_from, b.price_from))
        .then_with(|| a.currency.cmp(&b.currency))
        .then_with(|| a.units_available.cmp(&b.units_available))
        .then_with(|| a.floor_min.cmp(&b.floor_min))
        .then_with(|| a.floor_max.cmp(&b.floor_max))
        .then_with(|| a.bedrooms.cmp(&b.bedrooms))
        .then_with(|| a.bathrooms.cmp(&b.bathrooms))
}

pub fn canonical_json(extraction: &Extraction) -> String {
    let p = &extraction.project;
    let mut typologies: Vec<CanonicalTypology> =
        extraction.typologies.iter().map(CanonicalTypology::from).collect();
    typologies.sort_by(cmp_typology);

    let canonical = CanonicalProject {
        url: p.url.clone(),
        slug: p.slug.clone(),
        name: norm(&p.name),
        address: norm(&p.address),
        district: p.district.clone(),
        price_from: p.price_from,
        currency: norm(&p.currency),
        area_unit: p.area_unit.clone(),
        description: norm(&p.description),
        typologies,
    };
    // Plain structs of strings and numbers always serialize.
    serde_json::to_string(&canonical).unwrap_or_default()
}

/// SHA-256 (hex) over the canonical serialization.
pub fn content_hash(extraction: &Extraction) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(extraction).as_bytes());
    hex::encode(hasher.finalize())
}

/// Classify the current extraction against the last successful hash for its URL.
/// An extraction without typology rows is `Empty` whatever the hashes say.
pub fn diff(current: &Extraction, prior_hash: Option<&str>) -> DiffOutcome {
    let new_hash = content_hash(current);
    let classification = if current.is_empty() {
        DiffClass::Empty
    } else {
        match prior_hash {
            None => DiffClass::FirstSeen,
            Some(prev) if prev == new_hash => DiffClass::Unchanged,
            Some(_) => DiffClass::Changed,
        }
    };
    DiffOutcome {
        classification,
        new_hash,
    }
}
