use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const SOURCE: &str = "nexo_inmobiliario";
pub const AREA_UNIT: &str = "m2";

/// Which strategy produced the typology rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    /// Title and unit cards found through the site's own layout.
    Primary,
    /// Keyword scan recovered at least one typology row.
    Fallback,
    /// Keyword scan ran and found nothing either.
    FallbackAttempted,
}

impl ExtractionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractionMethod::Primary => "primary",
            ExtractionMethod::Fallback => "fallback",
            ExtractionMethod::FallbackAttempted => "fallback_attempted",
        }
    }
}

impl std::str::FromStr for ExtractionMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "primary" => Ok(ExtractionMethod::Primary),
            "fallback" => Ok(ExtractionMethod::Fallback),
            "fallback_attempted" => Ok(ExtractionMethod::FallbackAttempted),
            other => Err(format!("unknown extraction method '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub source: String,
    pub url: String,
    pub slug: String,
    pub name: Option<String>,
    pub address: Option<String>,
    pub district: Option<String>,
    pub price_from: Option<f64>,
    pub currency: Option<String>,
    pub area_unit: String,
    pub description: Option<String>,
    pub typology_count: usize,
    pub extracted_at: DateTime<Utc>,
    pub extraction_method: ExtractionMethod,
}

impl ProjectRecord {
    /// True when none of the fields that identify a listing were found.
    pub fn is_blank(&self) -> bool {
        self.name.is_none() && self.address.is_none() && self.price_from.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypologyRecord {
    pub project_slug: String,
    pub label: Option<String>,
    pub area_m2: Option<f64>,
    pub price_from: Option<f64>,
    pub currency: Option<String>,
    pub units_available: Option<u32>,
    pub floor_min: Option<u32>,
    pub floor_max: Option<u32>,
    pub bedrooms: Option<u32>,
    pub bathrooms: Option<u32>,
    pub raw: Option<String>,
    pub parse_ok: bool,
}

/// One page's structured output.
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub project: ProjectRecord,
    pub typologies: Vec<TypologyRecord>,
    /// Card texts that fed typology parsing, kept for the debug dump.
    pub card_texts: Vec<String>,
}

impl Extraction {
    pub fn is_empty(&self) -> bool {
        self.typologies.is_empty()
    }

    /// Non-listing content: nothing at all was recognised.
    pub fn is_blank(&self) -> bool {
        self.typologies.is_empty() && self.project.is_blank()
    }

    pub fn parse_ok_rows(&self) -> usize {
        self.typologies.iter().filter(|t| t.parse_ok).count()
    }
}
