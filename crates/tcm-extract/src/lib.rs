//! Rule-based extraction pipeline: free text in, confidence-scored
//! compliance alerts out.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use sha2::{Digest, Sha256};
use tcm_core::{ComplianceAlert, RawArticle, RestrictionType, SourceReliability};

pub const CRATE_NAME: &str = "tcm-extract";

/// Candidates scoring below this never become alerts.
pub const CONFIDENCE_THRESHOLD: u8 = 70;

/// Canonical country name plus the lowercase aliases that map to it.
/// Alias hits are normalized to the canonical form; matching is
/// boundary-checked so "us" never fires inside "industry".
pub static COUNTRY_ALIASES: &[(&str, &[&str])] = &[
    (
        "United States",
        &[
            "united states",
            "u.s.a.",
            "u.s.a",
            "u.s.",
            "u.s",
            "usa",
            "us",
            "america",
        ],
    ),
    (
        "United Kingdom",
        &["united kingdom", "u.k.", "u.k", "uk", "britain", "great britain", "england"],
    ),
    (
        "European Union",
        &["european union", "e.u.", "e.u", "eu", "europe", "eurozone"],
    ),
    ("China", &["china"]),
    ("Taiwan", &["taiwan"]),
    ("Japan", &["japan"]),
    ("South Korea", &["south korea", "republic of korea", "s. korea"]),
    ("North Korea", &["north korea", "dprk"]),
    ("India", &["india"]),
    ("Russia", &["russia"]),
    ("Ukraine", &["ukraine"]),
    ("Germany", &["germany"]),
    ("France", &["france"]),
    ("Italy", &["italy"]),
    ("Spain", &["spain"]),
    ("Netherlands", &["netherlands", "holland"]),
    ("Belgium", &["belgium"]),
    ("Switzerland", &["switzerland"]),
    ("Sweden", &["sweden"]),
    ("Norway", &["norway"]),
    ("Poland", &["poland"]),
    ("Turkey", &["turkey", "turkiye"]),
    ("Canada", &["canada"]),
    ("Mexico", &["mexico"]),
    ("Brazil", &["brazil"]),
    ("Argentina", &["argentina"]),
    ("Chile", &["chile"]),
    ("Australia", &["australia"]),
    ("New Zealand", &["new zealand"]),
    ("Vietnam", &["vietnam"]),
    ("Thailand", &["thailand"]),
    ("Indonesia", &["indonesia"]),
    ("Malaysia", &["malaysia"]),
    ("Singapore", &["singapore"]),
    ("Philippines", &["philippines"]),
    ("Saudi Arabia", &["saudi arabia", "saudi"]),
    ("United Arab Emirates", &["united arab emirates", "uae", "u.a.e."]),
    ("Israel", &["israel"]),
    ("Iran", &["iran"]),
    ("Egypt", &["egypt"]),
    ("South Africa", &["south africa"]),
    ("Nigeria", &["nigeria"]),
];

/// Restriction categories in fixed priority order; the first category with
/// any keyword hit wins. Note that "embargo" sits in the sanction set and
/// sanction outranks embargo, so embargo-only text classifies as sanction;
/// the embargo category is reached via blockade/siege.
pub static RESTRICTION_KEYWORDS: &[(RestrictionType, &[&str])] = &[
    (
        RestrictionType::Tariff,
        &["tariff", "duty", "tax", "levy", "import tax", "export tax"],
    ),
    (
        RestrictionType::Ban,
        &["ban", "prohibition", "restricted", "not allowed", "illegal", "forbidden"],
    ),
    (
        RestrictionType::Quota,
        &["quota", "limit", "threshold", "ceiling", "cap"],
    ),
    (
        RestrictionType::License,
        &["license", "permit", "authorization", "certificate", "documentation"],
    ),
    (
        RestrictionType::Sanction,
        &["sanction", "penalty", "punishment", "embargo", "boycott"],
    ),
    (RestrictionType::Embargo, &["embargo", "blockade", "siege"]),
];

/// Product categories in fixed priority order, each with the keywords that
/// select it. Keywords are broader than the category label so that e.g. an
/// "oil" headline yields `petroleum`; more specific categories sit above
/// the generic ones they would otherwise shadow.
pub static PRODUCT_CATEGORIES: &[(&str, &[&str])] = &[
    ("semiconductor", &["semiconductor", "chip", "microchip", "integrated circuit"]),
    ("solar panel", &["solar panel", "photovoltaic"]),
    ("battery", &["battery", "lithium-ion", "lithium ion"]),
    ("electric vehicle", &["electric vehicle"]),
    ("automotive", &["automotive", "auto part", "vehicle", "car", "automobile"]),
    ("aircraft", &["aircraft", "aerospace", "airplane"]),
    ("machinery", &["machinery", "machine tool"]),
    ("steel", &["steel"]),
    ("aluminum", &["aluminum", "aluminium"]),
    ("copper", &["copper"]),
    ("rare earth", &["rare earth"]),
    ("crude oil", &["crude oil", "crude"]),
    ("petroleum", &["petroleum", "oil", "gasoline", "diesel"]),
    ("natural gas", &["natural gas", "lng"]),
    ("pharmaceutical", &["pharmaceutical", "medicine", "drug", "vaccine"]),
    ("medical device", &["medical device", "medical equipment"]),
    ("wheat", &["wheat", "grain"]),
    ("corn", &["corn", "maize"]),
    ("soybean", &["soybean", "soy"]),
    ("beef", &["beef", "cattle"]),
    ("pork", &["pork"]),
    ("poultry", &["poultry", "chicken"]),
    ("dairy", &["dairy", "milk", "cheese"]),
    ("sugar", &["sugar"]),
    ("coffee", &["coffee"]),
    ("cotton", &["cotton"]),
    ("textile", &["textile", "apparel", "garment", "clothing"]),
    ("lumber", &["lumber", "timber", "softwood"]),
    ("fertilizer", &["fertilizer"]),
    ("chemicals", &["chemical"]),
    ("plastics", &["plastic", "polymer"]),
    ("electronics", &["electronics", "smartphone", "laptop"]),
    ("wine", &["wine", "spirits", "whiskey"]),
];

static RATE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+(?:\.\d+)?\s*%").unwrap());

/// Date phrasings in priority order; the first pattern that matches wins
/// and its capture is returned verbatim.
static DATE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        // "effective April 1, 2025", "starting March 15", "beginning January 2026"
        r"(?i)\b(?:effective|starting|beginning|from)\s+((?:january|february|march|april|may|june|july|august|september|october|november|december)(?:\s+\d{1,2}(?:st|nd|rd|th)?\b)?(?:,?\s+\d{4})?)",
        // "effective 2025-04-01", "starting 03/15/2025"
        r"(?i)\b(?:effective|starting|beginning|from)\s+(\d{4}-\d{2}-\d{2}|\d{1,2}/\d{1,2}/\d{2,4})\b",
        r"(?i)\b(?:effective|starting)\s+(immediately)\b",
        r"(?i)\b(with\s+immediate\s+effect)\b",
        r"(?i)\b(next\s+(?:week|month|year))\b",
        r"(?i)\b(immediately)\b",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).unwrap())
    .collect()
});

fn boundary_byte(byte: Option<&u8>) -> bool {
    byte.map_or(true, |b| !b.is_ascii_alphanumeric())
}

/// Whole-word occurrence search over lowercase text. `needle` must be
/// lowercase. With `inflected`, a trailing "s"/"es" on the match is also
/// accepted so singular keywords hit plural headlines.
fn find_term_inner(haystack: &str, needle: &str, inflected: bool) -> Option<usize> {
    if needle.is_empty() {
        return None;
    }
    let bytes = haystack.as_bytes();
    let mut start = 0;
    while let Some(pos) = haystack[start..].find(needle) {
        let abs = start + pos;
        let end = abs + needle.len();
        let before_ok = abs == 0 || !bytes[abs - 1].is_ascii_alphanumeric();
        let after_ok = boundary_byte(bytes.get(end))
            || (inflected
                && (bytes.get(end) == Some(&b's') && boundary_byte(bytes.get(end + 1))
                    || (bytes.get(end) == Some(&b'e')
                        && bytes.get(end + 1) == Some(&b's')
                        && boundary_byte(bytes.get(end + 2)))));
        if before_ok && after_ok {
            return Some(abs);
        }
        // needle starts with an ASCII byte whenever it matched, so +1 stays
        // on a char boundary
        start = abs + 1;
    }
    None
}

fn find_term(haystack: &str, needle: &str) -> Option<usize> {
    find_term_inner(haystack, needle, false)
}

fn contains_term(haystack: &str, needle: &str) -> bool {
    find_term(haystack, needle).is_some()
}

fn contains_keyword(haystack: &str, needle: &str) -> bool {
    find_term_inner(haystack, needle, true).is_some()
}

fn aliases_for(canonical: &str) -> &'static [&'static str] {
    COUNTRY_ALIASES
        .iter()
        .find(|(name, _)| *name == canonical)
        .map(|(_, aliases)| *aliases)
        .unwrap_or(&[])
}

/// Distinct normalized country names ordered by first occurrence in the
/// text; empty when none are mentioned.
pub fn extract_countries(text: &str) -> Vec<String> {
    let lower = text.to_lowercase();
    let mut found: Vec<(usize, &str)> = Vec::new();
    for (canonical, aliases) in COUNTRY_ALIASES {
        let earliest = aliases
            .iter()
            .filter_map(|alias| find_term(&lower, alias))
            .min();
        if let Some(pos) = earliest {
            found.push((pos, canonical));
        }
    }
    found.sort_by_key(|(pos, _)| *pos);
    found.into_iter().map(|(_, name)| name.to_string()).collect()
}

/// First percentage expression in the text, verbatim.
pub fn extract_tariff_rate(text: &str) -> Option<String> {
    RATE_PATTERN.find(text).map(|m| m.as_str().to_string())
}

/// First date-like phrase near a trigger word, or a relative phrasing,
/// verbatim. Patterns are tried in fixed priority order.
pub fn extract_effective_date(text: &str) -> Option<String> {
    for pattern in DATE_PATTERNS.iter() {
        if let Some(captures) = pattern.captures(text) {
            if let Some(matched) = captures.get(1) {
                return Some(matched.as_str().trim().to_string());
            }
        }
    }
    None
}

/// First restriction category with a keyword hit, in fixed category order;
/// `restriction` when nothing matches.
pub fn extract_restriction_type(text: &str) -> RestrictionType {
    let lower = text.to_lowercase();
    for (kind, keywords) in RESTRICTION_KEYWORDS {
        if keywords.iter().any(|keyword| contains_keyword(&lower, keyword)) {
            return *kind;
        }
    }
    RestrictionType::Restriction
}

/// First product category with a keyword hit, in fixed table order.
pub fn extract_product(text: &str) -> Option<String> {
    let lower = text.to_lowercase();
    for (category, keywords) in PRODUCT_CATEGORIES {
        if keywords.iter().any(|keyword| contains_keyword(&lower, keyword)) {
            return Some((*category).to_string());
        }
    }
    None
}

/// Split found countries into (origin, destination) sets.
///
/// Both rules are evaluated independently per country: "from X" /
/// "X export…" marks an origin, "to X" / "X import…" marks a destination,
/// neither defaults to origin. A country matched by both ends up in the
/// destination set only — the final subtraction keeps the sets disjoint.
pub fn split_directions(text: &str, countries: &[String]) -> (Vec<String>, Vec<String>) {
    let lower = text.to_lowercase();
    let mut origins = Vec::new();
    let mut destinations = Vec::new();
    for country in countries {
        let aliases = aliases_for(country);
        let is_origin = aliases.iter().any(|alias| {
            contains_term(&lower, &format!("from {alias}"))
                || contains_keyword(&lower, &format!("{alias} export"))
        });
        let is_destination = aliases.iter().any(|alias| {
            contains_term(&lower, &format!("to {alias}"))
                || contains_keyword(&lower, &format!("{alias} import"))
        });
        if is_origin {
            origins.push(country.clone());
        }
        if is_destination {
            destinations.push(country.clone());
        }
        if !is_origin && !is_destination {
            origins.push(country.clone());
        }
    }
    origins.retain(|country| !destinations.contains(country));
    (origins, destinations)
}

/// Which extracted fields are present, for scoring.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtractionSignals {
    pub has_tariff_rate: bool,
    pub has_effective_date: bool,
    pub has_country: bool,
    pub has_product: bool,
}

/// Additive confidence: reliability base (very-high 50, high 40, medium 30,
/// low 20) plus +15 rate, +10 date, +10 country, +10 product, capped at 100.
pub fn confidence_score(reliability: SourceReliability, signals: &ExtractionSignals) -> u8 {
    let mut score: u32 = match reliability {
        SourceReliability::VeryHigh => 50,
        SourceReliability::High => 40,
        SourceReliability::Medium => 30,
        SourceReliability::Low => 20,
    };
    if signals.has_tariff_rate {
        score += 15;
    }
    if signals.has_effective_date {
        score += 10;
    }
    if signals.has_country {
        score += 10;
    }
    if signals.has_product {
        score += 10;
    }
    score.min(100) as u8
}

/// Mint the alert id: `CA-<epoch-millis>-<suffix>` with millis taken from
/// the article's publish time (capture time when absent) and a three-digit
/// suffix hashed from url+title. Deterministic per article, so re-fetching
/// the same story mints the same id and the cross-run dedup holds.
pub fn mint_alert_id(article: &RawArticle, captured_at: DateTime<Utc>) -> String {
    let millis = article
        .published_at
        .unwrap_or(captured_at)
        .timestamp_millis();
    let mut hasher = Sha256::new();
    hasher.update(article.url.as_bytes());
    hasher.update(article.title.as_bytes());
    let digest = hasher.finalize();
    let suffix = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]) % 1000;
    format!("CA-{millis}-{suffix:03}")
}

fn build_summary(
    restriction: RestrictionType,
    rate: Option<&str>,
    from_countries: &[String],
    product: &str,
) -> String {
    let direction = if from_countries.is_empty() {
        "imports"
    } else {
        "exports"
    };
    match rate {
        Some(rate) => format!("New {restriction} ({rate}) affecting {direction} of {product}"),
        None => format!("New {restriction} affecting {direction} of {product}"),
    }
}

/// Run the whole pipeline over one article. Returns `None` when no product
/// is recognized (checked before anything else) or when the confidence
/// score lands below the threshold.
pub fn synthesize(article: &RawArticle, captured_at: DateTime<Utc>) -> Option<ComplianceAlert> {
    let text = article.full_text();

    let Some(product) = extract_product(&text) else {
        return None;
    };

    let restriction_type = extract_restriction_type(&text);
    let countries = extract_countries(&text);
    let (from_countries, to_countries) = split_directions(&text, &countries);
    let tariff_rate = extract_tariff_rate(&text);
    let effective_date = extract_effective_date(&text);

    let signals = ExtractionSignals {
        has_tariff_rate: tariff_rate.is_some(),
        has_effective_date: effective_date.is_some(),
        has_country: !countries.is_empty(),
        has_product: true,
    };
    let confidence = confidence_score(article.source_reliability, &signals);
    if confidence < CONFIDENCE_THRESHOLD {
        tracing::debug!(
            title = %article.title,
            confidence,
            "candidate below confidence threshold"
        );
        return None;
    }

    let summary = build_summary(restriction_type, tariff_rate.as_deref(), &from_countries, &product);
    Some(ComplianceAlert {
        alert_id: mint_alert_id(article, captured_at),
        summary,
        product,
        restriction_type,
        from_countries,
        to_countries,
        tariff_rate,
        effective_date,
        date_published: article.published_at.unwrap_or(captured_at),
        source: article.source_name.clone(),
        title: article.title.clone(),
        link: article.url.clone(),
        confidence,
        processed_at: None,
    })
}
