//! Gene and geneset identifiers.
//!
//! Text formats:
//! - geneset: `<org>/<set>[/<tag>]`
//! - gene: `gene:<org>/<set>[/<tag>]:<name>`
//!
//! Identifiers are lower-cased and a missing tag becomes `latest`, so two
//! spellings of the same gene compare equal. Parsing never panics: it
//! returns a `Validation` holding exactly one error per malformed input.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::validation::Validation;

/// Prefix marking a drive or fodder source as a gene reference.
pub const GENE_PREFIX: &str = "gene:";
/// Tag assumed when a geneset reference omits one.
pub const DEFAULT_TAG: &str = "latest";
/// Gene name implied by a parent (catlet) reference.
pub const CATLET_GENE_NAME: &str = "catlet";

const MAX_SEGMENT_LENGTH: usize = 50;

/// A gene source that failed to parse.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid gene identifier '{value}': {reason}")]
pub struct GeneError {
    /// The source string as written in the configuration.
    pub value: String,
    pub reason: String,
}

impl GeneError {
    fn new(value: &str, reason: impl Into<String>) -> Self {
        Self {
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

/// `<org>/<set>/<tag>` after normalization.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GeneSetIdentifier {
    organization: String,
    geneset: String,
    tag: String,
}

impl GeneSetIdentifier {
    /// Parse `<org>/<set>[/<tag>]`.
    pub fn parse(value: &str) -> Validation<Self, GeneError> {
        Self::parse_normalized(&normalize(value)).map_err_with(value)
    }

    fn parse_normalized(value: &str) -> Result<Self, String> {
        let parts: Vec<&str> = value.split('/').collect();
        let (organization, geneset, tag) = match parts.as_slice() {
            [org, set] => (*org, *set, DEFAULT_TAG),
            [org, set, tag] => (*org, *set, *tag),
            _ => return Err("expected <org>/<set>[/<tag>]".to_string()),
        };

        let reasons: Vec<String> = [
            check_segment("organization", organization),
            check_segment("geneset", geneset),
            check_segment("tag", tag),
        ]
        .into_iter()
        .flatten()
        .collect();
        if !reasons.is_empty() {
            return Err(reasons.join("; "));
        }

        Ok(Self {
            organization: organization.to_string(),
            geneset: geneset.to_string(),
            tag: tag.to_string(),
        })
    }

    pub fn organization(&self) -> &str {
        &self.organization
    }

    pub fn geneset(&self) -> &str {
        &self.geneset
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }
}

impl fmt::Display for GeneSetIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.organization, self.geneset, self.tag)
    }
}

/// `gene:<org>/<set>/<tag>:<name>` after normalization.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GeneIdentifier {
    geneset: GeneSetIdentifier,
    name: String,
}

impl GeneIdentifier {
    /// Parse `gene:<org>/<set>[/<tag>]:<name>`.
    pub fn parse(value: &str) -> Validation<Self, GeneError> {
        Self::parse_normalized(&normalize(value)).map_err_with(value)
    }

    fn parse_normalized(value: &str) -> Result<Self, String> {
        let rest = value
            .strip_prefix(GENE_PREFIX)
            .ok_or_else(|| format!("missing '{GENE_PREFIX}' prefix"))?;
        let (geneset, name) = rest
            .split_once(':')
            .ok_or_else(|| "expected gene:<org>/<set>[/<tag>]:<name>".to_string())?;
        let geneset = GeneSetIdentifier::parse_normalized(geneset)?;
        if let Some(reason) = check_segment("gene name", name) {
            return Err(reason);
        }
        Ok(Self {
            geneset,
            name: name.to_string(),
        })
    }

    /// The implicit catlet gene of a parent geneset.
    pub fn catlet(geneset: GeneSetIdentifier) -> Self {
        Self {
            geneset,
            name: CATLET_GENE_NAME.to_string(),
        }
    }

    pub fn geneset(&self) -> &GeneSetIdentifier {
        &self.geneset
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for GeneIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{GENE_PREFIX}{}:{}", self.geneset, self.name)
    }
}

/// What a gene provides to a catlet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeneType {
    Catlet,
    Volume,
    Fodder,
}

impl fmt::Display for GeneType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GeneType::Catlet => "catlet",
            GeneType::Volume => "volume",
            GeneType::Fodder => "fodder",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GeneIdentifierWithType {
    pub gene_type: GeneType,
    pub identifier: GeneIdentifier,
}

impl GeneIdentifierWithType {
    pub fn new(gene_type: GeneType, identifier: GeneIdentifier) -> Self {
        Self {
            gene_type,
            identifier,
        }
    }
}

impl fmt::Display for GeneIdentifierWithType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.identifier, self.gene_type)
    }
}

fn normalize(value: &str) -> String {
    value.trim().to_ascii_lowercase()
}

/// Returns the reason a segment is malformed, if it is.
fn check_segment(kind: &str, segment: &str) -> Option<String> {
    if segment.is_empty() {
        return Some(format!("{kind} is empty"));
    }
    if segment.len() > MAX_SEGMENT_LENGTH {
        return Some(format!(
            "{kind} exceeds {MAX_SEGMENT_LENGTH} characters"
        ));
    }
    if !segment
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
    {
        return Some(format!(
            "{kind} '{segment}' contains invalid characters (allowed: a-z, 0-9, '-', '.')"
        ));
    }
    let starts_ok = segment.chars().next().is_some_and(|c| c.is_ascii_alphanumeric());
    let ends_ok = segment.chars().last().is_some_and(|c| c.is_ascii_alphanumeric());
    if !starts_ok || !ends_ok {
        return Some(format!(
            "{kind} '{segment}' must start and end with a letter or digit"
        ));
    }
    None
}

trait IntoGeneValidation<T> {
    fn map_err_with(self, value: &str) -> Validation<T, GeneError>;
}

impl<T> IntoGeneValidation<T> for Result<T, String> {
    fn map_err_with(self, value: &str) -> Validation<T, GeneError> {
        self.map_err(|reason| GeneError::new(value, reason)).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_geneset_with_tag() {
        let set = GeneSetIdentifier::parse("acme/acme-parent/1.0")
            .into_result()
            .unwrap();
        assert_eq!(set.organization(), "acme");
        assert_eq!(set.geneset(), "acme-parent");
        assert_eq!(set.tag(), "1.0");
        assert_eq!(set.to_string(), "acme/acme-parent/1.0");
    }

    #[test]
    fn test_parse_geneset_defaults_tag() {
        let implicit = GeneSetIdentifier::parse("acme/os").into_result().unwrap();
        let explicit = GeneSetIdentifier::parse("acme/os/latest")
            .into_result()
            .unwrap();
        assert_eq!(implicit, explicit);
    }

    #[test]
    fn test_parse_normalizes_case() {
        let upper = GeneIdentifier::parse("gene:ACME/OS/1.0:SDA")
            .into_result()
            .unwrap();
        assert_eq!(upper.to_string(), "gene:acme/os/1.0:sda");
    }

    #[test]
    fn test_parse_gene() {
        let gene = GeneIdentifier::parse("gene:acme/acme-fodder/1.0:first-fodder")
            .into_result()
            .unwrap();
        assert_eq!(gene.geneset().geneset(), "acme-fodder");
        assert_eq!(gene.name(), "first-fodder");
    }

    #[test]
    fn test_missing_name_is_single_error_naming_source() {
        let result = GeneIdentifier::parse("gene:invalid");
        let errors = result.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].value, "gene:invalid");
        assert!(errors[0].to_string().contains("gene:invalid"));
    }

    #[test]
    fn test_several_bad_segments_still_one_error() {
        let result = GeneIdentifier::parse("gene:-bad/Bad_set/:x");
        assert_eq!(result.errors().len(), 1);
    }

    #[test]
    fn test_rejects_missing_prefix_and_bad_shapes() {
        assert!(!GeneIdentifier::parse("acme/os:sda").is_success());
        assert!(!GeneSetIdentifier::parse("acme").is_success());
        assert!(!GeneSetIdentifier::parse("acme/os/1.0/extra").is_success());
        assert!(!GeneSetIdentifier::parse("acme//1.0").is_success());
        assert!(!GeneSetIdentifier::parse("").is_success());
    }

    #[test]
    fn test_rejects_overlong_segment() {
        let long = "a".repeat(MAX_SEGMENT_LENGTH + 1);
        assert!(!GeneSetIdentifier::parse(&format!("acme/{long}")).is_success());
    }

    #[test]
    fn test_catlet_gene_uses_implicit_name() {
        let set = GeneSetIdentifier::parse("acme/base").into_result().unwrap();
        let gene = GeneIdentifier::catlet(set);
        assert_eq!(gene.to_string(), "gene:acme/base/latest:catlet");
    }
}
