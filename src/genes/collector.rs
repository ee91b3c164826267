//! Gene dependency collection for a catlet configuration.

use std::collections::HashSet;

use super::identifier::{
    GeneError, GeneIdentifier, GeneIdentifierWithType, GeneSetIdentifier, GeneType, GENE_PREFIX,
};
use super::validation::Validation;
use crate::catlets::CatletConfig;

/// Collect every gene a catlet configuration depends on.
///
/// - a non-empty parent becomes the parent geneset's `catlet` gene
/// - drive sources starting with `gene:` become volume genes; other drive
///   sources are plain disk paths and are skipped
/// - every non-empty fodder source becomes a fodder gene
///
/// Malformed sources are reported together, one error each. On success the
/// result is deduplicated and keeps first-seen order.
pub fn collect_gene_dependencies(
    config: &CatletConfig,
) -> Validation<Vec<GeneIdentifierWithType>, GeneError> {
    let parent: Validation<Vec<GeneIdentifierWithType>, GeneError> = config
        .parent
        .as_deref()
        .filter(|parent| !parent.trim().is_empty())
        .map(|parent| {
            GeneSetIdentifier::parse(parent).map(|geneset| {
                vec![GeneIdentifierWithType::new(
                    GeneType::Catlet,
                    GeneIdentifier::catlet(geneset),
                )]
            })
        })
        .unwrap_or_else(|| Validation::success(Vec::new()));

    let volumes: Validation<Vec<GeneIdentifierWithType>, GeneError> = config
        .drives
        .iter()
        .filter_map(|drive| drive.source.as_deref())
        .filter(|source| source.starts_with(GENE_PREFIX))
        .map(|source| {
            GeneIdentifier::parse(source)
                .map(|id| GeneIdentifierWithType::new(GeneType::Volume, id))
        })
        .collect();

    let fodder: Validation<Vec<GeneIdentifierWithType>, GeneError> = config
        .fodder
        .iter()
        .filter_map(|fodder| fodder.source.as_deref())
        .filter(|source| !source.trim().is_empty())
        .map(|source| {
            GeneIdentifier::parse(source)
                .map(|id| GeneIdentifierWithType::new(GeneType::Fodder, id))
        })
        .collect();

    parent
        .zip(volumes)
        .zip(fodder)
        .map(|((parent, volumes), fodder)| {
            let mut seen = HashSet::new();
            parent
                .into_iter()
                .chain(volumes)
                .chain(fodder)
                .filter(|gene| seen.insert(gene.clone()))
                .collect()
        })
}
