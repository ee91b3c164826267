//! Gene dependency resolution.
//!
//! Turns a declarative catlet configuration into the deduplicated list of
//! content-addressed genes that must be prepared on an agent before the
//! catlet can be created. Pure computation, no I/O.

mod collector;
mod identifier;
mod validation;

pub use collector::collect_gene_dependencies;
pub use identifier::{
    GeneError, GeneIdentifier, GeneIdentifierWithType, GeneSetIdentifier, GeneType,
    CATLET_GENE_NAME, DEFAULT_TAG, GENE_PREFIX,
};
pub use validation::Validation;
