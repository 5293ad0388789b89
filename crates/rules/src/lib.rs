//! # Tilescope Rules
//!
//! Ordered classification rules over tile metrics.
//!
//! A [`RuleSet`] is validated once into a [`CompiledRuleSet`]; every
//! condition key, operator and literal is checked against the closed field
//! set before any tile is classified. Classification walks the rules in
//! order and stops at the first match, falling back to
//! [`Classification::Default`].
//!
//! Named rule sets live behind the [`RuleSetStore`] interface. Operations on
//! one name are serialized; different names proceed independently.
//!
//! ```no_run
//! use tilescope_rules::{FileRuleSetStore, RuleSetStore, SavePolicy};
//!
//! # async fn demo(rule_set: tilescope_rules::RuleSet) -> tilescope_rules::Result<()> {
//! let store = FileRuleSetStore::new("saved_rules");
//! store.put("night-shift", &rule_set, SavePolicy::Reject).await?;
//! let compiled = store.load_compiled("night-shift").await?;
//! assert_eq!(compiled.len(), rule_set.rules.len());
//! # Ok(())
//! # }
//! ```

mod error;
mod evaluator;
mod lock;
mod model;
mod store;

pub use error::{Result, RuleError};
pub use evaluator::{classify, Classification, CompiledRuleSet, LogicalOp};
pub use model::{Rule, RuleGroup, RuleSet};
pub use store::{
    validate_rule_set_name, FileRuleSetStore, MemoryRuleSetStore, RuleSetStore, SavePolicy,
    DEFAULT_STORE_TIMEOUT,
};
