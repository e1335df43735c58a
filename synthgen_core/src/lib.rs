//! `synthgen_core` turns YAML recipes into hierarchical, cross-referenced
//! synthetic records.
//!
//! ## Processing Pipeline
//!
//! ```text
//! YAML recipe
//!   -> yaml (events with line markers, anchors and aliases)
//!   -> parser (options, macros, include_file, object templates)
//!   -> options (declared options merged with caller values)
//!   -> template + runtime (rows generated depth-first, expressions evaluated)
//!   -> output (rows written to a sink)
//!   -> mapping (tables ordered by their references)
//! ```
//!
//! ## Recipes
//!
//! ```yaml
//! - option: account_count
//!   default: 2
//! - object: Account
//!   count: <<account_count>>
//!   nickname: primary
//!   fields:
//!     Name:
//!       fake: company
//!     Tier:
//!       random_choice:
//!         Gold: 20%
//!         Silver: 80%
//!   friends:
//!     - object: Contact
//!       fields:
//!         AccountId:
//!           reference: Account
//!         Email: contact<<id>>@example.com
//! ```
//!
//! Strings may embed expressions between `<< >>` and statements between
//! `<% %>`. A string made of a single `<< >>` keeps the expression's own
//! type, so `<<this.count + 1>>` is an integer and `<<Account>>` is a row.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use synthgen_core::GenerateOptions;
//! use synthgen_core::DebugOutputStream;
//! use synthgen_core::generate;
//!
//! let recipe = "- object: Account\n  fields:\n    Name: Acme\n";
//! let mut output = DebugOutputStream::new(std::io::stdout());
//! let summary = generate(recipe.as_bytes(), "<inline>", &GenerateOptions::default(), &mut output)?;
//! assert!(summary.tables.contains_key("Account"));
//! # Ok::<(), synthgen_core::SynthgenError>(())
//! ```

pub use error::*;
pub use fake::*;
pub use generate::*;
pub use mapping::*;
pub use options::*;
pub use output::*;
pub use parser::*;
pub use runtime::*;
pub use template::*;
pub use value::*;

#[allow(unused_assignments)]
mod error;
mod evaluator;
mod fake;
mod functions;
mod generate;
pub mod mapping;
mod options;
pub mod output;
mod parser;
mod runtime;
mod template;
mod value;
mod yaml;

#[cfg(test)]
mod __fixtures;
#[cfg(test)]
mod __tests;
