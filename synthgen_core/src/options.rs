use std::collections::BTreeSet;

use indexmap::IndexMap;
use tracing::warn;

use crate::FieldValue;
use crate::SynthgenError;
use crate::SynthgenResult;

/// A recipe's `- option: name` declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct OptionDefinition {
	pub name: String,
	pub default: Option<FieldValue>,
	pub filename: String,
	pub line: usize,
}

/// Declared options resolved against caller-supplied values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergedOptions {
	pub values: IndexMap<String, FieldValue>,
	/// Supplied names that no declaration asked for.
	pub extra: BTreeSet<String>,
}

/// Combine declarations with caller values. Caller values win; undeclared
/// caller values are kept and reported in [`MergedOptions::extra`].
///
/// Merging the result again with the same declarations gives the same
/// values.
pub fn merge_options(
	declarations: &[OptionDefinition],
	supplied: &IndexMap<String, FieldValue>,
) -> SynthgenResult<MergedOptions> {
	let mut values = IndexMap::with_capacity(declarations.len().max(supplied.len()));

	for declaration in declarations {
		let value = supplied
			.get(&declaration.name)
			.or(declaration.default.as_ref())
			.ok_or_else(|| {
				SynthgenError::name(format!(
					"no value supplied for option `{}`",
					declaration.name
				))
				.at(&declaration.filename, declaration.line)
			})?;
		values.insert(declaration.name.clone(), value.clone());
	}

	let mut extra = BTreeSet::new();
	for (name, value) in supplied {
		if !declarations.iter().any(|declaration| &declaration.name == name) {
			warn!(option = %name, "option is not declared by the recipe");
			extra.insert(name.clone());
			values.insert(name.clone(), value.clone());
		}
	}

	Ok(MergedOptions { values, extra })
}

/// Interpret a command-line option value: integers, then floats, then
/// `true`/`false`, else the text itself.
pub fn parse_option_value(text: &str) -> FieldValue {
	match FieldValue::coerce_numeric(text) {
		FieldValue::String(text) => {
			match text.to_ascii_lowercase().as_str() {
				"true" => FieldValue::Bool(true),
				"false" => FieldValue::Bool(false),
				_ => FieldValue::String(text),
			}
		}
		value => value,
	}
}
