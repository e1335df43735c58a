use chrono::NaiveDate;

use crate::EncodedRow;
use crate::ExecutionSummary;
use crate::FieldValue;
use crate::GenerateOptions;
use crate::MemoryOutputStream;
use crate::SynthgenResult;
use crate::generate;

pub(crate) const RECIPE_FILENAME: &str = "recipe.yml";

pub(crate) fn test_options() -> GenerateOptions {
	GenerateOptions {
		seed: Some(7),
		today: NaiveDate::from_ymd_opt(2024, 6, 15),
		..GenerateOptions::default()
	}
}

pub(crate) fn run(recipe: &str) -> SynthgenResult<(MemoryOutputStream, ExecutionSummary)> {
	run_with(recipe, &test_options())
}

pub(crate) fn run_with(
	recipe: &str,
	options: &GenerateOptions,
) -> SynthgenResult<(MemoryOutputStream, ExecutionSummary)> {
	let mut output = MemoryOutputStream::new();
	let summary = generate(recipe.as_bytes(), RECIPE_FILENAME, options, &mut output)?;
	Ok((output, summary))
}

/// The value of `name` in `row`, `Null` when the row has no such field.
pub(crate) fn field(row: &EncodedRow, name: &str) -> FieldValue {
	row.get(name).cloned().unwrap_or_default()
}

pub(crate) fn round_trip_recipe() -> &'static str {
	r"
- object: A
  fields:
    B:
      object: B
      fields:
        A_ref:
          reference: A
"
}

pub(crate) fn account_contacts_recipe() -> &'static str {
	r"
- object: Account
  count: 2
  fields:
    Name: Acme
    Size: 10
  friends:
    - object: Contact
      fields:
        AccountId:
          reference: Account
"
}
