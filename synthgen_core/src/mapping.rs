use std::collections::BTreeSet;

use indexmap::IndexMap;
use serde::Serialize;
use tracing::warn;

use crate::Dependency;
use crate::ExecutionSummary;
use crate::SynthgenResult;

/// Order `tables` so that every table follows the tables it references.
///
/// References from a table to itself do not constrain the order. When only
/// tables caught in a reference cycle remain, the alphabetically first of
/// them is emitted and sorting carries on.
pub fn sort_tables_by_dependencies<'t>(
	tables: impl IntoIterator<Item = &'t str>,
	dependencies: &BTreeSet<Dependency>,
) -> Vec<String> {
	let mut remaining: Vec<&str> = Vec::new();
	for table in tables {
		if !remaining.contains(&table) {
			remaining.push(table);
		}
	}

	let mut sorted: Vec<String> = Vec::with_capacity(remaining.len());
	while !remaining.is_empty() {
		let is_free = |table: &str| {
			dependencies.iter().all(|dependency| {
				dependency.table_name_from != table
					|| dependency.table_name_to == table
					|| !remaining.contains(&dependency.table_name_to.as_str())
			})
		};
		let free: Vec<&str> = remaining.iter().copied().filter(|table| is_free(table)).collect();

		if free.is_empty() {
			let mut cycle = remaining.clone();
			cycle.sort_unstable();
			let broken = cycle[0];
			warn!(tables = ?cycle, table = broken, "reference cycle between tables; loading `{broken}` first");
			remaining.retain(|table| *table != broken);
			sorted.push(broken.to_owned());
			continue;
		}

		remaining.retain(|table| !free.contains(table));
		sorted.extend(free.into_iter().map(str::to_owned));
	}

	sorted
}

/// A lookup from a reference field to the table it points at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Lookup {
	pub table: String,
	pub key_field: String,
}

/// One step of a load mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MappingStep {
	pub sf_object: String,
	pub table: String,
	pub fields: IndexMap<String, String>,
	#[serde(skip_serializing_if = "IndexMap::is_empty")]
	pub lookups: IndexMap<String, Lookup>,
}

/// Build an `Insert <Table>` step per table, in dependency order.
pub fn mapping_from_summary(summary: &ExecutionSummary) -> IndexMap<String, MappingStep> {
	let order = sort_tables_by_dependencies(
		summary.tables.keys().map(String::as_str),
		&summary.dependencies,
	);

	let mut mapping = IndexMap::with_capacity(order.len());
	for table in order {
		let mut fields = IndexMap::new();
		let mut lookups = IndexMap::new();
		for field in summary.tables.get(&table).into_iter().flatten() {
			let target = summary.dependencies.iter().find(|dependency| {
				dependency.table_name_from == table && &dependency.field_name == field
			});

			match target {
				Some(dependency) => {
					lookups.insert(field.clone(), Lookup {
						table: dependency.table_name_to.clone(),
						key_field: field.clone(),
					});
				}
				None => {
					fields.insert(field.clone(), field.clone());
				}
			}
		}

		mapping.insert(format!("Insert {table}"), MappingStep {
			sf_object: table.clone(),
			table,
			fields,
			lookups,
		});
	}

	mapping
}

/// The load mapping as a YAML document.
pub fn mapping_to_yaml(mapping: &IndexMap<String, MappingStep>) -> SynthgenResult<String> {
	Ok(serde_yaml_ng::to_string(mapping)?)
}
