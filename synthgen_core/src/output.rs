//! Destinations for generated rows.
//!
//! Every sink implements [`OutputStream::write_single_row`]; the provided
//! [`OutputStream::write_row`] prepares rows for it by dropping hidden
//! fields, flattening references to ids and encoding each value through the
//! sink's encoder table.

use std::fmt;
use std::fs;
use std::fs::File;
use std::io::BufWriter;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use indexmap::IndexMap;
use serde::Serialize;

use crate::FieldValue;
use crate::ObjectRow;
use crate::SynthgenError;
use crate::SynthgenResult;
use crate::template::is_hidden_field;

/// Default rows between calls to [`OutputStream::flush`].
pub const FLUSH_EVERY: u64 = 1_000;
/// Default rows between calls to [`OutputStream::commit`].
pub const COMMIT_EVERY: u64 = 10_000;

/// A row ready for a sink: `id` first, then the written fields.
pub type EncodedRow = IndexMap<String, FieldValue>;

/// Converts a value of one [`ValueKind`] into what a sink stores.
pub type Encoder = fn(FieldValue) -> FieldValue;

/// The kinds of values an encoder table is keyed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
	Null,
	Bool,
	Int,
	Float,
	String,
	Date,
	DateTime,
}

impl ValueKind {
	/// References have no kind of their own; they are flattened to ids first.
	pub fn of(value: &FieldValue) -> Self {
		match value {
			FieldValue::Null => Self::Null,
			FieldValue::Bool(_) => Self::Bool,
			FieldValue::Int(_) | FieldValue::Reference(_) => Self::Int,
			FieldValue::Float(_) => Self::Float,
			FieldValue::String(_) => Self::String,
			FieldValue::Date(_) => Self::Date,
			FieldValue::DateTime(_) => Self::DateTime,
		}
	}

	pub fn name(self) -> &'static str {
		match self {
			Self::Null => "null",
			Self::Bool => "bool",
			Self::Int => "int",
			Self::Float => "float",
			Self::String => "string",
			Self::Date => "date",
			Self::DateTime => "datetime",
		}
	}
}

fn identity(value: FieldValue) -> FieldValue {
	value
}

fn as_text(value: FieldValue) -> FieldValue {
	FieldValue::String(value.to_string())
}

fn bool_as_int(value: FieldValue) -> FieldValue {
	match value {
		FieldValue::Bool(flag) => FieldValue::Int(i64::from(flag)),
		other => other,
	}
}

/// Every kind passes through unchanged.
pub const DEFAULT_ENCODERS: &[(ValueKind, Encoder)] = &[
	(ValueKind::Null, identity),
	(ValueKind::Bool, identity),
	(ValueKind::Int, identity),
	(ValueKind::Float, identity),
	(ValueKind::String, identity),
	(ValueKind::Date, identity),
	(ValueKind::DateTime, identity),
];

/// Flat-file encoders: booleans become `1`/`0` and dates become text.
pub const TEXT_ENCODERS: &[(ValueKind, Encoder)] = &[
	(ValueKind::Null, identity),
	(ValueKind::Bool, bool_as_int),
	(ValueKind::Int, identity),
	(ValueKind::Float, identity),
	(ValueKind::String, identity),
	(ValueKind::Date, as_text),
	(ValueKind::DateTime, as_text),
];

/// Replace a row reference with the referenced row's id.
pub fn flatten_reference(value: FieldValue) -> FieldValue {
	match value {
		FieldValue::Reference(row) => FieldValue::Int(row.id() as i64),
		other => other,
	}
}

/// Counts rows so that sinks are flushed and committed periodically.
///
/// A threshold of `0` turns that call off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchCounter {
	rows: u64,
	flush_every: u64,
	commit_every: u64,
}

impl Default for BatchCounter {
	fn default() -> Self {
		Self::new(FLUSH_EVERY, COMMIT_EVERY)
	}
}

impl BatchCounter {
	pub fn new(flush_every: u64, commit_every: u64) -> Self {
		Self {
			rows: 0,
			flush_every,
			commit_every,
		}
	}

	/// Record one row; returns whether to flush and whether to commit.
	pub fn record(&mut self) -> (bool, bool) {
		self.rows += 1;
		let reached = |every: u64| every != 0 && self.rows % every == 0;
		(reached(self.flush_every), reached(self.commit_every))
	}

	pub fn flush_every(&self) -> u64 {
		self.flush_every
	}

	pub fn commit_every(&self) -> u64 {
		self.commit_every
	}

	pub fn rows(&self) -> u64 {
		self.rows
	}
}

/// A destination for generated rows.
pub trait OutputStream {
	/// Short name used in error messages.
	fn name(&self) -> &'static str;

	/// The value kinds this sink can store. A kind missing from the table
	/// is rejected with [`SynthgenError::NoEncoder`].
	fn encoders(&self) -> &'static [(ValueKind, Encoder)] {
		DEFAULT_ENCODERS
	}

	/// Called once, before any row, with every table and its fields.
	fn create_or_validate_tables(&mut self, _tables: &IndexMap<String, Vec<String>>) -> SynthgenResult<()> {
		Ok(())
	}

	/// Sinks that want periodic [`flush`](Self::flush) and
	/// [`commit`](Self::commit) calls return their counter here.
	fn batch_counter(&mut self) -> Option<&mut BatchCounter> {
		None
	}

	fn encode(&self, value: FieldValue) -> SynthgenResult<FieldValue> {
		let value = flatten_reference(value);
		let kind = ValueKind::of(&value);
		let encoder = self
			.encoders()
			.iter()
			.find_map(|(candidate, encoder)| (*candidate == kind).then_some(*encoder))
			.ok_or(SynthgenError::NoEncoder {
				kind: kind.name(),
				sink: self.name(),
			})?;

		Ok(encoder(value))
	}

	fn write_row(&mut self, table: &str, row: &ObjectRow) -> SynthgenResult<()> {
		let mut encoded = EncodedRow::new();
		encoded.insert("id".to_owned(), self.encode(FieldValue::Int(row.id() as i64))?);
		for (name, value) in row.fields() {
			if !is_hidden_field(&name) {
				let value = self.encode(value)?;
				encoded.insert(name, value);
			}
		}

		self.write_single_row(table, encoded)?;

		let (flush, commit) = self.batch_counter().map_or((false, false), BatchCounter::record);
		if flush {
			self.flush()?;
		}
		if commit {
			self.commit()?;
		}

		Ok(())
	}

	fn write_single_row(&mut self, table: &str, row: EncodedRow) -> SynthgenResult<()>;

	fn flush(&mut self) -> SynthgenResult<()> {
		Ok(())
	}

	fn commit(&mut self) -> SynthgenResult<()> {
		Ok(())
	}

	/// Finish the output. Sinks only close what they opened themselves.
	fn close(&mut self) -> SynthgenResult<()> {
		Ok(())
	}
}

/// A borrowed sink, so callers keep ownership of what they pass in.
impl<T: OutputStream + ?Sized> OutputStream for &mut T {
	fn name(&self) -> &'static str {
		(**self).name()
	}

	fn encoders(&self) -> &'static [(ValueKind, Encoder)] {
		(**self).encoders()
	}

	fn create_or_validate_tables(&mut self, tables: &IndexMap<String, Vec<String>>) -> SynthgenResult<()> {
		(**self).create_or_validate_tables(tables)
	}

	fn batch_counter(&mut self) -> Option<&mut BatchCounter> {
		(**self).batch_counter()
	}

	fn encode(&self, value: FieldValue) -> SynthgenResult<FieldValue> {
		(**self).encode(value)
	}

	fn write_row(&mut self, table: &str, row: &ObjectRow) -> SynthgenResult<()> {
		(**self).write_row(table, row)
	}

	fn write_single_row(&mut self, table: &str, row: EncodedRow) -> SynthgenResult<()> {
		(**self).write_single_row(table, row)
	}

	fn flush(&mut self) -> SynthgenResult<()> {
		(**self).flush()
	}

	fn commit(&mut self) -> SynthgenResult<()> {
		(**self).commit()
	}

	fn close(&mut self) -> SynthgenResult<()> {
		(**self).close()
	}
}

/// Human-readable lines: `Account(id=1, Name=Acme)`.
#[derive(Debug)]
pub struct DebugOutputStream<W: Write> {
	writer: W,
}

impl<W: Write> DebugOutputStream<W> {
	pub fn new(writer: W) -> Self {
		Self { writer }
	}

	pub fn into_inner(self) -> W {
		self.writer
	}
}

impl<W: Write> OutputStream for DebugOutputStream<W> {
	fn name(&self) -> &'static str {
		"debug"
	}

	fn write_single_row(&mut self, table: &str, row: EncodedRow) -> SynthgenResult<()> {
		let fields: Vec<String> = row.iter().map(|(name, value)| format!("{name}={value}")).collect();
		writeln!(self.writer, "{table}({})", fields.join(", "))?;

		Ok(())
	}

	fn close(&mut self) -> SynthgenResult<()> {
		self.writer.flush()?;
		Ok(())
	}
}

/// A single JSON array; each row carries its table in `_table`.
#[derive(Debug)]
pub struct JsonOutputStream<W: Write> {
	writer: W,
	rows: u64,
	batch: BatchCounter,
}

impl<W: Write> JsonOutputStream<W> {
	pub fn new(writer: W) -> Self {
		Self {
			writer,
			rows: 0,
			batch: BatchCounter::default(),
		}
	}

	/// Flush and commit on other thresholds than the defaults.
	#[must_use]
	pub fn with_batch_counter(mut self, batch: BatchCounter) -> Self {
		self.batch = batch;
		self
	}

	pub fn into_inner(self) -> W {
		self.writer
	}
}

impl<W: Write> OutputStream for JsonOutputStream<W> {
	fn name(&self) -> &'static str {
		"json"
	}

	fn batch_counter(&mut self) -> Option<&mut BatchCounter> {
		Some(&mut self.batch)
	}

	fn write_single_row(&mut self, table: &str, row: EncodedRow) -> SynthgenResult<()> {
		let separator = if self.rows == 0 { "[\n" } else { ",\n" };
		self.writer.write_all(separator.as_bytes())?;

		let mut object = EncodedRow::with_capacity(row.len() + 1);
		object.insert("_table".to_owned(), FieldValue::String(table.to_owned()));
		object.extend(row);
		serde_json::to_writer(&mut self.writer, &object)?;
		self.rows += 1;

		Ok(())
	}

	fn flush(&mut self) -> SynthgenResult<()> {
		self.writer.flush()?;
		Ok(())
	}

	fn close(&mut self) -> SynthgenResult<()> {
		let closing = if self.rows == 0 { "[]\n" } else { "\n]\n" };
		self.writer.write_all(closing.as_bytes())?;
		self.writer.flush()?;

		Ok(())
	}
}

#[derive(Debug, Serialize)]
struct CsvwMetadata {
	#[serde(rename = "@context")]
	context: &'static str,
	tables: Vec<CsvwTable>,
}

#[derive(Debug, Serialize)]
struct CsvwTable {
	url: String,
	#[serde(rename = "tableSchema")]
	table_schema: CsvwSchema,
}

#[derive(Debug, Serialize)]
struct CsvwSchema {
	columns: Vec<CsvwColumn>,
}

#[derive(Debug, Serialize)]
struct CsvwColumn {
	name: String,
	titles: String,
}

#[derive(Debug)]
struct CsvTable {
	columns: Vec<String>,
	writer: csv::Writer<BufWriter<File>>,
}

/// One `<table>.csv` per table in a directory, described by a
/// `csvw_metadata.json` file.
#[derive(Debug)]
pub struct CsvOutputStream {
	directory: PathBuf,
	tables: IndexMap<String, CsvTable>,
	batch: BatchCounter,
}

impl CsvOutputStream {
	pub fn new(directory: impl Into<PathBuf>) -> Self {
		Self {
			directory: directory.into(),
			tables: IndexMap::new(),
			batch: BatchCounter::default(),
		}
	}

	#[must_use]
	pub fn with_batch_counter(mut self, batch: BatchCounter) -> Self {
		self.batch = batch;
		self
	}

	pub fn directory(&self) -> &Path {
		&self.directory
	}

	fn metadata(&self) -> CsvwMetadata {
		CsvwMetadata {
			context: "http://www.w3.org/ns/csvw",
			tables: self
				.tables
				.iter()
				.map(|(name, table)| {
					CsvwTable {
						url: format!("{name}.csv"),
						table_schema: CsvwSchema {
							columns: table
								.columns
								.iter()
								.map(|column| {
									CsvwColumn {
										name: column.clone(),
										titles: column.clone(),
									}
								})
								.collect(),
						},
					}
				})
				.collect(),
		}
	}
}

impl OutputStream for CsvOutputStream {
	fn name(&self) -> &'static str {
		"csv"
	}

	fn encoders(&self) -> &'static [(ValueKind, Encoder)] {
		TEXT_ENCODERS
	}

	fn batch_counter(&mut self) -> Option<&mut BatchCounter> {
		Some(&mut self.batch)
	}

	fn create_or_validate_tables(&mut self, tables: &IndexMap<String, Vec<String>>) -> SynthgenResult<()> {
		fs::create_dir_all(&self.directory)?;

		for (name, fields) in tables {
			let mut columns = vec!["id".to_owned()];
			columns.extend(fields.iter().filter(|field| *field != "id").cloned());

			let file = File::create(self.directory.join(format!("{name}.csv")))?;
			let mut writer = csv::Writer::from_writer(BufWriter::new(file));
			writer.write_record(&columns)?;
			self.tables.insert(name.clone(), CsvTable { columns, writer });
		}

		Ok(())
	}

	fn write_single_row(&mut self, table: &str, mut row: EncodedRow) -> SynthgenResult<()> {
		let target = self.tables.get_mut(table).ok_or_else(|| {
			SynthgenError::generic(format!("table `{table}` was not declared to the csv output"))
		})?;

		let record: Vec<String> = target
			.columns
			.iter()
			.map(|column| {
				match row.swap_remove(column) {
					None | Some(FieldValue::Null) => String::new(),
					Some(value) => value.to_string(),
				}
			})
			.collect();
		target.writer.write_record(&record)?;

		Ok(())
	}

	fn flush(&mut self) -> SynthgenResult<()> {
		for table in self.tables.values_mut() {
			table.writer.flush()?;
		}

		Ok(())
	}

	fn close(&mut self) -> SynthgenResult<()> {
		self.flush()?;

		let file = File::create(self.directory.join("csvw_metadata.json"))?;
		serde_json::to_writer_pretty(BufWriter::new(file), &self.metadata())?;

		Ok(())
	}
}

/// A Graphviz digraph: one node per row, one edge per reference.
#[derive(Debug)]
pub struct DotOutputStream<W: Write> {
	writer: W,
	started: bool,
}

impl<W: Write> DotOutputStream<W> {
	pub fn new(writer: W) -> Self {
		Self {
			writer,
			started: false,
		}
	}

	pub fn into_inner(self) -> W {
		self.writer
	}

	fn start(&mut self) -> SynthgenResult<()> {
		if !self.started {
			writeln!(self.writer, "digraph synthgen {{")?;
			writeln!(self.writer, "  node [shape=box];")?;
			self.started = true;
		}

		Ok(())
	}
}

/// Escape text for a quoted DOT id or label.
fn escape_dot(text: &str) -> String {
	text.replace('\\', "\\\\").replace('"', "\\\"")
}

fn node_name(table: &str, id: impl fmt::Display) -> String {
	format!("\"{} {id}\"", escape_dot(table))
}

impl<W: Write> OutputStream for DotOutputStream<W> {
	fn name(&self) -> &'static str {
		"dot"
	}

	fn encoders(&self) -> &'static [(ValueKind, Encoder)] {
		TEXT_ENCODERS
	}

	fn write_row(&mut self, table: &str, row: &ObjectRow) -> SynthgenResult<()> {
		self.start()?;

		let source = node_name(table, row.id());
		for (field, value) in row.fields() {
			if let FieldValue::Reference(target) = value {
				if !is_hidden_field(&field) {
					writeln!(
						self.writer,
						"  {source} -> {} [label=\"{}\"];",
						node_name(target.table(), target.id()),
						escape_dot(&field)
					)?;
				}
			}
		}

		let mut encoded = EncodedRow::new();
		encoded.insert("id".to_owned(), FieldValue::Int(row.id() as i64));
		for (name, value) in row.fields() {
			if !is_hidden_field(&name) {
				let value = self.encode(value)?;
				encoded.insert(name, value);
			}
		}

		self.write_single_row(table, encoded)
	}

	fn write_single_row(&mut self, table: &str, row: EncodedRow) -> SynthgenResult<()> {
		self.start()?;

		let id = row.get("id").map(ToString::to_string).unwrap_or_default();
		let mut label = escape_dot(&format!("{table}({id})"));
		for (name, value) in row.iter().filter(|(name, _)| *name != "id") {
			label.push_str(&format!("\\n{}: {}", escape_dot(name), escape_dot(&value.to_string())));
		}
		writeln!(self.writer, "  {} [label=\"{label}\"];", node_name(table, id))?;

		Ok(())
	}

	fn close(&mut self) -> SynthgenResult<()> {
		self.start()?;
		writeln!(self.writer, "}}")?;
		self.writer.flush()?;

		Ok(())
	}
}

/// Keeps every row in memory.
#[derive(Debug, Default)]
pub struct MemoryOutputStream {
	pub tables: IndexMap<String, Vec<String>>,
	pub rows: Vec<(String, EncodedRow)>,
	pub flushes: u64,
	pub commits: u64,
	pub closed: bool,
	batch: BatchCounter,
}

impl MemoryOutputStream {
	pub fn new() -> Self {
		Self::default()
	}

	#[must_use]
	pub fn with_batch_counter(mut self, batch: BatchCounter) -> Self {
		self.batch = batch;
		self
	}

	/// The rows written to `table`, in order.
	pub fn table(&self, table: &str) -> Vec<&EncodedRow> {
		self.rows
			.iter()
			.filter(|(name, _)| name == table)
			.map(|(_, row)| row)
			.collect()
	}
}

impl OutputStream for MemoryOutputStream {
	fn name(&self) -> &'static str {
		"memory"
	}

	fn batch_counter(&mut self) -> Option<&mut BatchCounter> {
		Some(&mut self.batch)
	}

	fn create_or_validate_tables(&mut self, tables: &IndexMap<String, Vec<String>>) -> SynthgenResult<()> {
		self.tables.clone_from(tables);
		Ok(())
	}

	fn write_single_row(&mut self, table: &str, row: EncodedRow) -> SynthgenResult<()> {
		self.rows.push((table.to_owned(), row));
		Ok(())
	}

	fn flush(&mut self) -> SynthgenResult<()> {
		self.flushes += 1;
		Ok(())
	}

	fn commit(&mut self) -> SynthgenResult<()> {
		self.commits += 1;
		Ok(())
	}

	fn close(&mut self) -> SynthgenResult<()> {
		self.closed = true;
		Ok(())
	}
}

/// Sends every call to several sinks in turn.
#[derive(Default)]
pub struct MultiplexOutputStream<'o> {
	outputs: Vec<Box<dyn OutputStream + 'o>>,
}

impl<'o> MultiplexOutputStream<'o> {
	pub fn new(outputs: Vec<Box<dyn OutputStream + 'o>>) -> Self {
		Self { outputs }
	}

	pub fn push(&mut self, output: impl OutputStream + 'o) {
		self.outputs.push(Box::new(output));
	}

	pub fn len(&self) -> usize {
		self.outputs.len()
	}

	pub fn is_empty(&self) -> bool {
		self.outputs.is_empty()
	}
}

impl OutputStream for MultiplexOutputStream<'_> {
	fn name(&self) -> &'static str {
		"multiplex"
	}

	fn create_or_validate_tables(&mut self, tables: &IndexMap<String, Vec<String>>) -> SynthgenResult<()> {
		self.outputs
			.iter_mut()
			.try_for_each(|output| output.create_or_validate_tables(tables))
	}

	fn write_row(&mut self, table: &str, row: &ObjectRow) -> SynthgenResult<()> {
		self.outputs
			.iter_mut()
			.try_for_each(|output| output.write_row(table, row))
	}

	fn write_single_row(&mut self, table: &str, row: EncodedRow) -> SynthgenResult<()> {
		self.outputs
			.iter_mut()
			.try_for_each(|output| output.write_single_row(table, row.clone()))
	}

	fn flush(&mut self) -> SynthgenResult<()> {
		self.outputs.iter_mut().try_for_each(|output| output.flush())
	}

	fn commit(&mut self) -> SynthgenResult<()> {
		self.outputs.iter_mut().try_for_each(|output| output.commit())
	}

	fn close(&mut self) -> SynthgenResult<()> {
		self.outputs.iter_mut().try_for_each(|output| output.close())
	}
}
