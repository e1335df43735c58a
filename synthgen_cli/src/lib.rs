use std::path::PathBuf;

use clap::ArgAction;
use clap::Parser;
use clap::ValueEnum;
use synthgen_core::BatchCounter;
use synthgen_core::COMMIT_EVERY;
use synthgen_core::FLUSH_EVERY;
use synthgen_core::FieldValue;
use synthgen_core::GenerateOptions;
use synthgen_core::parse_option_value;

#[derive(Parser, Debug)]
#[command(
	author,
	version,
	about = "Generate hierarchical, cross-referenced synthetic data from a YAML recipe.",
	long_about = "synthgen reads a YAML recipe of objects, fields and options and writes the \
	              rows it describes.\n\nExamples:\n  synthgen recipe.yml\n  synthgen \
	              recipe.yml --count 10 --output-format json --output-file rows.json\n  \
	              synthgen recipe.yml --option account_count 5 --seed 42\n  synthgen \
	              recipe.yml --output-format csv --output-file out/ --mapping-file mapping.yml"
)]
#[allow(clippy::struct_excessive_bools)]
pub struct SynthgenCli {
	/// The recipe to generate from.
	pub recipe: PathBuf,

	/// How many times to run the whole recipe.
	#[arg(long, short = 'n', default_value_t = 1)]
	pub count: u64,

	/// Set a recipe option: `--option name value`. May be repeated.
	#[arg(
		long = "option",
		num_args = 2,
		value_names = ["NAME", "VALUE"],
		action = ArgAction::Append
	)]
	pub options: Vec<String>,

	/// How rows are written.
	#[arg(long, value_enum, default_value_t = OutputFormat::Txt)]
	pub output_format: OutputFormat,

	/// Where rows are written; a directory for `csv`. Defaults to stdout.
	#[arg(long, short)]
	pub output_file: Option<PathBuf>,

	/// Seed the random data so runs are repeatable.
	#[arg(long)]
	pub seed: Option<u64>,

	/// Rows between flushes of json and csv output; `0` flushes only at the end.
	#[arg(long, default_value_t = FLUSH_EVERY)]
	pub flush_every: u64,

	/// Rows between commits of json and csv output; `0` never commits.
	#[arg(long, default_value_t = COMMIT_EVERY)]
	pub commit_every: u64,

	/// Print full error reports and a summary of the generated tables.
	#[arg(long, default_value_t = false)]
	pub debug_internals: bool,

	/// Write a load mapping (tables in dependency order) to this file.
	#[arg(long)]
	pub mapping_file: Option<PathBuf>,

	/// Enable verbose output.
	#[arg(long, short, default_value_t = false)]
	pub verbose: bool,

	/// Disable colored output.
	#[arg(long, default_value_t = false)]
	pub no_color: bool,
}

impl SynthgenCli {
	/// `--option` pairs with their values typed.
	pub fn option_values(&self) -> Vec<(String, FieldValue)> {
		self.options
			.chunks_exact(2)
			.map(|pair| (pair[0].clone(), parse_option_value(&pair[1])))
			.collect()
	}

	pub fn batch_counter(&self) -> BatchCounter {
		BatchCounter::new(self.flush_every, self.commit_every)
	}

	pub fn generate_options(&self) -> GenerateOptions {
		GenerateOptions {
			count: self.count,
			options: self.option_values().into_iter().collect(),
			seed: self.seed,
			..GenerateOptions::default()
		}
	}
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
	/// One line per row.
	#[default]
	Txt,
	/// A JSON array of rows.
	Json,
	/// A directory of CSV files.
	Csv,
	/// A Graphviz graph of rows and references.
	Dot,
}
