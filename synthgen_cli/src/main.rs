use std::fs::File;
use std::io;
use std::io::BufWriter;
use std::io::Write;
use std::process;

use clap::Parser;
use owo_colors::OwoColorize;
use synthgen_cli::OutputFormat;
use synthgen_cli::SynthgenCli;
use synthgen_core::CsvOutputStream;
use synthgen_core::DebugOutputStream;
use synthgen_core::DotOutputStream;
use synthgen_core::ExecutionSummary;
use synthgen_core::JsonOutputStream;
use synthgen_core::OutputStream;
use synthgen_core::SynthgenError;
use synthgen_core::SynthgenResult;
use synthgen_core::generate_file;
use synthgen_core::mapping_from_summary;
use synthgen_core::mapping_to_yaml;
use tracing_subscriber::EnvFilter;

fn main() {
	let args = SynthgenCli::parse();

	// Respect NO_COLOR env var and --no-color flag.
	let use_color = !args.no_color
		&& std::env::var_os("NO_COLOR").is_none()
		&& supports_color::on(supports_color::Stream::Stderr).is_some();

	miette::set_hook(Box::new(move |_| {
		Box::new(
			miette::MietteHandlerOpts::new()
				.color(use_color)
				.unicode(use_color)
				.build(),
		)
	}))
	.ok();

	init_tracing(args.verbose, use_color);

	if let Err(error) = run(&args) {
		if args.debug_internals {
			let report: miette::Report = error.into();
			eprintln!("{report:?}");
		} else if use_color {
			eprintln!("{} {error}", "error:".red());
		} else {
			eprintln!("error: {error}");
		}
		process::exit(1);
	}
}

fn init_tracing(verbose: bool, use_color: bool) {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
		EnvFilter::new(if verbose {
			"synthgen_core=debug"
		} else {
			"warn"
		})
	});

	tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_writer(io::stderr)
		.with_ansi(use_color)
		.with_target(false)
		.init();
}

fn run(args: &SynthgenCli) -> SynthgenResult<()> {
	let options = args.generate_options();
	let mut output = open_output(args)?;

	tracing::debug!(recipe = %args.recipe.display(), count = args.count, "generating");
	let summary = generate_file(&args.recipe, &options, output.as_mut())?;
	output.close()?;

	if let Some(path) = &args.mapping_file {
		let mapping = mapping_from_summary(&summary);
		std::fs::write(path, mapping_to_yaml(&mapping)?)?;
	}

	if args.debug_internals {
		print_summary(&summary)?;
	}

	Ok(())
}

fn open_output(args: &SynthgenCli) -> SynthgenResult<Box<dyn OutputStream>> {
	if args.output_format == OutputFormat::Csv {
		let Some(directory) = &args.output_file else {
			return Err(SynthgenError::generic(
				"csv output needs `--output-file` naming a directory",
			));
		};

		return Ok(Box::new(
			CsvOutputStream::new(directory).with_batch_counter(args.batch_counter()),
		));
	}

	let writer: Box<dyn Write> = match &args.output_file {
		Some(path) => Box::new(BufWriter::new(File::create(path)?)),
		None => Box::new(io::stdout().lock()),
	};

	let output: Box<dyn OutputStream> = match args.output_format {
		OutputFormat::Json => {
			Box::new(JsonOutputStream::new(writer).with_batch_counter(args.batch_counter()))
		}
		OutputFormat::Dot => Box::new(DotOutputStream::new(writer)),
		OutputFormat::Txt | OutputFormat::Csv => Box::new(DebugOutputStream::new(writer)),
	};

	Ok(output)
}

fn print_summary(summary: &ExecutionSummary) -> SynthgenResult<()> {
	let yaml = serde_yaml_ng::to_string(&summary.summarize_for_debugging())?;
	eprintln!("{yaml}");

	Ok(())
}
