use std::fmt;

use miette::Diagnostic;
use thiserror::Error;

/// Where in a recipe an error was raised.
///
/// Every part is optional: errors raised deep inside the evaluator start
/// without a location and pick one up from the nearest enclosing node as they
/// propagate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorLocation {
	pub filename: Option<String>,
	pub line: Option<usize>,
	/// The field that was being rendered.
	pub field: Option<String>,
}

impl ErrorLocation {
	pub fn new(filename: impl Into<String>, line: usize) -> Self {
		Self {
			filename: Some(filename.into()),
			line: Some(line),
			field: None,
		}
	}

	fn fill(&mut self, filename: &str, line: usize) {
		if self.line.is_none() {
			self.line = Some(line);
			if self.filename.is_none() {
				self.filename = Some(filename.to_owned());
			}
		}
	}
}

impl fmt::Display for ErrorLocation {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if let Some(field) = &self.field {
			write!(f, " (field `{field}`)")?;
		}

		match (&self.filename, self.line) {
			(Some(filename), Some(line)) => write!(f, "\n near {filename}:{line}"),
			(None, Some(line)) => write!(f, "\n near <recipe>:{line}"),
			(Some(filename), None) => write!(f, "\n in {filename}"),
			(None, None) => Ok(()),
		}
	}
}

#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum SynthgenError {
	#[error("{message}{location}")]
	#[diagnostic(
		code(synthgen::syntax),
		help("recipes are a YAML list of `object`, `macro`, `option` and `include_file` entries")
	)]
	Syntax {
		message: String,
		location: ErrorLocation,
	},

	#[error("{message}{location}")]
	#[diagnostic(code(synthgen::name))]
	Name {
		message: String,
		location: ErrorLocation,
	},

	#[error("{message}{location}")]
	#[diagnostic(code(synthgen::value))]
	Value {
		message: String,
		location: ErrorLocation,
	},

	#[error("{message}{location}")]
	#[diagnostic(code(synthgen::generic))]
	Generic {
		message: String,
		location: ErrorLocation,
		#[source]
		source: Option<Box<dyn std::error::Error + Send + Sync>>,
	},

	#[error("no encoder for type `{kind}` in the {sink} output")]
	#[diagnostic(
		code(synthgen::no_encoder),
		help("convert the value with `int`, `date` or a string expression before writing it")
	)]
	NoEncoder {
		kind: &'static str,
		sink: &'static str,
	},

	#[error(transparent)]
	#[diagnostic(code(synthgen::io_error))]
	Io(#[from] std::io::Error),

	#[error(transparent)]
	#[diagnostic(code(synthgen::csv))]
	Csv(#[from] csv::Error),

	#[error(transparent)]
	#[diagnostic(code(synthgen::json))]
	Json(#[from] serde_json::Error),

	#[error(transparent)]
	#[diagnostic(code(synthgen::yaml))]
	Yaml(#[from] serde_yaml_ng::Error),
}

impl SynthgenError {
	pub fn syntax(message: impl Into<String>) -> Self {
		Self::Syntax {
			message: message.into(),
			location: ErrorLocation::default(),
		}
	}

	pub fn name(message: impl Into<String>) -> Self {
		Self::Name {
			message: message.into(),
			location: ErrorLocation::default(),
		}
	}

	pub fn value(message: impl Into<String>) -> Self {
		Self::Value {
			message: message.into(),
			location: ErrorLocation::default(),
		}
	}

	pub fn generic(message: impl Into<String>) -> Self {
		Self::Generic {
			message: message.into(),
			location: ErrorLocation::default(),
			source: None,
		}
	}

	/// Pin the error to `filename:line`, replacing any earlier location.
	#[must_use]
	pub fn at(mut self, filename: &str, line: usize) -> Self {
		if let Some(location) = self.location_mut() {
			location.filename = Some(filename.to_owned());
			location.line = Some(line);
		}

		self
	}

	/// Attach `filename:line` unless an inner frame already recorded a line.
	///
	/// Errors that carry no location of their own (I/O, encoding) are wrapped
	/// into [`SynthgenError::Generic`] so the location is not lost.
	#[must_use]
	pub fn with_location_if_missing(self, filename: &str, line: usize) -> Self {
		let mut error = self.into_located();
		if let Some(location) = error.location_mut() {
			location.fill(filename, line);
		}

		error
	}

	/// Record the field being rendered unless a nested field already did.
	#[must_use]
	pub fn in_field(self, field: &str) -> Self {
		let mut error = self.into_located();
		if let Some(location) = error.location_mut() {
			location.field.get_or_insert_with(|| field.to_owned());
		}

		error
	}

	pub fn location(&self) -> Option<&ErrorLocation> {
		match self {
			Self::Syntax { location, .. }
			| Self::Name { location, .. }
			| Self::Value { location, .. }
			| Self::Generic { location, .. } => Some(location),
			_ => None,
		}
	}

	/// The message without any location suffix.
	pub fn message(&self) -> String {
		match self {
			Self::Syntax { message, .. }
			| Self::Name { message, .. }
			| Self::Value { message, .. }
			| Self::Generic { message, .. } => message.clone(),
			other => other.to_string(),
		}
	}

	fn location_mut(&mut self) -> Option<&mut ErrorLocation> {
		match self {
			Self::Syntax { location, .. }
			| Self::Name { location, .. }
			| Self::Value { location, .. }
			| Self::Generic { location, .. } => Some(location),
			_ => None,
		}
	}

	fn into_located(self) -> Self {
		if self.location().is_some() {
			return self;
		}

		Self::Generic {
			message: self.to_string(),
			location: ErrorLocation::default(),
			source: Some(Box::new(self)),
		}
	}
}

pub type SynthgenResult<T> = Result<T, SynthgenError>;
pub type AnyError = Box<dyn std::error::Error>;
pub type AnyEmptyResult = Result<(), AnyError>;
pub type AnyResult<T> = Result<T, AnyError>;
