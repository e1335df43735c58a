//! Line-marked YAML documents.
//!
//! Recipes are loaded through the `yaml-rust2` event parser so every node
//! remembers the line it started on. Plain scalars are resolved to typed
//! values here; quoted scalars always stay strings.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::NaiveDate;
use chrono::NaiveDateTime;
use yaml_rust2::parser::Event;
use yaml_rust2::parser::MarkedEventReceiver;
use yaml_rust2::parser::Parser;
use yaml_rust2::scanner::Marker;
use yaml_rust2::scanner::TScalarStyle;

use crate::FieldValue;
use crate::SynthgenError;
use crate::SynthgenResult;

#[derive(Debug, Clone)]
pub(crate) struct Node {
	pub(crate) kind: NodeKind,
	pub(crate) filename: Arc<str>,
	line: usize,
	/// Reached through an alias, so `line` points at the anchor, not here.
	shared: bool,
}

#[derive(Debug, Clone)]
pub(crate) enum NodeKind {
	Scalar { text: String, value: FieldValue },
	Sequence(Vec<Node>),
	Mapping(Vec<(Node, Node)>),
}

impl Node {
	/// The line this node started on, unless it was reused through an alias.
	pub(crate) fn line(&self) -> Option<usize> {
		(!self.shared).then_some(self.line)
	}

	pub(crate) fn line_or(&self, fallback: usize) -> usize {
		self.line().unwrap_or(fallback)
	}

	pub(crate) fn as_mapping(&self) -> Option<&[(Node, Node)]> {
		match &self.kind {
			NodeKind::Mapping(entries) => Some(entries),
			_ => None,
		}
	}

	pub(crate) fn as_sequence(&self) -> Option<&[Node]> {
		match &self.kind {
			NodeKind::Sequence(items) => Some(items),
			_ => None,
		}
	}

	pub(crate) fn as_value(&self) -> Option<&FieldValue> {
		match &self.kind {
			NodeKind::Scalar { value, .. } => Some(value),
			_ => None,
		}
	}

	/// Raw text of a scalar, whatever type it resolved to.
	pub(crate) fn text(&self) -> Option<&str> {
		match &self.kind {
			NodeKind::Scalar { text, .. } => Some(text),
			_ => None,
		}
	}

	/// Text of a scalar that resolved to a string.
	pub(crate) fn as_str(&self) -> Option<&str> {
		self.as_value().and_then(FieldValue::as_str)
	}

	pub(crate) fn is_null(&self) -> bool {
		matches!(self.as_value(), Some(FieldValue::Null))
	}

	pub(crate) fn get(&self, key: &str) -> Option<&Node> {
		self.as_mapping()?
			.iter()
			.find(|(candidate, _)| candidate.text() == Some(key))
			.map(|(_, value)| value)
	}

	pub(crate) fn kind_name(&self) -> &'static str {
		match &self.kind {
			NodeKind::Scalar { value, .. } => value.type_name(),
			NodeKind::Sequence(_) => "list",
			NodeKind::Mapping(_) => "mapping",
		}
	}

	fn into_shared(mut self) -> Self {
		self.shared = true;
		match &mut self.kind {
			NodeKind::Scalar { .. } => {}
			NodeKind::Sequence(items) => {
				*items = std::mem::take(items).into_iter().map(Self::into_shared).collect();
			}
			NodeKind::Mapping(entries) => {
				*entries = std::mem::take(entries)
					.into_iter()
					.map(|(key, value)| (key.into_shared(), value.into_shared()))
					.collect();
			}
		}

		self
	}
}

/// Parse the first document of `source`. An empty document yields `None`.
pub(crate) fn load_document(source: &str, filename: &str) -> SynthgenResult<Option<Node>> {
	let mut builder = TreeBuilder {
		filename: Arc::from(filename),
		stack: Vec::new(),
		anchors: HashMap::new(),
		root: None,
	};

	let mut parser = Parser::new_from_str(source);
	parser.load(&mut builder, false).map_err(|error| {
		SynthgenError::syntax(format!("invalid YAML: {}", error.info()))
			.at(filename, error.marker().line())
	})?;

	Ok(builder.root)
}

struct TreeBuilder {
	filename: Arc<str>,
	stack: Vec<Frame>,
	anchors: HashMap<usize, Node>,
	root: Option<Node>,
}

struct Frame {
	line: usize,
	anchor: usize,
	content: FrameContent,
}

enum FrameContent {
	Sequence(Vec<Node>),
	Mapping {
		entries: Vec<(Node, Node)>,
		key: Option<Node>,
	},
}

impl TreeBuilder {
	fn node(&self, kind: NodeKind, line: usize) -> Node {
		Node {
			kind,
			filename: self.filename.clone(),
			line,
			shared: false,
		}
	}

	fn complete(&mut self, node: Node, anchor: usize) {
		if anchor > 0 {
			self.anchors.insert(anchor, node.clone());
		}

		let Some(frame) = self.stack.last_mut() else {
			self.root.get_or_insert(node);
			return;
		};

		match &mut frame.content {
			FrameContent::Sequence(items) => items.push(node),
			FrameContent::Mapping { entries, key } => {
				match key.take() {
					Some(key) => entries.push((key, node)),
					None => *key = Some(node),
				}
			}
		}
	}
}

impl MarkedEventReceiver for TreeBuilder {
	fn on_event(&mut self, event: Event, mark: Marker) {
		match event {
			Event::Scalar(text, style, anchor, ..) => {
				let value = resolve_scalar(&text, matches!(style, TScalarStyle::Plain));
				let node = self.node(NodeKind::Scalar { text, value }, mark.line());
				self.complete(node, anchor);
			}
			Event::SequenceStart(anchor, ..) => {
				self.stack.push(Frame {
					line: mark.line(),
					anchor,
					content: FrameContent::Sequence(Vec::new()),
				});
			}
			Event::MappingStart(anchor, ..) => {
				self.stack.push(Frame {
					line: mark.line(),
					anchor,
					content: FrameContent::Mapping {
						entries: Vec::new(),
						key: None,
					},
				});
			}
			Event::SequenceEnd | Event::MappingEnd => {
				if let Some(frame) = self.stack.pop() {
					let kind = match frame.content {
						FrameContent::Sequence(items) => NodeKind::Sequence(items),
						FrameContent::Mapping { entries, .. } => NodeKind::Mapping(entries),
					};
					let node = self.node(kind, frame.line);
					self.complete(node, frame.anchor);
				}
			}
			Event::Alias(anchor) => {
				if let Some(node) = self.anchors.get(&anchor).cloned() {
					self.complete(node.into_shared(), 0);
				}
			}
			_ => {}
		}
	}
}

fn resolve_scalar(text: &str, plain: bool) -> FieldValue {
	if !plain {
		return FieldValue::String(text.to_owned());
	}

	match text {
		"" | "~" | "null" | "Null" | "NULL" => FieldValue::Null,
		"true" | "True" | "TRUE" => FieldValue::Bool(true),
		"false" | "False" | "FALSE" => FieldValue::Bool(false),
		".inf" | ".Inf" | ".INF" | "+.inf" => FieldValue::Float(f64::INFINITY),
		"-.inf" | "-.Inf" | "-.INF" => FieldValue::Float(f64::NEG_INFINITY),
		".nan" | ".NaN" | ".NAN" => FieldValue::Float(f64::NAN),
		_ => resolve_timestamp(text).unwrap_or_else(|| FieldValue::coerce_numeric(text)),
	}
}

fn resolve_timestamp(text: &str) -> Option<FieldValue> {
	if text.len() == 10 {
		return NaiveDate::parse_from_str(text, "%Y-%m-%d").ok().map(FieldValue::Date);
	}

	if text.len() == 19 {
		return ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"]
			.iter()
			.find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
			.map(FieldValue::DateTime);
	}

	None
}
