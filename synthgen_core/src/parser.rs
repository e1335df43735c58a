use std::fs;
use std::path::Path;
use std::path::PathBuf;

use indexmap::IndexMap;
use tracing::debug;

use crate::ChildRecordValue;
use crate::Count;
use crate::FieldDefinition;
use crate::FieldFactory;
use crate::FieldValue;
use crate::ObjectTemplate;
use crate::OptionDefinition;
use crate::SimpleValue;
use crate::StructuredValue;
use crate::SynthgenError;
use crate::SynthgenResult;
use crate::evaluator::has_expression_syntax;
use crate::yaml::Node;
use crate::yaml::NodeKind;
use crate::yaml::load_document;

const TOP_LEVEL_KEYS: [&str; 4] = ["option", "include_file", "macro", "object"];
const OBJECT_KEYS: [&str; 6] = ["object", "count", "fields", "friends", "nickname", "include"];
const MACRO_KEYS: [&str; 3] = ["macro", "fields", "include"];
const OPTION_KEYS: [&str; 2] = ["option", "default"];

/// A named, reusable set of fields.
#[derive(Debug, Clone)]
pub struct MacroDefinition {
	pub name: String,
	/// The macro's own fields, preceded by those of the macros it includes.
	pub fields: Vec<FieldFactory>,
	pub filename: String,
	pub line: usize,
}

/// Everything declared by a recipe and the files it includes.
#[derive(Debug, Clone)]
pub struct ParsedRecipe {
	pub filename: String,
	pub options: Vec<OptionDefinition>,
	pub macros: IndexMap<String, MacroDefinition>,
	pub templates: Vec<ObjectTemplate>,
}

impl ParsedRecipe {
	/// Every table the recipe can produce, with the union of its written
	/// fields in declaration order.
	pub fn tables(&self) -> IndexMap<String, Vec<String>> {
		let mut tables = IndexMap::new();
		for template in &self.templates {
			collect_tables(template, &mut tables);
		}

		tables
	}
}

fn collect_tables(template: &ObjectTemplate, tables: &mut IndexMap<String, Vec<String>>) {
	let fields: &mut Vec<String> = tables.entry(template.tablename.clone()).or_default();
	for field in &template.fields {
		if !field.is_hidden() && !fields.contains(&field.name) {
			fields.push(field.name.clone());
		}
	}

	for field in &template.fields {
		collect_definition_tables(&field.definition, tables);
	}

	for friend in &template.friends {
		collect_tables(friend, tables);
	}
}

fn collect_definition_tables(definition: &FieldDefinition, tables: &mut IndexMap<String, Vec<String>>) {
	match definition {
		FieldDefinition::Simple(_) => {}
		FieldDefinition::ChildRecord(child) => collect_tables(&child.template, tables),
		FieldDefinition::Structured(call) => {
			for argument in call.args.iter().chain(call.kwargs.values()) {
				collect_definition_tables(argument, tables);
			}
		}
	}
}

/// Parse recipe text. `filename` labels errors and anchors `include_file`
/// paths.
pub fn parse_recipe(source: &str, filename: &str) -> SynthgenResult<ParsedRecipe> {
	let mut parser = RecipeParser::default();
	let base = Path::new(filename).parent().map(Path::to_path_buf).unwrap_or_default();
	let root = load_document(source, filename)?;
	parser.collect(root.as_ref(), filename, &base)?;
	parser.finish(filename)
}

pub fn parse_recipe_file(path: &Path) -> SynthgenResult<ParsedRecipe> {
	let source = fs::read_to_string(path)?;
	let mut parser = RecipeParser::default();
	parser.include_stack.push(path.canonicalize().unwrap_or_else(|_| path.to_path_buf()));
	let filename = path.display().to_string();
	let root = load_document(&source, &filename)?;
	let base = path.parent().map(Path::to_path_buf).unwrap_or_default();
	parser.collect(root.as_ref(), &filename, &base)?;
	parser.finish(&filename)
}

#[derive(Default)]
struct RecipeParser {
	options: Vec<OptionDefinition>,
	raw_macros: IndexMap<String, Node>,
	macros: IndexMap<String, MacroDefinition>,
	resolving: Vec<String>,
	objects: Vec<Node>,
	include_stack: Vec<PathBuf>,
}

impl RecipeParser {
	/// Sort the top-level declarations of one document, recursing into
	/// included files first.
	fn collect(&mut self, root: Option<&Node>, filename: &str, base: &Path) -> SynthgenResult<()> {
		let elements = root.and_then(Node::as_sequence).ok_or_else(|| {
			SynthgenError::syntax("recipe should be a list (use '-' on top-level lines)")
				.at(filename, root.and_then(Node::line).unwrap_or(1))
		})?;

		let mut declarations = Vec::with_capacity(elements.len());
		for element in elements {
			declarations.push((classify(element)?, element));
		}

		for (kind, element) in &declarations {
			if *kind == "include_file" {
				self.include_file(element, base)?;
			}
		}

		for (kind, element) in declarations {
			match kind {
				"option" => self.options.push(parse_option(element)?),
				"macro" => {
					let name = expect_str(element, "macro")?.unwrap_or_default().to_owned();
					self.raw_macros.insert(name, element.clone());
				}
				"object" => self.objects.push(element.clone()),
				_ => {}
			}
		}

		Ok(())
	}

	fn include_file(&mut self, element: &Node, base: &Path) -> SynthgenResult<()> {
		validate_keys(element, "include_file", &["include_file"])?;
		let line = element.line_or(1);
		let relative = expect_str(element, "include_file")?.unwrap_or_default();
		if Path::new(relative).is_absolute() {
			return Err(SynthgenError::syntax(format!(
				"`include_file` paths must be relative, not `{relative}`"
			))
			.at(&element.filename, line));
		}

		let path = base.join(relative);
		let source = fs::read_to_string(&path).map_err(|error| {
			SynthgenError::generic(format!("cannot load include file `{}`: {error}", path.display()))
				.at(&element.filename, line)
		})?;

		let canonical = path.canonicalize().unwrap_or_else(|_| path.clone());
		if self.include_stack.contains(&canonical) {
			return Err(SynthgenError::syntax(format!(
				"`{}` is included recursively",
				path.display()
			))
			.at(&element.filename, line));
		}

		debug!(path = %path.display(), "including recipe file");
		let filename = path.display().to_string();
		let root = load_document(&source, &filename)?;
		let nested_base = path.parent().map(Path::to_path_buf).unwrap_or_default();

		self.include_stack.push(canonical);
		let result = self.collect(root.as_ref(), &filename, &nested_base);
		self.include_stack.pop();

		result
	}

	fn finish(mut self, filename: &str) -> SynthgenResult<ParsedRecipe> {
		let objects = std::mem::take(&mut self.objects);
		let mut templates = Vec::with_capacity(objects.len());
		for object in &objects {
			templates.push(self.parse_object(object, 1)?);
		}

		let names: Vec<String> = self.raw_macros.keys().cloned().collect();
		for name in names {
			self.resolve_macro(&name)?;
		}

		Ok(ParsedRecipe {
			filename: filename.to_owned(),
			options: self.options,
			macros: self.macros,
			templates,
		})
	}

	fn resolve_macro(&mut self, name: &str) -> SynthgenResult<&MacroDefinition> {
		if !self.macros.contains_key(name) {
			let Some(node) = self.raw_macros.get(name).cloned() else {
				return Err(SynthgenError::name(format!("cannot find a macro named `{name}`")));
			};
			if self.resolving.iter().any(|resolving| resolving == name) {
				return Err(SynthgenError::syntax(format!("macro `{name}` includes itself"))
					.at(&node.filename, node.line_or(1)));
			}

			validate_keys(&node, "macro", &MACRO_KEYS)?;
			let line = node.line_or(1);
			self.resolving.push(name.to_owned());
			let fields = self.parse_inclusions(&node, line).and_then(|mut fields| {
				fields.extend(self.parse_fields(node.get("fields"), line)?);
				Ok(fields)
			});
			self.resolving.pop();

			let definition = MacroDefinition {
				name: name.to_owned(),
				fields: fields?,
				filename: node.filename.to_string(),
				line,
			};
			self.macros.insert(name.to_owned(), definition);
		}

		self.macros
			.get(name)
			.ok_or_else(|| SynthgenError::name(format!("cannot find a macro named `{name}`")))
	}

	/// Fields of every macro named in `include: a, b`.
	fn parse_inclusions(&mut self, node: &Node, line: usize) -> SynthgenResult<Vec<FieldFactory>> {
		let Some(include) = expect_str(node, "include")? else {
			return Ok(Vec::new());
		};
		let line = node.get("include").map_or(line, |include| include.line_or(line));

		let mut fields = Vec::new();
		for name in include.split(',').map(str::trim).filter(|name| !name.is_empty()) {
			let definition = self
				.resolve_macro(name)
				.map_err(|error| error.with_location_if_missing(&node.filename, line))?;
			if definition.fields.is_empty() {
				return Err(SynthgenError::name(format!(
					"macro `{name}` does not declare any fields"
				))
				.at(&definition.filename, definition.line));
			}
			fields.extend(definition.fields.iter().cloned());
		}

		Ok(fields)
	}

	fn parse_object(&mut self, node: &Node, parent_line: usize) -> SynthgenResult<ObjectTemplate> {
		let line = node.line_or(parent_line);
		let filename = node.filename.to_string();
		if node.as_mapping().is_none() {
			return Err(SynthgenError::syntax(format!(
				"expected an object declaration, not a {}",
				node.kind_name()
			))
			.at(&filename, line));
		}

		validate_keys(node, "object", &OBJECT_KEYS)?;
		let tablename = expect_str(node, "object")?
			.filter(|name| !name.trim().is_empty())
			.ok_or_else(|| {
				SynthgenError::syntax("`object` needs a table name").at(&filename, line)
			})?
			.to_owned();
		let nickname = expect_str(node, "nickname")?.map(str::to_owned);

		let mut fields = self.parse_inclusions(node, line)?;
		fields.extend(self.parse_fields(node.get("fields"), line)?);

		let mut friends = Vec::new();
		match node.get("friends") {
			None => {}
			Some(friend_nodes) if friend_nodes.is_null() => {}
			Some(friend_nodes) => {
				let items = friend_nodes.as_sequence().ok_or_else(|| {
					SynthgenError::syntax(format!(
						"expected `friends` to be a list, not a {}",
						friend_nodes.kind_name()
					))
					.at(&filename, friend_nodes.line_or(line))
				})?;
				for friend in items {
					friends.push(self.parse_object(friend, friend_nodes.line_or(line))?);
				}
			}
		}

		let count = match node.get("count") {
			Some(count) if !count.is_null() => Some(parse_count(count, &filename, line)?),
			_ => None,
		};

		Ok(ObjectTemplate {
			tablename,
			nickname,
			count,
			fields,
			friends,
			filename,
			line,
		})
	}

	fn parse_fields(&mut self, node: Option<&Node>, parent_line: usize) -> SynthgenResult<Vec<FieldFactory>> {
		let Some(node) = node.filter(|node| !node.is_null()) else {
			return Ok(Vec::new());
		};
		let line = node.line_or(parent_line);
		let entries = node.as_mapping().ok_or_else(|| {
			SynthgenError::syntax("fields should be a mapping (should not start with -)")
				.at(&node.filename, line)
		})?;

		let mut fields = Vec::with_capacity(entries.len());
		for (key, value) in entries {
			let key_line = key.line_or(line);
			let name = key.text().unwrap_or_default().to_owned();
			if value.is_null() {
				return Err(SynthgenError::syntax(format!(
					"field `{name}` should have a definition"
				))
				.at(&key.filename, key_line));
			}

			let definition = self.parse_field_value(&name, value, key_line)?;
			fields.push(FieldFactory {
				name,
				line: value.line_or(key_line),
				filename: value.filename.to_string(),
				definition,
			});
		}

		Ok(fields)
	}

	fn parse_field_value(&mut self, name: &str, node: &Node, parent_line: usize) -> SynthgenResult<FieldDefinition> {
		let line = node.line_or(parent_line);
		let filename = node.filename.to_string();

		match &node.kind {
			NodeKind::Scalar { value, .. } if !value.is_null() => {
				let simple = SimpleValue::new(value.clone(), filename, line);
				simple.compile()?;
				Ok(FieldDefinition::Simple(simple))
			}
			NodeKind::Mapping(_) if node.get("object").is_some_and(|object| !object.is_null()) => {
				Ok(FieldDefinition::ChildRecord(ChildRecordValue {
					template: self.parse_object(node, line)?,
					filename,
					line,
				}))
			}
			NodeKind::Mapping(entries) => self.parse_structured(name, entries, &filename, line),
			NodeKind::Sequence(items) if items.len() == 1 && items[0].as_mapping().is_some() => {
				self.parse_field_value(name, &items[0], line)
			}
			_ => {
				Err(SynthgenError::syntax(format!(
					"unknown field type ({}) for `{name}`; it should be a string or an `object`",
					node.kind_name()
				))
				.at(&filename, line))
			}
		}
	}

	fn parse_structured(
		&mut self,
		name: &str,
		entries: &[(Node, Node)],
		filename: &str,
		line: usize,
	) -> SynthgenResult<FieldDefinition> {
		let [(function, arguments)] = entries else {
			let message = if entries.is_empty() {
				format!("`{name}` is an empty mapping; expected a function call")
			} else {
				let keys: Vec<_> = entries.iter().filter_map(|(key, _)| key.text()).collect();
				format!("extra keys for field `{name}`: {}", keys.join(", "))
			};
			return Err(SynthgenError::syntax(message).at(filename, line));
		};

		let function_name = function.text().unwrap_or_default().to_owned();
		let mut args = Vec::new();
		let mut kwargs = IndexMap::new();
		match &arguments.kind {
			NodeKind::Sequence(items) => {
				for item in items {
					args.push(self.parse_field_value(&function_name, item, line)?);
				}
			}
			NodeKind::Mapping(pairs) => {
				for (key, value) in pairs {
					let key = key.text().unwrap_or_default().to_owned();
					let definition = self.parse_field_value(&key, value, line)?;
					kwargs.insert(key, definition);
				}
			}
			NodeKind::Scalar { value, .. } if value.is_null() => {}
			NodeKind::Scalar { .. } => args.push(self.parse_field_value(&function_name, arguments, line)?),
		}

		Ok(FieldDefinition::Structured(StructuredValue {
			function_name,
			args,
			kwargs,
			filename: filename.to_owned(),
			line,
		}))
	}
}

/// Which kind of top-level declaration `element` is.
fn classify(element: &Node) -> SynthgenResult<&'static str> {
	let line = element.line_or(1);
	if element.as_mapping().is_none() {
		return Err(SynthgenError::syntax(format!(
			"top level elements of a recipe should all be mappings, not a {}",
			element.kind_name()
		))
		.at(&element.filename, line));
	}

	let mut found: Option<&'static str> = None;
	for key in TOP_LEVEL_KEYS {
		let present = element
			.get(key)
			.and_then(Node::as_value)
			.is_none_or(FieldValue::is_truthy);
		if element.get(key).is_some() && present {
			if let Some(previous) = found {
				return Err(SynthgenError::syntax(format!(
					"top level element seems to match two name patterns: `{previous}` and `{key}`"
				))
				.at(&element.filename, line));
			}
			found = Some(key);
		}
	}

	found.ok_or_else(|| {
		SynthgenError::syntax(format!(
			"unknown declaration; expected one of `{}`",
			TOP_LEVEL_KEYS.join("`, `")
		))
		.at(&element.filename, line)
	})
}

fn validate_keys(node: &Node, element: &str, allowed: &[&str]) -> SynthgenResult<()> {
	let line = node.line_or(1);
	for (key, _) in node.as_mapping().unwrap_or_default() {
		let name = key.text().unwrap_or_default();
		if !allowed.contains(&name) {
			return Err(SynthgenError::syntax(format!(
				"unexpected key `{name}` in `{element}` declaration"
			))
			.at(&key.filename, key.line_or(line)));
		}
	}

	Ok(())
}

/// The string value of `key`, `None` when absent or null.
fn expect_str<'n>(node: &'n Node, key: &str) -> SynthgenResult<Option<&'n str>> {
	match node.get(key) {
		None => Ok(None),
		Some(value) if value.is_null() => Ok(None),
		Some(value) => {
			value.as_str().map(Some).ok_or_else(|| {
				SynthgenError::syntax(format!(
					"expected `{key}` to be a string, not a {}",
					value.kind_name()
				))
				.at(&value.filename, value.line_or(node.line_or(1)))
			})
		}
	}
}

fn parse_option(node: &Node) -> SynthgenResult<OptionDefinition> {
	validate_keys(node, "option", &OPTION_KEYS)?;
	let line = node.line_or(1);
	let name = expect_str(node, "option")?.unwrap_or_default().to_owned();
	let default = match node.get("default") {
		None => None,
		Some(value) => {
			Some(value.as_value().cloned().ok_or_else(|| {
				SynthgenError::syntax(format!(
					"the default of option `{name}` should be a scalar, not a {}",
					value.kind_name()
				))
				.at(&value.filename, value.line_or(line))
			})?)
		}
	};

	Ok(OptionDefinition {
		name,
		default,
		filename: node.filename.to_string(),
		line,
	})
}

fn parse_count(node: &Node, filename: &str, object_line: usize) -> SynthgenResult<Count> {
	let line = node.line_or(object_line);
	let invalid = |detail: &str| {
		SynthgenError::value(format!("cannot use {detail} as a row count")).at(filename, line)
	};

	match node.as_value() {
		Some(FieldValue::Int(count)) => {
			u64::try_from(*count)
				.map(Count::Fixed)
				.map_err(|_| invalid(&format!("`{count}`")))
		}
		Some(FieldValue::Float(count)) if count.is_finite() && *count >= 0.0 => {
			Ok(Count::Fixed(count.trunc() as u64))
		}
		Some(FieldValue::Float(count)) => Err(invalid(&format!("`{count}`"))),
		Some(FieldValue::String(text)) if has_expression_syntax(text) || text.contains('=') => {
			let expression = SimpleValue::new(FieldValue::String(text.clone()), filename, line);
			expression.compile()?;
			Ok(Count::Deferred(expression))
		}
		Some(FieldValue::String(text)) => {
			text.trim()
				.parse::<u64>()
				.map(Count::Fixed)
				.map_err(|_| invalid(&format!("`{text}`")))
		}
		_ => {
			Err(SynthgenError::syntax(format!(
				"expected `count` to be a number or an expression, not a {}",
				node.kind_name()
			))
			.at(filename, line))
		}
	}
}
