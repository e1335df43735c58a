use std::collections::BTreeSet;
use std::fs;
use std::sync::Arc;

use chrono::NaiveDate;
use indexmap::IndexMap;
use rstest::rstest;
use similar_asserts::assert_eq;
use tracing_test::traced_test;

use super::__fixtures::*;
use super::*;

fn run_error(recipe: &str) -> SynthgenError {
	match run(recipe) {
		Ok(_) => panic!("expected the recipe to fail"),
		Err(error) => error,
	}
}

fn ids(output: &MemoryOutputStream, table: &str) -> Vec<FieldValue> {
	output
		.table(table)
		.into_iter()
		.map(|row| field(row, "id"))
		.collect()
}

fn ints(values: impl IntoIterator<Item = i64>) -> Vec<FieldValue> {
	values.into_iter().map(FieldValue::Int).collect()
}

#[test]
fn round_trip_between_parent_and_nested_child() -> SynthgenResult<()> {
	let (output, summary) = run(round_trip_recipe())?;

	assert_eq!(output.rows.len(), 2);
	let a = output.table("A");
	let b = output.table("B");
	assert_eq!(field(a[0], "id"), FieldValue::Int(1));
	assert_eq!(field(b[0], "id"), FieldValue::Int(1));
	assert_eq!(field(a[0], "B"), FieldValue::Int(1));
	assert_eq!(field(b[0], "A_ref"), FieldValue::Int(1));

	let expected: BTreeSet<_> = [Dependency::new("A", "B", "B"), Dependency::new("B", "A", "A_ref")]
		.into_iter()
		.collect();
	assert_eq!(summary.dependencies, expected);

	Ok(())
}

#[test]
fn nested_child_is_written_before_its_parent() -> SynthgenResult<()> {
	let (output, _) = run(round_trip_recipe())?;
	let tables: Vec<_> = output.rows.iter().map(|(table, _)| table.as_str()).collect();
	assert_eq!(tables, vec!["B", "A"]);

	Ok(())
}

#[rstest]
#[case::count("\n- object: A\n  count: <<nope>>\n", 3)]
#[case::field("- object: A\n  fields:\n    ok: 1\n    broken: <<missing_value>>\n", 4)]
#[case::nested_field(
	"- object: A\n  fields:\n    child:\n      object: B\n      fields:\n        x: <<nope>>\n",
	6
)]
fn name_errors_end_with_their_line(#[case] recipe: &str, #[case] line: usize) {
	let error = run_error(recipe);
	assert!(matches!(error, SynthgenError::Name { .. }), "{error:?}");
	assert!(
		error.to_string().ends_with(&format!(":{line}")),
		"`{error}` should end with `:{line}`"
	);
}

#[test]
fn field_errors_name_the_field() {
	let error = run_error("- object: A\n  fields:\n    broken: <<nope>>\n");
	let location = error.location().cloned().unwrap_or_default();
	assert_eq!(location.field.as_deref(), Some("broken"));
	assert_eq!(location.filename.as_deref(), Some(RECIPE_FILENAME));
	assert_eq!(location.line, Some(3));
}

#[test]
fn ids_are_gapless_per_table() -> SynthgenResult<()> {
	let recipe = r"
- object: Account
  count: 3
  friends:
    - object: Contact
      count: 2
- object: Contact
";
	let (output, _) = run(recipe)?;

	assert_eq!(ids(&output, "Account"), ints(1..=3));
	assert_eq!(ids(&output, "Contact"), ints(1..=7));

	Ok(())
}

#[test]
fn ids_continue_across_batches() -> SynthgenResult<()> {
	let options = GenerateOptions {
		count: 3,
		..test_options()
	};
	let (output, _) = run_with("- object: Account\n  count: 2\n", &options)?;
	assert_eq!(ids(&output, "Account"), ints(1..=6));

	Ok(())
}

#[test]
fn number_is_scoped_but_counter_is_run_wide() -> SynthgenResult<()> {
	let recipe = r"
- object: Parent
  count: 2
  friends:
    - object: Child
      count: 3
      fields:
        position: <<number>>
        total: <<counter('Child')>>
        structured_total:
          counter: Child
";
	let (output, _) = run(recipe)?;
	let children = output.table("Child");
	let positions: Vec<_> = children.iter().map(|row| field(row, "position")).collect();
	let totals: Vec<_> = children.iter().map(|row| field(row, "total")).collect();
	let structured: Vec<_> = children.iter().map(|row| field(row, "structured_total")).collect();

	assert_eq!(positions, ints([1, 2, 3, 1, 2, 3]));
	assert_eq!(totals, ints(1..=6));
	assert_eq!(structured, ints(1..=6));

	Ok(())
}

#[test]
fn if_renders_only_the_chosen_branch() -> SynthgenResult<()> {
	let recipe = r"
- object: Parent
  count: 3
  fields:
    child:
      if:
        - choice:
            when: <<number == 2>>
            pick:
              object: Chosen
        - choice:
            pick: nothing
";
	let (output, summary) = run(recipe)?;
	let children: Vec<_> = output.table("Parent").iter().map(|row| field(row, "child")).collect();

	assert_eq!(output.table("Chosen").len(), 1);
	assert_eq!(children, vec!["nothing".into(), FieldValue::Int(1), "nothing".into()]);
	assert!(summary.tables.contains_key("Chosen"));

	Ok(())
}

#[test]
fn if_without_a_match_is_null() -> SynthgenResult<()> {
	let recipe = r"
- object: Row
  fields:
    value:
      if:
        - choice:
            when: <<false>>
            pick: never
";
	let (output, _) = run(recipe)?;
	assert_eq!(field(output.table("Row")[0], "value"), FieldValue::Null);

	Ok(())
}

#[test]
fn if_rejects_a_default_branch_before_the_end() {
	let recipe = r"
- object: Row
  fields:
    value:
      if:
        - choice:
            pick: first
        - choice:
            when: <<true>>
            pick: second
";
	let error = run_error(recipe);
	assert!(matches!(error, SynthgenError::Value { .. }), "{error:?}");
}

#[test]
fn random_choice_only_generates_the_picked_child() -> SynthgenResult<()> {
	let recipe = r"
- object: Holder
  count: 50
  fields:
    pet:
      random_choice:
        - object: Cat
        - object: Dog
";
	let (output, _) = run(recipe)?;
	assert_eq!(output.table("Cat").len() + output.table("Dog").len(), 50);

	Ok(())
}

#[rstest]
#[case::weight_map(
	r"
- object: Draw
  count: 2000
  fields:
    color:
      random_choice:
        red: 50%
        green: 30%
        blue: 20%
"
)]
#[case::choices(
	r"
- object: Draw
  count: 2000
  fields:
    color:
      random_choice:
        - choice:
            probability: 50
            pick: red
        - choice:
            probability: 30
            pick: green
        - choice:
            probability: 20
            pick: blue
"
)]
fn weighted_choices_follow_their_weights(#[case] recipe: &str) -> SynthgenResult<()> {
	let (output, _) = run(recipe)?;
	let rows = output.table("Draw");
	let share = |color: &str| {
		let hits = rows
			.iter()
			.filter(|row| field(row, "color") == FieldValue::from(color))
			.count();
		hits as f64 / rows.len() as f64
	};

	for (color, expected) in [("red", 0.5), ("green", 0.3), ("blue", 0.2)] {
		let actual = share(color);
		assert!((actual - expected).abs() < 0.05, "{color}: {actual} vs {expected}");
	}

	Ok(())
}

#[test]
fn seeded_runs_are_repeatable() -> SynthgenResult<()> {
	let recipe = r"
- object: Roll
  count: 20
  fields:
    die:
      random_number:
        min: 1
        max: 6
    name:
      fake: first_name
";
	let (first, _) = run(recipe)?;
	let (second, _) = run(recipe)?;
	assert_eq!(first.rows, second.rows);

	for row in first.table("Roll") {
		let FieldValue::Int(die) = field(row, "die") else {
			panic!("expected an integer roll");
		};
		assert!((1..=6).contains(&die));
	}

	Ok(())
}

#[test]
fn references_resolve_through_children_friends_and_ancestors() -> SynthgenResult<()> {
	let recipe = r"
- object: Account
  nickname: main
  fields:
    Name: Acme
    primary:
      object: Contact
      fields:
        AccountId:
          reference: Account
        note:
          object: Note
          fields:
            account: <<ancestor('Account')>>
            account_name: <<Account.Name>>
            structured:
              ancestor: Account
  friends:
    - object: Opportunity
      fields:
        AccountId:
          reference: main
        AccountName:
          main.Name:
";
	let (output, _) = run(recipe)?;
	let account = output.table("Account")[0];
	let contact = output.table("Contact")[0];
	let note = output.table("Note")[0];
	let opportunity = output.table("Opportunity")[0];

	assert_eq!(field(account, "primary"), FieldValue::Int(1));
	assert_eq!(field(contact, "AccountId"), FieldValue::Int(1));
	assert_eq!(field(contact, "note"), FieldValue::Int(1));
	assert_eq!(field(note, "account"), FieldValue::Int(1));
	assert_eq!(field(note, "structured"), FieldValue::Int(1));
	assert_eq!(field(note, "account_name"), FieldValue::from("Acme"));
	assert_eq!(field(opportunity, "AccountId"), FieldValue::Int(1));
	assert_eq!(field(opportunity, "AccountName"), FieldValue::from("Acme"));

	Ok(())
}

#[test]
fn missing_ancestor_is_a_name_error() {
	let error = run_error("- object: Orphan\n  fields:\n    parent: <<ancestor('Account')>>\n");
	assert!(matches!(error, SynthgenError::Name { .. }), "{error:?}");
}

#[rstest]
#[case::inline("- object: A\n  fields:\n    x: 1\n    y: <<this.nope>>\n")]
#[case::dotted("- object: A\n  fields:\n    x: 1\n    y:\n      this.nope:\n")]
fn missing_row_fields_are_name_errors(#[case] recipe: &str) {
	let error = run_error(recipe);
	assert!(matches!(error, SynthgenError::Name { .. }), "{error:?}");
	assert!(error.message().contains("nope"), "{error}");
	assert!(error.message().contains("(A)"), "{error}");
}

#[test]
fn latest_row_of_a_table_wins_over_a_clashing_nickname() -> SynthgenResult<()> {
	let recipe = r"
- object: Account
  fields:
    Name: first
- object: Contact
  nickname: Account
  fields:
    Name: contact
- object: Report
  fields:
    Inline: <<Account.Name>>
    Dotted:
      Account.Name:
    Referenced:
      reference: Account
";
	let (output, summary) = run(recipe)?;
	let report = output.table("Report")[0];

	assert_eq!(field(report, "Inline"), FieldValue::from("first"));
	assert_eq!(field(report, "Dotted"), FieldValue::from("first"));
	// `reference` resolves nicknames first.
	assert!(
		summary
			.dependencies
			.contains(&Dependency::new("Report", "Contact", "Referenced")),
		"{:?}",
		summary.dependencies
	);

	Ok(())
}

#[test]
fn this_reads_earlier_fields() -> SynthgenResult<()> {
	let recipe = r"
- object: Box
  fields:
    width: 3
    height: 4
    area: <<this.width * height>>
    label: box <<id>> is <<area>>
";
	let (output, _) = run(recipe)?;
	let row = output.table("Box")[0];
	assert_eq!(field(row, "area"), FieldValue::Int(12));
	assert_eq!(field(row, "label"), FieldValue::from("box 1 is 12"));

	Ok(())
}

#[rstest]
#[case::int("42", FieldValue::Int(42))]
#[case::negative("-3", FieldValue::Int(-3))]
#[case::leading_zero("007", FieldValue::Int(7))]
#[case::float("2.5", FieldValue::Float(2.5))]
#[case::exponent("1e3", FieldValue::Float(1000.0))]
#[case::word("abc", FieldValue::from("abc"))]
#[case::empty("", FieldValue::from(""))]
#[case::range("1-2", FieldValue::from("1-2"))]
#[case::infinity("inf", FieldValue::from("inf"))]
#[case::padded(" 3 ", FieldValue::Int(3))]
#[case::padded_float("\t2.5\n", FieldValue::Float(2.5))]
#[case::padded_word(" word ", FieldValue::from(" word "))]
fn coerce_numeric_prefers_integers(#[case] text: &str, #[case] expected: FieldValue) {
	assert_eq!(FieldValue::coerce_numeric(text), expected);
}

#[test]
fn rendered_strings_are_coerced() -> SynthgenResult<()> {
	let recipe = r#"
- object: Numbers
  fields:
    quoted: "42"
    expression: <<"3.5">>
    template: <<1>><<2>>
    text: <<1>>-<<2>>
    flag: <<1 > 0>>
"#;
	let (output, _) = run(recipe)?;
	let row = output.table("Numbers")[0];
	assert_eq!(field(row, "quoted"), FieldValue::Int(42));
	assert_eq!(field(row, "expression"), FieldValue::Float(3.5));
	assert_eq!(field(row, "template"), FieldValue::Int(12));
	assert_eq!(field(row, "text"), FieldValue::from("1-2"));
	assert_eq!(field(row, "flag"), FieldValue::Bool(true));

	Ok(())
}

#[test]
fn hidden_fields_are_visible_but_not_written() -> SynthgenResult<()> {
	let recipe = r"
- object: Secret
  fields:
    __seed: 5
    shown: <<__seed + 1>>
";
	let (output, summary) = run(recipe)?;
	let row = output.table("Secret")[0];

	assert_eq!(row.keys().collect::<Vec<_>>(), vec!["id", "shown"]);
	assert_eq!(field(row, "shown"), FieldValue::Int(6));
	assert_eq!(summary.tables["Secret"], vec!["shown".to_owned()]);

	Ok(())
}

#[test]
fn table_summary_unions_fields_in_order() -> SynthgenResult<()> {
	let recipe = r"
- object: foo
  fields:
    a: 1
    c: 3
- object: foo
  fields:
    b: 2
    d: 4
";
	let (_, summary) = run(recipe)?;
	assert_eq!(summary.tables["foo"], vec!["a", "c", "b", "d"]);

	Ok(())
}

#[test]
fn options_fill_expressions_and_counts() -> SynthgenResult<()> {
	let recipe = r"
- option: size
  default: 3
- option: label
- object: Box
  count: <<size>>
  fields:
    label: <<label>>
";
	let mut options = test_options();
	options.options.insert("label".to_owned(), FieldValue::from("big"));
	let (output, summary) = run_with(recipe, &options)?;
	assert_eq!(output.table("Box").len(), 3);
	assert_eq!(field(output.table("Box")[0], "label"), FieldValue::from("big"));
	assert!(summary.extra_options.is_empty());

	options.options.insert("size".to_owned(), FieldValue::Int(5));
	let (output, _) = run_with(recipe, &options)?;
	assert_eq!(output.table("Box").len(), 5);

	Ok(())
}

#[test]
#[traced_test]
fn merge_options_is_idempotent_and_reports_extras() {
	let declarations = vec![
		OptionDefinition {
			name: "a".to_owned(),
			default: Some(FieldValue::Int(1)),
			filename: RECIPE_FILENAME.to_owned(),
			line: 1,
		},
		OptionDefinition {
			name: "b".to_owned(),
			default: None,
			filename: RECIPE_FILENAME.to_owned(),
			line: 3,
		},
	];
	let supplied: IndexMap<String, FieldValue> = [
		("b".to_owned(), FieldValue::Int(2)),
		("extra".to_owned(), FieldValue::from("x")),
	]
	.into_iter()
	.collect();

	let merged = merge_options(&declarations, &supplied)
		.unwrap_or_else(|error| panic!("merge failed: {error}"));
	assert_eq!(merged.values["a"], FieldValue::Int(1));
	assert_eq!(merged.values["b"], FieldValue::Int(2));
	assert_eq!(merged.values["extra"], FieldValue::from("x"));
	assert_eq!(merged.extra, BTreeSet::from(["extra".to_owned()]));
	assert!(logs_contain("option is not declared"));

	let again = merge_options(&declarations, &merged.values)
		.unwrap_or_else(|error| panic!("merge failed: {error}"));
	assert_eq!(again, merged);
}

#[test]
fn missing_option_value_is_a_name_error() {
	let declarations = vec![OptionDefinition {
		name: "required".to_owned(),
		default: None,
		filename: RECIPE_FILENAME.to_owned(),
		line: 4,
	}];
	let Err(error) = merge_options(&declarations, &IndexMap::new()) else {
		panic!("expected a missing option error");
	};
	assert!(matches!(error, SynthgenError::Name { .. }), "{error:?}");
	assert!(error.to_string().ends_with(":4"), "{error}");
}

#[rstest]
#[case::integer("12", FieldValue::Int(12))]
#[case::float("1.5", FieldValue::Float(1.5))]
#[case::boolean("True", FieldValue::Bool(true))]
#[case::text("hello", FieldValue::from("hello"))]
fn option_values_are_inferred(#[case] text: &str, #[case] expected: FieldValue) {
	assert_eq!(parse_option_value(text), expected);
}

#[test]
fn macros_splice_fields_and_include_each_other() -> SynthgenResult<()> {
	let recipe = r"
- macro: named
  fields:
    first: Jane
- macro: person
  include: named
  fields:
    last: Doe
- object: Person
  include: person
  fields:
    age: 30
";
	let (output, _) = run(recipe)?;
	let row = output.table("Person")[0];
	assert_eq!(row.keys().collect::<Vec<_>>(), vec!["id", "first", "last", "age"]);
	assert_eq!(field(row, "first"), FieldValue::from("Jane"));

	Ok(())
}

#[rstest]
#[case::unknown("- object: A\n  include: nowhere\n")]
#[case::empty("- macro: empty\n- object: A\n  include: empty\n")]
fn bad_macro_inclusions_are_name_errors(#[case] recipe: &str) {
	let error = run_error(recipe);
	assert!(matches!(error, SynthgenError::Name { .. }), "{error:?}");
}

#[rstest]
#[case::not_a_list("object: A\n", 1)]
#[case::unexpected_key("- object: A\n  feilds:\n    x: 1\n", 2)]
#[case::null_field("- object: A\n  fields:\n    x:\n", 3)]
#[case::extra_keys("- object: A\n  fields:\n    x:\n      a: 1\n      b: 2\n", 4)]
#[case::two_patterns("- object: A\n  macro: B\n", 1)]
#[case::unknown_declaration("- nothing: 1\n", 1)]
#[case::friends_not_a_list("- object: A\n  friends: nope\n", 2)]
#[case::fields_not_a_mapping("- object: A\n  fields:\n    - x: 1\n", 3)]
#[case::bad_expression("- object: A\n  fields:\n    x: <<1 +>>\n", 3)]
#[case::long_sequence("- object: A\n  fields:\n    x:\n      - 1\n      - 2\n", 4)]
#[case::dotted_twice("- object: A\n  fields:\n    x:\n      a.b.c:\n", 4)]
fn malformed_recipes_are_syntax_errors(#[case] recipe: &str, #[case] line: usize) {
	let error = run_error(recipe);
	assert!(matches!(error, SynthgenError::Syntax { .. }), "{error:?}");
	assert!(
		error.to_string().ends_with(&format!(":{line}")),
		"`{error}` should end with `:{line}`"
	);
}

#[test]
fn parse_errors_write_no_rows() {
	let mut output = MemoryOutputStream::new();
	let recipe = "- object: Fine\n- object: Broken\n  fields:\n    x: <<1 +>>\n";
	let result = generate(recipe.as_bytes(), RECIPE_FILENAME, &test_options(), &mut output);
	assert!(result.is_err());
	assert!(output.rows.is_empty());
}

#[test]
fn aliases_report_the_enclosing_line() {
	let recipe = r"
- object: A
  count: 0
  fields:
    first: &shared <<nope>>
- object: B
  fields:
    second: *shared
";
	let error = run_error(recipe);
	assert!(error.to_string().ends_with(":8"), "{error}");
}

#[rstest]
#[case::negative("- object: A\n  count: -1\n")]
#[case::deferred_negative("- object: A\n  count: <<0 - 2>>\n")]
#[case::deferred_text("- object: A\n  count: <<'many'>>\n")]
fn bad_counts_are_value_errors(#[case] recipe: &str) {
	let error = run_error(recipe);
	assert!(matches!(error, SynthgenError::Value { .. }), "{error:?}");
	assert!(error.to_string().ends_with(":2"), "{error}");
}

#[test]
fn zero_count_child_is_null() -> SynthgenResult<()> {
	let recipe = r"
- object: Parent
  fields:
    child:
      object: Child
      count: 0
";
	let (output, _) = run(recipe)?;
	assert!(output.table("Child").is_empty());
	assert_eq!(field(output.table("Parent")[0], "child"), FieldValue::Null);

	Ok(())
}

#[test]
fn date_functions() -> SynthgenResult<()> {
	let recipe = r"
- object: Event
  fields:
    fixed:
      date:
        year: 2024
        month: 2
        day: 29
    parsed: <<date('2023-12-25')>>
    stamp:
      datetime:
        year: 2024
        month: 1
        day: 2
        hour: 3
        minute: 4
        second: 5
    empty:
      date_between:
        start_date: 2024-01-10
        end_date: 2024-01-01
    recent:
      date_between:
        start_date: -30d
        end_date: today
";
	let (output, _) = run(recipe)?;
	let row = output.table("Event")[0];

	assert_eq!(field(row, "fixed"), FieldValue::Date(date(2024, 2, 29)));
	assert_eq!(field(row, "parsed"), FieldValue::Date(date(2023, 12, 25)));
	assert_eq!(
		field(row, "stamp").to_string(),
		"2024-01-02 03:04:05".to_owned()
	);
	assert_eq!(field(row, "empty"), FieldValue::Null);

	let FieldValue::Date(recent) = field(row, "recent") else {
		panic!("expected a date");
	};
	assert!(recent >= date(2024, 5, 16) && recent <= date(2024, 6, 15), "{recent}");

	Ok(())
}

fn date(year: i32, month: u32, day: u32) -> NaiveDate {
	NaiveDate::from_ymd_opt(year, month, day).unwrap_or_default()
}

#[rstest]
#[case::unknown_function("- object: A\n  fields:\n    x:\n      no_such_function: 1\n")]
#[case::unknown_fake("- object: A\n  fields:\n    x:\n      fake: no_such_generator\n")]
#[case::missing_reference("- object: A\n  fields:\n    x:\n      reference: Nobody\n")]
fn unknown_names_are_name_errors(#[case] recipe: &str) {
	let error = run_error(recipe);
	assert!(matches!(error, SynthgenError::Name { .. }), "{error:?}");
}

#[rstest]
#[case::bare_choice("- object: A\n  fields:\n    x:\n      choice:\n        pick: 1\n")]
#[case::bad_range("- object: A\n  fields:\n    x:\n      random_number:\n        min: 5\n        max: 1\n")]
#[case::bad_weight("- object: A\n  fields:\n    x:\n      random_choice:\n        a: lots\n")]
fn malformed_arguments_are_value_errors(#[case] recipe: &str) {
	let error = run_error(recipe);
	assert!(matches!(error, SynthgenError::Value { .. }), "{error:?}");
}

#[test]
fn fake_data_is_available_everywhere() -> SynthgenResult<()> {
	let recipe = r"
- object: Person
  fields:
    first:
      fake: first_name
    city: <<fake.city>>
    french: <<fake_i18n('fr_FR').first_name>>
    email:
      fake.email:
";
	let (output, _) = run(recipe)?;
	let row = output.table("Person")[0];
	for name in ["first", "city", "french", "email"] {
		let value = field(row, name);
		assert!(value.as_str().is_some_and(|text| !text.is_empty()), "{name}: {value:?}");
	}

	Ok(())
}

#[test]
#[traced_test]
fn tables_sort_after_their_dependencies() {
	let dependencies = BTreeSet::from([
		Dependency::new("Parent", "Child", "child"),
		Dependency::new("Child", "Child", "sibling"),
	]);
	let order = sort_tables_by_dependencies(["Parent", "Child"], &dependencies);
	assert_eq!(order, vec!["Child", "Parent"]);
	assert!(!logs_contain("reference cycle"));
}

#[test]
#[traced_test]
fn cycles_are_broken_with_a_warning() {
	let dependencies = BTreeSet::from([Dependency::new("B", "A", "a"), Dependency::new("A", "B", "b")]);
	let order = sort_tables_by_dependencies(["B", "A", "Free"], &dependencies);

	assert_eq!(order, vec!["Free", "A", "B"]);
	assert!(logs_contain("reference cycle"));
}

#[test]
fn mapping_follows_dependency_order() -> SynthgenResult<()> {
	let (_, summary) = run(account_contacts_recipe())?;
	let mapping = mapping_from_summary(&summary);

	assert_eq!(mapping.keys().collect::<Vec<_>>(), vec!["Insert Account", "Insert Contact"]);
	let contact = &mapping["Insert Contact"];
	assert!(contact.fields.is_empty());
	assert_eq!(contact.lookups["AccountId"], Lookup {
		table: "Account".to_owned(),
		key_field: "AccountId".to_owned(),
	});
	assert_eq!(mapping["Insert Account"].fields.keys().collect::<Vec<_>>(), vec!["Name", "Size"]);

	let yaml = mapping_to_yaml(&mapping)?;
	assert!(yaml.starts_with("Insert Account:"), "{yaml}");
	assert!(yaml.contains("key_field: AccountId"), "{yaml}");
	assert!(yaml.contains("fields: {}"), "{yaml}");

	Ok(())
}

#[test]
fn debug_output_lists_rows() -> SynthgenResult<()> {
	let mut output = DebugOutputStream::new(Vec::new());
	generate(
		account_contacts_recipe().as_bytes(),
		RECIPE_FILENAME,
		&test_options(),
		&mut output,
	)?;
	output.close()?;
	let text = String::from_utf8_lossy(&output.into_inner()).into_owned();

	insta::assert_snapshot!(text.trim_end(), @r"
	Account(id=1, Name=Acme, Size=10)
	Contact(id=1, AccountId=1)
	Account(id=2, Name=Acme, Size=10)
	Contact(id=2, AccountId=2)
	");

	Ok(())
}

#[test]
fn json_output_is_one_array() -> SynthgenResult<()> {
	let recipe = "- object: foo\n  count: 2\n  fields:\n    a: b\n    c: 3\n";
	let mut output = JsonOutputStream::new(Vec::new());
	generate(recipe.as_bytes(), RECIPE_FILENAME, &test_options(), &mut output)?;
	output.close()?;

	let value: serde_json::Value = serde_json::from_slice(&output.into_inner())?;
	assert_eq!(
		value,
		serde_json::json!([
			{"_table": "foo", "id": 1, "a": "b", "c": 3},
			{"_table": "foo", "id": 2, "a": "b", "c": 3},
		])
	);

	Ok(())
}

#[test]
fn empty_json_output_is_an_empty_array() -> SynthgenResult<()> {
	let mut output = JsonOutputStream::new(Vec::new());
	output.close()?;
	assert_eq!(output.into_inner(), b"[]\n".to_vec());

	Ok(())
}

#[test]
fn csv_output_writes_a_file_per_table() -> AnyEmptyResult {
	let recipe = r"
- object: foo
  fields:
    a: 1
    c: 3
- object: foo
  fields:
    b: 2
    d: 4
    flag: true
- object: bar
  fields:
    when: 2024-03-01
";
	let tmp = tempfile::tempdir()?;
	let directory = tmp.path().join("csvoutput");
	let mut output = CsvOutputStream::new(&directory);
	generate(recipe.as_bytes(), RECIPE_FILENAME, &test_options(), &mut output)?;
	output.close()?;

	let read = |table: &str| -> AnyResult<Vec<Vec<String>>> {
		let mut reader = csv::ReaderBuilder::new()
			.has_headers(false)
			.from_path(directory.join(format!("{table}.csv")))?;
		let mut records = Vec::new();
		for record in reader.records() {
			records.push(record?.iter().map(str::to_owned).collect());
		}
		Ok(records)
	};

	assert_eq!(read("foo")?, vec![
		vec!["id", "a", "c", "b", "d", "flag"],
		vec!["1", "1", "3", "", "", ""],
		vec!["2", "", "", "2", "4", "1"],
	]);
	assert_eq!(read("bar")?, vec![vec!["id", "when"], vec!["1", "2024-03-01"]]);

	let metadata: serde_json::Value =
		serde_json::from_str(&fs::read_to_string(directory.join("csvw_metadata.json"))?)?;
	let urls: Vec<_> = metadata["tables"]
		.as_array()
		.into_iter()
		.flatten()
		.filter_map(|table| table["url"].as_str())
		.collect();
	assert_eq!(urls, vec!["foo.csv", "bar.csv"]);

	Ok(())
}

#[test]
fn dot_output_draws_references() -> SynthgenResult<()> {
	let mut output = DotOutputStream::new(Vec::new());
	generate(
		round_trip_recipe().as_bytes(),
		RECIPE_FILENAME,
		&test_options(),
		&mut output,
	)?;
	output.close()?;
	let text = String::from_utf8_lossy(&output.into_inner()).into_owned();

	assert!(text.starts_with("digraph synthgen {"), "{text}");
	assert!(text.contains("\"B 1\" -> \"A 1\" [label=\"A_ref\"];"), "{text}");
	assert!(text.contains("\"A 1\" -> \"B 1\" [label=\"B\"];"), "{text}");
	assert!(text.trim_end().ends_with('}'), "{text}");

	Ok(())
}

#[test]
fn multiplex_output_feeds_every_sink() -> SynthgenResult<()> {
	let mut first = MemoryOutputStream::new();
	let mut second = MemoryOutputStream::new();
	{
		let mut output = MultiplexOutputStream::new(vec![Box::new(&mut first), Box::new(&mut second)]);
		generate(
			account_contacts_recipe().as_bytes(),
			RECIPE_FILENAME,
			&test_options(),
			&mut output,
		)?;
		output.close()?;
	}

	assert_eq!(first.rows.len(), 4);
	assert_eq!(first.rows, second.rows);
	assert!(first.closed && second.closed);
	assert_eq!(first.tables.keys().collect::<Vec<_>>(), vec!["Account", "Contact"]);

	Ok(())
}

#[test]
fn sinks_flush_every_thousand_rows() -> SynthgenResult<()> {
	let (output, _) = run("- object: Bulk\n  count: 2500\n")?;
	// Two periodic flushes plus the one at the end of the run.
	assert_eq!(output.flushes, 3);
	assert_eq!(output.commits, 0);

	Ok(())
}

#[test]
fn batch_thresholds_are_configurable() -> SynthgenResult<()> {
	let mut output = MemoryOutputStream::new().with_batch_counter(BatchCounter::new(2, 5));
	generate(
		"- object: Bulk\n  count: 10\n".as_bytes(),
		RECIPE_FILENAME,
		&test_options(),
		&mut output,
	)?;

	// Five periodic flushes plus the one at the end of the run.
	assert_eq!(output.flushes, 6);
	assert_eq!(output.commits, 2);

	Ok(())
}

#[rstest]
#[case::defaults(BatchCounter::default(), 1_000, 10_000)]
#[case::never(BatchCounter::new(0, 0), 0, 0)]
fn batch_counter_reports_when_to_flush_and_commit(
	#[case] mut batch: BatchCounter,
	#[case] flush_every: u64,
	#[case] commit_every: u64,
) {
	let mut flushes = 0;
	let mut commits = 0;
	for _ in 0..20_000 {
		let (flush, commit) = batch.record();
		flushes += u64::from(flush);
		commits += u64::from(commit);
	}

	assert_eq!(batch.rows(), 20_000);
	assert_eq!(flushes, 20_000_u64.checked_div(flush_every).unwrap_or(0));
	assert_eq!(commits, 20_000_u64.checked_div(commit_every).unwrap_or(0));
}

#[test]
fn rows_referencing_each_other_are_freed_after_the_run() -> SynthgenResult<()> {
	let recipe = parse_recipe(round_trip_recipe(), RECIPE_FILENAME)?;
	let mut output = MemoryOutputStream::new();
	let row = {
		let globals = Globals::new(Some(7), Arc::new(BuiltinFakeData));
		let mut interpreter = Interpreter::new(globals, &mut output);
		let root = RuntimeContext::root(IndexMap::new());
		recipe.templates[0].generate_rows(&mut interpreter, &root)?
	};
	let Some(row) = row else {
		panic!("expected a row of A");
	};
	assert!(row.fields().is_empty(), "{row:?}");

	let weak = Arc::downgrade(&row);
	drop(row);
	assert!(weak.upgrade().is_none(), "row A outlived the run");
	assert_eq!(output.rows.len(), 2);

	Ok(())
}

#[test]
fn dot_output_escapes_quotes_and_backslashes() -> SynthgenResult<()> {
	let row = ObjectRow::new("Odd\"Table", 1);
	row.set("path", FieldValue::from(r#"C:\dir "x""#));

	let mut output = DotOutputStream::new(Vec::new());
	output.write_row("Odd\"Table", &row)?;
	output.close()?;
	let text = String::from_utf8_lossy(&output.into_inner()).into_owned();

	assert!(text.contains(r#"  "Odd\"Table 1" [label="#), "{text}");
	assert!(text.contains(r#"path: C:\\dir \"x\""#), "{text}");

	Ok(())
}

fn keep(value: FieldValue) -> FieldValue {
	value
}

const INTEGERS_ONLY: &[(ValueKind, Encoder)] = &[(ValueKind::Int, keep)];

#[derive(Debug, Default)]
struct IntegerSink {
	rows: usize,
}

impl OutputStream for IntegerSink {
	fn name(&self) -> &'static str {
		"integer"
	}

	fn encoders(&self) -> &'static [(ValueKind, Encoder)] {
		INTEGERS_ONLY
	}

	fn write_single_row(&mut self, _table: &str, _row: EncodedRow) -> SynthgenResult<()> {
		self.rows += 1;
		Ok(())
	}
}

#[test]
fn values_without_an_encoder_are_rejected() {
	let mut output = IntegerSink::default();
	let recipe = "- object: Count\n  fields:\n    n: 1\n- object: Named\n  fields:\n    name: Acme\n";
	let Err(error) = generate(recipe.as_bytes(), RECIPE_FILENAME, &test_options(), &mut output) else {
		panic!("expected a missing encoder");
	};

	assert_eq!(output.rows, 1);
	assert!(
		error.to_string().contains("no encoder for type `string` in the integer output"),
		"{error}"
	);
	assert!(error.to_string().ends_with(":4"), "{error}");
}

#[test]
fn include_file_is_relative_to_the_including_file() -> AnyEmptyResult {
	let tmp = tempfile::tempdir()?;
	fs::create_dir(tmp.path().join("parts"))?;
	fs::write(
		tmp.path().join("parts/shared.yml"),
		"- macro: stamp\n  fields:\n    source: shared\n- object: Included\n",
	)?;
	fs::write(
		tmp.path().join("main.yml"),
		"- include_file: parts/shared.yml\n- object: Main\n  include: stamp\n",
	)?;

	let mut output = MemoryOutputStream::new();
	let summary = generate_file(&tmp.path().join("main.yml"), &test_options(), &mut output)?;

	assert_eq!(summary.tables.keys().collect::<Vec<_>>(), vec!["Included", "Main"]);
	assert_eq!(field(output.table("Main")[0], "source"), FieldValue::from("shared"));

	Ok(())
}

#[test]
fn missing_include_file_reports_the_include_line() -> AnyEmptyResult {
	let tmp = tempfile::tempdir()?;
	fs::write(tmp.path().join("main.yml"), "- object: First\n- include_file: nowhere.yml\n")?;

	let mut output = MemoryOutputStream::new();
	let Err(error) = generate_file(&tmp.path().join("main.yml"), &test_options(), &mut output) else {
		panic!("expected a missing include");
	};
	assert!(matches!(error, SynthgenError::Generic { .. }), "{error:?}");
	assert!(error.to_string().ends_with(":2"), "{error}");

	Ok(())
}

#[test]
fn absolute_include_paths_are_rejected() {
	let error = run_error("- include_file: /etc/recipe.yml\n");
	assert!(matches!(error, SynthgenError::Syntax { .. }), "{error:?}");
}

#[test]
fn debug_summary_serializes() -> SynthgenResult<()> {
	let (_, summary) = run(account_contacts_recipe())?;
	let yaml = serde_yaml_ng::to_string(&summary.summarize_for_debugging())?;

	assert!(yaml.contains("table_name_from: Contact"), "{yaml}");
	assert!(!yaml.contains("extra_options"), "{yaml}");

	Ok(())
}
