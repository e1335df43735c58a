use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use minijinja::Error;
use minijinja::ErrorKind;
use minijinja::State;
use minijinja::Value;
use minijinja::value::Object;
use rand::Rng;
use rand::RngCore;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use crate::FieldValue;

/// Source of realistic-looking random strings (`fake.first_name`).
///
/// The engine only knows generators by name. Embedders can plug in a richer
/// provider through [`GenerateOptions::fake_provider`](crate::GenerateOptions).
pub trait FakeDataProvider: fmt::Debug + Send + Sync {
	/// Produce one value from the named generator, or `None` when the
	/// provider has no generator with that name.
	fn fake(&self, name: &str, locale: Option<&str>, rng: &mut dyn RngCore) -> Option<FieldValue>;
}

/// The small provider used when no other one is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinFakeData;

const FIRST_NAMES: &[&str] = &[
	"Alice", "Bashir", "Carmen", "Dmitri", "Esther", "Farah", "Gustavo", "Hana", "Ivan", "Jonas",
	"Keiko", "Liam", "Maya", "Nadia", "Oscar", "Priya", "Quentin", "Rosa", "Samir", "Tara",
];
const LAST_NAMES: &[&str] = &[
	"Anders", "Baptiste", "Chen", "Dubois", "Eriksen", "Fernandez", "Garcia", "Haddad", "Ito",
	"Jensen", "Kowalski", "Lopez", "Moreau", "Nakamura", "Okafor", "Patel", "Quinn", "Rossi",
];
const FR_FIRST_NAMES: &[&str] = &[
	"Amélie", "Baptiste", "Camille", "Élodie", "François", "Hélène", "Juliette", "Mathieu",
];
const FR_LAST_NAMES: &[&str] = &["Bernard", "Dubois", "Fontaine", "Girard", "Lefèvre", "Martin"];
const DE_FIRST_NAMES: &[&str] = &["Anja", "Bernd", "Claudia", "Dieter", "Jürgen", "Lena", "Ulrike"];
const DE_LAST_NAMES: &[&str] = &["Becker", "Fischer", "Hoffmann", "Müller", "Schmidt", "Weber"];
const COMPANY_WORDS: &[&str] = &[
	"Acme", "Blue Harbor", "Cedar", "Northwind", "Summit", "Tidewater", "Vertex", "Willow",
];
const COMPANY_SUFFIXES: &[&str] = &["Inc", "LLC", "Group", "and Sons", "Ltd"];
const CITIES: &[&str] = &[
	"Austin", "Bergen", "Curitiba", "Dakar", "Edinburgh", "Fukuoka", "Gdańsk", "Halifax",
];
const COUNTRIES: &[&str] = &["Canada", "Norway", "Brazil", "Senegal", "Japan", "Poland", "Kenya"];
const STATES: &[&str] = &["Alberta", "Bavaria", "Ceará", "Ontario", "Oregon", "Victoria"];
const STREETS: &[&str] = &["Birch", "Harbor", "Juniper", "Maple", "Mill", "Orchard", "Station"];
const STREET_KINDS: &[&str] = &["Street", "Avenue", "Road", "Lane", "Way"];
const WORDS: &[&str] = &[
	"amber", "bridge", "canvas", "delta", "ember", "forest", "granite", "harvest", "island",
	"lantern", "meadow", "nimbus", "orbit", "prairie", "quartz", "river", "signal", "timber",
];
const JOBS: &[&str] = &["Accountant", "Architect", "Chemist", "Editor", "Nurse", "Pilot", "Welder"];
const DOMAINS: &[&str] = &["example.com", "example.org", "example.net"];

fn pick<'a>(rng: &mut dyn RngCore, items: &[&'a str]) -> &'a str {
	items.choose(rng).copied().unwrap_or_default()
}

fn first_names(locale: Option<&str>) -> &'static [&'static str] {
	match locale {
		Some("fr_FR") => FR_FIRST_NAMES,
		Some("de_DE") => DE_FIRST_NAMES,
		_ => FIRST_NAMES,
	}
}

fn last_names(locale: Option<&str>) -> &'static [&'static str] {
	match locale {
		Some("fr_FR") => FR_LAST_NAMES,
		Some("de_DE") => DE_LAST_NAMES,
		_ => LAST_NAMES,
	}
}

fn sentence(rng: &mut dyn RngCore, words: usize) -> String {
	let mut text = (0..words)
		.map(|_| pick(rng, WORDS))
		.collect::<Vec<_>>()
		.join(" ");
	if let Some(first) = text.get(..1).map(str::to_uppercase) {
		text.replace_range(..1, &first);
	}
	text.push('.');
	text
}

impl FakeDataProvider for BuiltinFakeData {
	fn fake(&self, name: &str, locale: Option<&str>, rng: &mut dyn RngCore) -> Option<FieldValue> {
		let text = match name {
			"first_name" | "FirstName" => pick(rng, first_names(locale)).to_owned(),
			"last_name" | "LastName" => pick(rng, last_names(locale)).to_owned(),
			"name" => {
				format!(
					"{} {}",
					pick(rng, first_names(locale)),
					pick(rng, last_names(locale))
				)
			}
			"email" => {
				format!(
					"{}.{}@{}",
					pick(rng, FIRST_NAMES).to_lowercase(),
					pick(rng, LAST_NAMES).to_lowercase(),
					pick(rng, DOMAINS)
				)
			}
			"company" => format!("{} {}", pick(rng, COMPANY_WORDS), pick(rng, COMPANY_SUFFIXES)),
			"city" => pick(rng, CITIES).to_owned(),
			"country" => pick(rng, COUNTRIES).to_owned(),
			"state" => pick(rng, STATES).to_owned(),
			"street_address" | "address" => {
				format!(
					"{} {} {}",
					rng.gen_range(1..=9999),
					pick(rng, STREETS),
					pick(rng, STREET_KINDS)
				)
			}
			"postalcode" | "postcode" | "zipcode" => format!("{:05}", rng.gen_range(501..=99950)),
			"phone_number" => {
				format!(
					"({:03}) {:03}-{:04}",
					rng.gen_range(200..=999),
					rng.gen_range(200..=999),
					rng.gen_range(0..=9999)
				)
			}
			"job" => pick(rng, JOBS).to_owned(),
			"word" => pick(rng, WORDS).to_owned(),
			"sentence" | "catch_phrase" => sentence(rng, 6),
			"paragraph" | "text" => {
				(0..3)
					.map(|_| sentence(rng, 8))
					.collect::<Vec<_>>()
					.join(" ")
			}
			"boolean" => return Some(FieldValue::Bool(rng.gen_bool(0.5))),
			"random_int" => return Some(FieldValue::Int(rng.gen_range(0..=9999))),
			_ => return None,
		};

		Some(FieldValue::String(text))
	}
}

/// The run's random number generator, shared between the engine and the
/// expression functions.
#[derive(Debug, Clone)]
pub(crate) struct SharedRng(Arc<Mutex<StdRng>>);

impl SharedRng {
	pub(crate) fn new(seed: Option<u64>) -> Self {
		let rng = match seed {
			Some(seed) => StdRng::seed_from_u64(seed),
			None => StdRng::from_entropy(),
		};

		Self(Arc::new(Mutex::new(rng)))
	}

	pub(crate) fn with<T>(&self, f: impl FnOnce(&mut StdRng) -> T) -> T {
		let mut rng = self.0.lock().unwrap_or_else(PoisonError::into_inner);
		f(&mut rng)
	}
}

/// `fake` inside expressions: every attribute is a generator name.
#[derive(Debug)]
pub(crate) struct FakeHandle {
	pub(crate) provider: Arc<dyn FakeDataProvider>,
	pub(crate) rng: SharedRng,
	pub(crate) locale: Option<String>,
}

impl FakeHandle {
	fn generate(&self, name: &str) -> Option<FieldValue> {
		self.rng
			.with(|rng| self.provider.fake(name, self.locale.as_deref(), rng))
	}
}

impl Object for FakeHandle {
	fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
		self.generate(key.as_str()?).map(|value| value.to_value())
	}

	fn call_method(
		self: &Arc<Self>,
		_state: &State<'_, '_>,
		method: &str,
		_args: &[Value],
	) -> Result<Value, Error> {
		self.generate(method)
			.map(|value| value.to_value())
			.ok_or_else(|| {
				Error::new(
					ErrorKind::UnknownMethod,
					format!("no fake data generator named `{method}`"),
				)
			})
	}
}
