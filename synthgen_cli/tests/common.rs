use std::path::Path;
use std::path::PathBuf;

use assert_cmd::Command;
use insta_cmd::get_cargo_bin;

pub fn synthgen_cmd() -> Command {
	let mut cmd = Command::new(get_cargo_bin("synthgen"));
	cmd.env("NO_COLOR", "1");
	cmd.env_remove("RUST_LOG");
	cmd
}

/// Write `recipe` to `recipe.yml` inside `dir`.
pub fn write_recipe(dir: &Path, recipe: &str) -> std::io::Result<PathBuf> {
	let path = dir.join("recipe.yml");
	std::fs::write(&path, recipe)?;
	Ok(path)
}

pub const ACCOUNTS: &str = r"
- option: account_count
  default: 2
- object: Account
  count: <<account_count>>
  fields:
    Name: Acme
    Size:
      random_number:
        min: 1
        max: 100
  friends:
    - object: Contact
      fields:
        AccountId:
          reference: Account
";
