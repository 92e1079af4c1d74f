//! Parses the `build` subcommand's `-A`/`-V` strings into build-argument overrides and
//! variable constraints. Kept out of `velocity-core`: these are CLI-surface string formats,
//! not catalog data types.

use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use velocity_core::{Constraint, ConstraintKind, Scope};

/// `-A "key:value;key2:value2"` into a literal build-argument map, fed straight into
/// `Backend::generate_build_cmd`.
pub(crate) fn parse_build_args(raw: &str) -> Result<HashMap<String, String>> {
    let mut out = HashMap::new();
    for pair in raw.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        let (key, value) = pair
            .split_once(':')
            .with_context(|| format!("invalid -A entry '{pair}': expected 'key:value'"))?;
        out.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(out)
}

/// One `-V "name:NAME;value:VALUE"` invocation into a global-scope `Variable` constraint,
/// mirroring the catalog's own `variables[]: {name, value}` schema.
pub(crate) fn parse_var_constraint(raw: &str) -> Result<Constraint> {
    let mut name = None;
    let mut value = None;
    for field in raw.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        let (key, v) = field
            .split_once(':')
            .with_context(|| format!("invalid -V entry '{field}': expected 'name:...' or 'value:...'"))?;
        match key.trim() {
            "name" => name = Some(v.trim().to_string()),
            "value" => value = Some(v.trim().to_string()),
            other => bail!("invalid -V field '{other}': expected 'name' or 'value'"),
        }
    }
    let name = name.with_context(|| format!("-V entry '{raw}' is missing a 'name' field"))?;
    let value = value.unwrap_or_default();

    Ok(Constraint::new(
        "",
        "",
        ConstraintKind::Variable,
        format!("{name}={value}"),
        Scope::Global,
    ))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_build_args() {
        let args = parse_build_args("FOO:bar;BAZ:qux").unwrap();
        assert_eq!(args.get("FOO").map(String::as_str), Some("bar"));
        assert_eq!(args.get("BAZ").map(String::as_str), Some("qux"));
    }

    #[test]
    fn empty_build_args_is_empty_map() {
        assert!(parse_build_args("").unwrap().is_empty());
    }

    #[test]
    fn parses_var_constraint() {
        let c = parse_var_constraint("name:FOO;value:bar").unwrap();
        assert_eq!(c.payload, "FOO=bar");
        assert_eq!(c.scope, Scope::Global);
    }

    #[test]
    fn var_constraint_requires_name() {
        assert!(parse_var_constraint("value:bar").is_err());
    }

    #[test]
    fn rejects_malformed_build_arg() {
        assert!(parse_build_args("nocolon").is_err());
    }
}
