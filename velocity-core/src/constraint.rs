use crate::error::{self, Result};
use crate::image::ConstraintKind;
use serde::Deserialize;
use snafu::ensure;

/// Where a constraint is allowed to activate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// Activates when the image being tested satisfies `image_name` and `when`.
    Image,
    /// Activates per-target, keyed to recipe membership.
    Build,
    /// Activates for every image when `when` alone is satisfied.
    Global,
}

impl Default for Scope {
    fn default() -> Self {
        Scope::Image
    }
}

/// A single constraint: `(image_name, when_spec, kind, payload, scope)`.
#[derive(Debug, Clone)]
pub struct Constraint {
    pub image_name: String,
    pub when: String,
    pub kind: ConstraintKind,
    pub payload: String,
    pub scope: Scope,
}

impl Constraint {
    pub fn new(
        image_name: impl Into<String>,
        when: impl Into<String>,
        kind: ConstraintKind,
        payload: impl Into<String>,
        scope: Scope,
    ) -> Self {
        Self {
            image_name: image_name.into(),
            when: when.into(),
            kind,
            payload: payload.into(),
            scope,
        }
    }

    /// The clause this constraint's `when` is combined with: the declaring image's own name,
    /// unless the constraint already carries a more specific `when`.
    pub fn effective_when(&self) -> String {
        if self.when.is_empty() {
            self.image_name.clone()
        } else if self.image_name.is_empty() {
            self.when.clone()
        } else {
            format!("{} {}", self.image_name, self.when)
        }
    }
}

/// Holds every constraint parsed from catalogs and CLI arguments.
#[derive(Debug, Clone, Default)]
pub struct ConstraintStore {
    constraints: Vec<Constraint>,
}

impl ConstraintStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, constraint: Constraint) {
        self.constraints.push(constraint);
    }

    pub fn extend(&mut self, other: impl IntoIterator<Item = Constraint>) {
        self.constraints.extend(other);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Constraint> {
        self.constraints.iter()
    }

    pub fn by_scope(&self, scope: Scope) -> impl Iterator<Item = &Constraint> {
        self.constraints.iter().filter(move |c| c.scope == scope)
    }

    pub fn not_scope(&self, scope: Scope) -> impl Iterator<Item = &Constraint> {
        self.constraints.iter().filter(move |c| c.scope != scope)
    }
}

/// How a target's requested version constrains candidate images.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepOp {
    /// Exact version match (`NAME@V`).
    Eq,
    /// At least this version (`NAME@V:`).
    Ge,
    /// At most this version (`NAME@:V`).
    Le,
    /// Any version acceptable (bare `NAME`).
    Un,
}

/// A user-requested target, parsed from a build spec string.
#[derive(Debug, Clone)]
pub struct Target {
    pub name: String,
    pub op: DepOp,
    pub version: Option<velocity_version::Version>,
}

impl Target {
    /// Parse one whitespace-delimited target token: `NAME`, `NAME@V`, or `NAME@V:`/`NAME@:V`.
    pub fn parse(spec: &str) -> Result<Self> {
        let spec = spec.trim();
        ensure!(!spec.is_empty(), error::InvalidTargetSpecSnafu { spec });

        let Some((name, version_spec)) = spec.split_once('@') else {
            return Ok(Self {
                name: spec.to_string(),
                op: DepOp::Un,
                version: None,
            });
        };

        let (op, raw_version) = if let Some(v) = version_spec.strip_suffix(':') {
            (DepOp::Ge, v)
        } else if let Some(v) = version_spec.strip_prefix(':') {
            (DepOp::Le, v)
        } else {
            (DepOp::Eq, version_spec)
        };

        let version = velocity_version::Version::parse(raw_version)
            .map_err(|_| error::InvalidTargetSpecSnafu { spec: spec.to_string() }.build())?;

        Ok(Self {
            name: name.to_string(),
            op,
            version: Some(version),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_targets() {
        let t = Target::parse("gcc").unwrap();
        assert_eq!(t.name, "gcc");
        assert_eq!(t.op, DepOp::Un);

        let t = Target::parse("gcc@12.3").unwrap();
        assert_eq!(t.op, DepOp::Eq);

        let t = Target::parse("gcc@11.5:").unwrap();
        assert_eq!(t.op, DepOp::Ge);

        let t = Target::parse("gcc@:11.5").unwrap();
        assert_eq!(t.op, DepOp::Le);
    }

    #[test]
    fn stores_filter_by_scope() {
        let mut store = ConstraintStore::new();
        store.push(Constraint::new("a", "", ConstraintKind::Dependency, "b", Scope::Image));
        store.push(Constraint::new("", "", ConstraintKind::Variable, "x=1", Scope::Global));
        assert_eq!(store.by_scope(Scope::Global).count(), 1);
        assert_eq!(store.by_scope(Scope::Image).count(), 1);
        assert_eq!(store.not_scope(Scope::Build).count(), 2);
    }
}
