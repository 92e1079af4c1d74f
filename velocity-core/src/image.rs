use crate::error::{self, Result};
use regex::Regex;
use sha2::{Digest, Sha256};
use snafu::{ensure, ResultExt};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use velocity_version::Version;

/// What changed when a constraint was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutation {
    /// No field matched the constraint's `when` clause.
    NoMatch,
    /// A dependency was newly added (drives the planner's fixed-point loop).
    DependencyAdded,
    /// Some other field was mutated (or a dependency that already existed was re-applied).
    Other,
}

impl Mutation {
    pub fn dependency_added(self) -> bool {
        matches!(self, Mutation::DependencyAdded)
    }
}

/// One kind of constraint payload, as named in the catalog schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConstraintKind {
    Dependency,
    Variable,
    Argument,
    Template,
    File,
    Prolog,
}

/// A concrete, versioned image record.
///
/// Images produced by [`crate::repo::ImageRepo`] are cloned before planning, since planning
/// mutates dependency/variable/argument/template/file/prolog fields by applying constraints.
#[derive(Debug, Clone)]
pub struct Image {
    pub name: String,
    pub version: Version,
    pub system: String,
    pub backend: String,
    pub distro: String,
    pub dependencies: BTreeSet<String>,
    pub variables: BTreeMap<String, String>,
    pub arguments: BTreeSet<String>,
    pub template: Option<String>,
    pub files: BTreeSet<String>,
    pub prolog: Option<String>,
    /// Running sum of preceding images' numeric ids in a resolved recipe; `0` until planned.
    pub underlay: u64,
    pub catalog_path: PathBuf,
    /// SHA-256 hex digest of the selected template file's bytes, if any.
    pub template_hash: String,
}

impl Image {
    pub fn new(name: impl Into<String>, version: Version, catalog_path: PathBuf) -> Self {
        Self {
            name: name.into(),
            version,
            system: String::new(),
            backend: String::new(),
            distro: String::new(),
            dependencies: BTreeSet::new(),
            variables: BTreeMap::new(),
            arguments: BTreeSet::new(),
            template: None,
            files: BTreeSet::new(),
            prolog: None,
            underlay: 0,
            catalog_path,
            template_hash: String::new(),
        }
    }

    /// The SHA-256 identity of this image: a canonical concatenation of every field that can
    /// affect the produced image, plus the underlay sum.
    pub fn hash(&self) -> String {
        let vars = self
            .variables
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",");
        let canonical = [
            self.name.as_str(),
            &self.version.to_string(),
            &self.system,
            &self.backend,
            &self.distro,
            &self.dependencies.iter().cloned().collect::<Vec<_>>().join(","),
            &vars,
            &self.arguments.iter().cloned().collect::<Vec<_>>().join(","),
            &self.template_hash,
            &self.files.iter().cloned().collect::<Vec<_>>().join(","),
            self.prolog.as_deref().unwrap_or(""),
            &self.underlay.to_string(),
        ]
        .join("|");

        hex::encode(Sha256::digest(canonical.as_bytes()))
    }

    /// The leading 7 hex characters of [`Image::hash`].
    pub fn id(&self) -> String {
        self.hash()[..7].to_string()
    }

    /// `id` interpreted as an integer, for underlay accumulation.
    pub fn id_numeric(&self) -> u64 {
        u64::from_str_radix(&self.id(), 16).unwrap_or(0)
    }

    /// The on-disk path to this image's selected template, if any.
    pub fn template_path(&self) -> Option<PathBuf> {
        self.template
            .as_ref()
            .map(|name| self.catalog_path.join("templates").join(format!("{name}.vtmp")))
    }

    /// Read the selected template's bytes and record their SHA-256 hex digest, so it
    /// participates in [`Image::hash`]. A no-op when no template has been assigned yet.
    pub fn resolve_template_hash(&mut self) -> Result<()> {
        let Some(path) = self.template_path() else {
            return Ok(());
        };
        let bytes = std::fs::read(&path).context(error::ReadCatalogFileSnafu { path: path.clone() })?;
        self.template_hash = hex::encode(Sha256::digest(&bytes));
        Ok(())
    }

    /// Evaluate a whitespace-separated spec against this image. Every clause must hold; an
    /// empty spec is vacuously true.
    pub fn satisfies(&self, spec: &str) -> Result<bool> {
        for clause in spec.split_whitespace() {
            if !self.satisfies_clause(clause)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn satisfies_clause(&self, clause: &str) -> Result<bool> {
        if let Some(dep) = clause.strip_prefix('^') {
            return Ok(self.dependencies.contains(dep));
        }
        if let Some(system) = clause.strip_prefix("system=") {
            return Ok(self.system == system);
        }
        if let Some(backend) = clause.strip_prefix("backend=") {
            return Ok(self.backend == backend);
        }
        if let Some(distro) = clause.strip_prefix("distro=") {
            return Ok(self.distro == distro);
        }
        if let Some((name, version_spec)) = clause.split_once('@') {
            if name != self.name {
                return Ok(false);
            }
            return self.satisfies_version_clause(clause, version_spec);
        }

        // Bare name clause.
        static NAME_RE: once_name_regex::OnceRegex = once_name_regex::OnceRegex::new(r"^[A-Za-z0-9_-]+$");
        ensure!(NAME_RE.get().is_match(clause), error::UnknownSpecClauseSnafu { spec: clause });
        Ok(self.name == clause)
    }

    fn satisfies_version_clause(&self, clause: &str, version_spec: &str) -> Result<bool> {
        if let Some((lo, hi)) = version_spec.split_once(':') {
            if !lo.is_empty() && !hi.is_empty() {
                let lo = self.parse_version(clause, lo)?;
                let hi = self.parse_version(clause, hi)?;
                return Ok(self.version.ge(&lo) && self.version.le(&hi));
            } else if !lo.is_empty() {
                let lo = self.parse_version(clause, lo)?;
                return Ok(self.version.ge(&lo));
            } else if !hi.is_empty() {
                let hi = self.parse_version(clause, hi)?;
                return Ok(self.version.le(&hi));
            }
            return error::UnknownSpecClauseSnafu { spec: clause }.fail();
        }
        let v = self.parse_version(clause, version_spec)?;
        Ok(self.version == v)
    }

    fn parse_version(&self, clause: &str, s: &str) -> Result<Version> {
        Version::parse(s).map_err(|_| error::UnknownSpecClauseSnafu { spec: clause.to_string() }.build())
    }

    /// Apply one constraint to this image if it satisfies `when`. Returns whether the
    /// constraint newly added a dependency (the planner's fixed-point driver).
    pub fn apply_constraint(&mut self, when: &str, kind: &ConstraintKind, payload: &str) -> Result<Mutation> {
        if !self.satisfies(when)? {
            return Ok(Mutation::NoMatch);
        }
        Ok(self.apply_payload(kind, payload))
    }

    /// Mutate per `kind`/`payload` unconditionally, without checking any `when` clause. Used
    /// for build-scope constraints, which gate activation against the tentative recipe
    /// rather than against the image being mutated (a "global fan-out").
    pub fn apply_payload(&mut self, kind: &ConstraintKind, payload: &str) -> Mutation {
        match kind {
            ConstraintKind::Dependency => {
                let newly_added = self.dependencies.insert(payload.to_string());
                if newly_added {
                    Mutation::DependencyAdded
                } else {
                    Mutation::Other
                }
            }
            ConstraintKind::Variable => {
                let (k, v) = payload.split_once('=').unwrap_or((payload, ""));
                self.variables.insert(k.to_string(), v.to_string());
                Mutation::Other
            }
            ConstraintKind::Argument => {
                self.arguments.insert(payload.to_string());
                Mutation::Other
            }
            ConstraintKind::Template => {
                self.template = Some(payload.to_string());
                Mutation::Other
            }
            ConstraintKind::File => {
                self.files.insert(payload.to_string());
                Mutation::Other
            }
            ConstraintKind::Prolog => {
                self.prolog = Some(payload.to_string());
                Mutation::Other
            }
        }
    }
}

/// A tiny helper so the bare-name regex is compiled once per process without pulling in
/// `lazy_static` for a single pattern.
mod once_name_regex {
    use super::Regex;
    use std::sync::OnceLock;

    pub struct OnceRegex {
        pattern: &'static str,
        cell: OnceLock<Regex>,
    }

    impl OnceRegex {
        pub const fn new(pattern: &'static str) -> Self {
            Self {
                pattern,
                cell: OnceLock::new(),
            }
        }

        pub fn get(&self) -> &Regex {
            self.cell.get_or_init(|| Regex::new(self.pattern).expect("static regex"))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn image(name: &str, version: &str) -> Image {
        Image::new(name, Version::parse(version).unwrap(), PathBuf::from("."))
    }

    #[test]
    fn satisfies_name_and_version() {
        let img = image("gcc", "12.3");
        assert!(img.satisfies("gcc").unwrap());
        assert!(img.satisfies("gcc@12.3").unwrap());
        assert!(img.satisfies("gcc@12:").unwrap());
        assert!(img.satisfies("gcc@:13").unwrap());
        assert!(img.satisfies("gcc@11:13").unwrap());
        assert!(!img.satisfies("gcc@13").unwrap());
        assert!(!img.satisfies("clang").unwrap());
    }

    #[test]
    fn satisfies_facets_and_dependencies() {
        let mut img = image("app", "1");
        img.system = "frontier".to_string();
        img.dependencies.insert("rocm".to_string());
        assert!(img.satisfies("system=frontier ^rocm").unwrap());
        assert!(!img.satisfies("system=laptop").unwrap());
    }

    #[test]
    fn empty_spec_is_vacuous() {
        let img = image("gcc", "12.3");
        assert!(img.satisfies("").unwrap());
    }

    #[test]
    fn apply_constraint_reports_new_dependency() {
        let mut img = image("app", "1");
        img.system = "frontier".to_string();
        let m = img
            .apply_constraint("system=frontier", &ConstraintKind::Dependency, "rocm")
            .unwrap();
        assert!(m.dependency_added());
        let m2 = img
            .apply_constraint("system=frontier", &ConstraintKind::Dependency, "rocm")
            .unwrap();
        assert!(!m2.dependency_added());
    }

    #[test]
    fn hash_is_deterministic_and_sensitive_to_mutation() {
        let img = image("gcc", "12.3");
        let clone = img.clone();
        assert_eq!(img.hash(), clone.hash());

        let mut mutated = img.clone();
        mutated.variables.insert("x".to_string(), "y".to_string());
        assert_ne!(img.hash(), mutated.hash());
    }
}
