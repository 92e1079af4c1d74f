use crate::constraint::{Constraint, ConstraintStore, Scope};
use crate::error::{self, Result};
use crate::image::{ConstraintKind, Image};
use serde::Deserialize;
use snafu::{ensure, ResultExt};
use std::fs;
use std::path::Path;
use velocity_version::Version;

/// Default facet values seeded onto every candidate image before its `versions[].when`
/// clause (if any) is evaluated.
#[derive(Debug, Clone)]
pub struct Facets {
    pub system: String,
    pub backend: String,
    pub distro: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn into_vec(self) -> Vec<String> {
        match self {
            OneOrMany::One(s) => vec![s],
            OneOrMany::Many(v) => v,
        }
    }
}

#[derive(Debug, Deserialize)]
struct VersionEntry {
    spec: OneOrMany,
    #[serde(default)]
    when: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DependencyEntry {
    spec: OneOrMany,
    #[serde(default)]
    when: Option<String>,
    #[serde(default)]
    scope: Scope,
}

#[derive(Debug, Deserialize)]
struct TemplateEntry {
    name: OneOrMany,
    #[serde(default)]
    when: Option<String>,
    #[serde(default)]
    scope: Scope,
}

#[derive(Debug, Deserialize)]
struct ArgumentEntry {
    name: OneOrMany,
    #[serde(default)]
    when: Option<String>,
    #[serde(default)]
    scope: Scope,
}

#[derive(Debug, Deserialize)]
struct VariableEntry {
    name: String,
    value: OneOrMany,
    #[serde(default)]
    when: Option<String>,
    #[serde(default)]
    scope: Scope,
}

#[derive(Debug, Deserialize)]
struct FileEntry {
    name: OneOrMany,
    #[serde(default)]
    when: Option<String>,
    #[serde(default)]
    scope: Scope,
}

#[derive(Debug, Deserialize)]
struct PrologEntry {
    script: OneOrMany,
    #[serde(default)]
    when: Option<String>,
    #[serde(default)]
    scope: Scope,
}

#[derive(Debug, Deserialize, Default)]
struct SpecsFile {
    versions: Vec<VersionEntry>,
    #[serde(default)]
    dependencies: Vec<DependencyEntry>,
    #[serde(default)]
    templates: Vec<TemplateEntry>,
    #[serde(default)]
    arguments: Vec<ArgumentEntry>,
    #[serde(default)]
    variables: Vec<VariableEntry>,
    #[serde(default)]
    files: Vec<FileEntry>,
    #[serde(default)]
    prologs: Vec<PrologEntry>,
}

/// Loads a catalog directory into an immutable set of images plus the constraints declared
/// alongside them. Built once at startup; the repo itself never mutates afterward.
pub struct ImageRepo;

impl ImageRepo {
    /// Scan each immediate, non-dotfile subdirectory of `path` for a `specs.yaml`, building
    /// the full `Image` set and `ConstraintStore` for the catalog.
    pub fn import_from_dir(path: &Path, defaults: &Facets) -> Result<(Vec<Image>, ConstraintStore)> {
        ensure!(path.is_dir(), error::NotADirectorySnafu { path });

        let mut images = Vec::new();
        let mut store = ConstraintStore::new();

        let mut entries: Vec<_> = fs::read_dir(path)
            .context(error::ReadCatalogFileSnafu { path })?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context(error::ReadCatalogFileSnafu { path })?;
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let entry_path = entry.path();
            if !entry_path.is_dir() {
                continue;
            }
            let file_name = entry_path
                .file_name()
                .expect("directory entry always has a file name")
                .to_string_lossy()
                .into_owned();
            if file_name.starts_with('.') {
                continue;
            }

            Self::import_entry(&entry_path, &file_name, defaults, &mut images, &mut store)?;
        }

        Ok((images, store))
    }

    fn import_entry(
        entry_path: &Path,
        name: &str,
        defaults: &Facets,
        images: &mut Vec<Image>,
        store: &mut ConstraintStore,
    ) -> Result<()> {
        let specs_path = entry_path.join("specs.yaml");
        ensure!(
            specs_path.is_file(),
            error::MissingSpecsFileSnafu { path: entry_path.to_path_buf() }
        );

        let contents = fs::read_to_string(&specs_path)
            .context(error::ReadCatalogFileSnafu { path: specs_path.clone() })?;
        let specs: SpecsFile = serde_yaml::from_str(&contents)
            .context(error::ParseCatalogFileSnafu { path: specs_path.clone() })?;

        for version_entry in &specs.versions {
            for raw_version in version_entry.spec.clone().into_vec() {
                let version = Version::parse(&raw_version).context(error::InvalidImageVersionSnafu {
                    name: name.to_string(),
                    version: raw_version.clone(),
                })?;
                let mut image = Image::new(name, version, entry_path.to_path_buf());
                image.system = defaults.system.clone();
                image.backend = defaults.backend.clone();
                image.distro = defaults.distro.clone();

                if let Some(when) = &version_entry.when {
                    if !image.satisfies(when)? {
                        continue;
                    }
                }
                images.push(image);
            }
        }

        for d in &specs.dependencies {
            for spec in d.spec.clone().into_vec() {
                store.push(Constraint::new(
                    name,
                    d.when.clone().unwrap_or_default(),
                    ConstraintKind::Dependency,
                    spec,
                    d.scope,
                ));
            }
        }
        for t in &specs.templates {
            for value in t.name.clone().into_vec() {
                store.push(Constraint::new(
                    name,
                    t.when.clone().unwrap_or_default(),
                    ConstraintKind::Template,
                    value,
                    t.scope,
                ));
            }
        }
        for a in &specs.arguments {
            for value in a.name.clone().into_vec() {
                store.push(Constraint::new(
                    name,
                    a.when.clone().unwrap_or_default(),
                    ConstraintKind::Argument,
                    value,
                    a.scope,
                ));
            }
        }
        for var in &specs.variables {
            for value in var.value.clone().into_vec() {
                store.push(Constraint::new(
                    name,
                    var.when.clone().unwrap_or_default(),
                    ConstraintKind::Variable,
                    format!("{}={}", var.name, value),
                    var.scope,
                ));
            }
        }
        for f in &specs.files {
            for value in f.name.clone().into_vec() {
                store.push(Constraint::new(
                    name,
                    f.when.clone().unwrap_or_default(),
                    ConstraintKind::File,
                    value,
                    f.scope,
                ));
            }
        }
        for p in &specs.prologs {
            for value in p.script.clone().into_vec() {
                store.push(Constraint::new(
                    name,
                    p.when.clone().unwrap_or_default(),
                    ConstraintKind::Prolog,
                    value,
                    p.scope,
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn defaults() -> Facets {
        Facets {
            system: "x86_64".to_string(),
            backend: "apptainer".to_string(),
            distro: "ubuntu".to_string(),
        }
    }

    #[test]
    fn loads_versions_and_constraints() {
        let dir = TempDir::new().unwrap();
        let gcc = dir.path().join("gcc");
        fs::create_dir(&gcc).unwrap();
        fs::write(
            gcc.join("specs.yaml"),
            r#"
versions:
  - spec: ["11.2", "12.3"]
dependencies:
  - spec: ubuntu
"#,
        )
        .unwrap();

        let (images, store) = ImageRepo::import_from_dir(dir.path(), &defaults()).unwrap();
        assert_eq!(images.len(), 2);
        assert_eq!(store.iter().count(), 1);
    }

    #[test]
    fn version_when_clause_filters_candidates() {
        let dir = TempDir::new().unwrap();
        let app = dir.path().join("app");
        fs::create_dir(&app).unwrap();
        fs::write(
            app.join("specs.yaml"),
            r#"
versions:
  - spec: "1.0"
    when: "distro=rhel"
"#,
        )
        .unwrap();

        let (images, _) = ImageRepo::import_from_dir(dir.path(), &defaults()).unwrap();
        assert!(images.is_empty());
    }

    #[test]
    fn skips_dotfiles_and_requires_specs_yaml() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join(".hidden")).unwrap();
        let broken = dir.path().join("broken");
        fs::create_dir(&broken).unwrap();

        let result = ImageRepo::import_from_dir(dir.path(), &defaults());
        assert!(result.is_err());
    }
}
