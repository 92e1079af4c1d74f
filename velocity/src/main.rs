//! `anyhow` prints a nicely formatted error message with `Debug`, so we can return a result
//! from `main`.
use anyhow::{bail, Context, Result};
use clap::Parser;
use log::info;
use std::path::PathBuf;

mod args_parse;
mod builder;
mod cli;

use builder::{BuildOptions, Builder};
use cli::{init_logger, Args, Subcommand_};
use velocity_core::{Config, ConstraintStore, Facets, ImageRepo, RecipePlanner, Target};

fn main() -> Result<()> {
    let args = Args::parse();
    init_logger(args.log_level);

    let config = load_config(&args)?;
    let facets = Facets {
        system: config.get_quiet("velocity:system").unwrap_or_else(|| std::env::consts::ARCH.to_string()),
        backend: config.get_quiet("velocity:backend").unwrap_or_else(|| "apptainer".to_string()),
        distro: config.get_quiet("velocity:distro").unwrap_or_else(|| "ubuntu".to_string()),
    };

    let image_path = config
        .get_quiet("velocity:image_path")
        .context("no image catalog configured: set VELOCITY_IMAGE_PATH or velocity:image_path")?;

    let (images, store) = load_catalog(&image_path, &facets)?;

    match args.subcommand {
        Subcommand_::Avail(avail) => run_avail(&images, &avail.targets),
        Subcommand_::Spec(spec) => run_spec(&images, &store, &spec.targets),
        Subcommand_::Build(build) => run_build(&config, &images, &store, &facets, build),
    }
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = Config::with_defaults().context("failed to seed default configuration")?;

    if let Ok(dir) = std::env::var("VELOCITY_CONFIG_DIR") {
        config
            .apply_yaml_file(&PathBuf::from(dir).join("config.yaml"))
            .context("failed to load config.yaml")?;
    }

    config.apply_environment().context("failed to overlay environment variables")?;

    if let Some(backend) = &args.backend {
        config.set("velocity:backend", backend.clone())?;
    }
    if let Some(system) = &args.system {
        config.set("velocity:system", system.clone())?;
    }
    if let Some(distro) = &args.distro {
        config.set("velocity:distro", distro.clone())?;
    }

    Ok(config)
}

/// Directories earlier in `VELOCITY_IMAGE_PATH` win: an image name already claimed by a prior
/// directory is skipped (with its constraints) rather than overridden.
fn load_catalog(image_path: &str, facets: &Facets) -> Result<(Vec<velocity_core::Image>, ConstraintStore)> {
    let mut images = Vec::new();
    let mut store = ConstraintStore::new();
    let mut seen_names = std::collections::HashSet::new();

    for dir in image_path.split(':').filter(|s| !s.is_empty()) {
        let (dir_images, dir_store) = ImageRepo::import_from_dir(std::path::Path::new(dir), facets)
            .with_context(|| format!("failed to load catalog directory '{dir}'"))?;

        let mut dir_names = std::collections::HashSet::new();
        for image in dir_images {
            if seen_names.contains(&image.name) {
                log::warn!("duplicate image name '{}' in catalog directory '{dir}', skipping", image.name);
                continue;
            }
            dir_names.insert(image.name.clone());
            images.push(image);
        }

        store.extend(dir_store.iter().filter(|c| !seen_names.contains(&c.image_name)).cloned());
        seen_names.extend(dir_names);
    }

    Ok((images, store))
}

fn run_avail(images: &[velocity_core::Image], targets: &[String]) -> Result<()> {
    let mut grouped: std::collections::BTreeMap<&str, Vec<&velocity_core::Image>> = std::collections::BTreeMap::new();
    for image in images {
        if !targets.is_empty() && !targets.iter().any(|t| t == &image.name) {
            continue;
        }
        grouped.entry(&image.name).or_default().push(image);
    }

    for (name, mut versions) in grouped {
        println!("{name}");
        versions.sort_by(|a, b| a.version.to_string().cmp(&b.version.to_string()));
        for image in versions {
            println!("  {}", image.version);
        }
    }
    Ok(())
}

fn run_spec(images: &[velocity_core::Image], store: &ConstraintStore, raw_targets: &[String]) -> Result<()> {
    let targets: Vec<Target> = raw_targets
        .iter()
        .map(|t| Target::parse(t))
        .collect::<velocity_core::Result<_>>()
        .context("invalid target spec")?;

    let (recipe, _) = RecipePlanner::create_build_recipe(images, store, &targets).context("planning failed")?;

    // Recipe validity guarantees each name appears at most once, so dependency names look
    // themselves up directly in the tuple rather than through the (now stale, since planning
    // mutates underlay/template-hash after building it) pre-final-pass graph.
    let target_names: std::collections::HashSet<&str> = targets.iter().map(|t| t.name.as_str()).collect();
    for image in &recipe {
        if !target_names.contains(image.name.as_str()) {
            continue;
        }
        println!("> {}@{}", image.name, image.version);
        print_dependency_tree(image, 1, &recipe);
    }
    Ok(())
}

fn print_dependency_tree(image: &velocity_core::Image, indent: usize, recipe: &[velocity_core::Image]) {
    for dep_name in &image.dependencies {
        let Some(dep) = recipe.iter().find(|r| &r.name == dep_name) else { continue };
        println!("{}^{}@{}", "   ".repeat(indent), dep.name, dep.version);
        print_dependency_tree(dep, indent + 1, recipe);
    }
}

fn run_build(
    config: &Config,
    images: &[velocity_core::Image],
    store: &ConstraintStore,
    facets: &Facets,
    build: cli::Build,
) -> Result<()> {
    let targets: Vec<Target> = build
        .targets
        .iter()
        .map(|t| Target::parse(t))
        .collect::<velocity_core::Result<_>>()
        .context("invalid target spec")?;
    if targets.is_empty() {
        bail!("build requires at least one target");
    }

    let mut store = store.clone();
    for raw in &build.vars {
        store.push(args_parse::parse_var_constraint(raw)?);
    }

    let build_args = match &build.args {
        Some(raw) => args_parse::parse_build_args(raw)?,
        None => std::collections::HashMap::new(),
    };

    let (recipe, _) = RecipePlanner::create_build_recipe(images, &store, &targets).context("planning failed")?;

    info!("build order:");
    for image in &recipe {
        info!("  {}@{}", image.name, image.version);
    }

    let backend = resolve_backend(config, facets)?;

    let build_dir = config
        .get_quiet("velocity:build_dir")
        .map(PathBuf::from)
        .unwrap_or_else(|| std::env::temp_dir().join("velocity-build"));

    let options = BuildOptions {
        name: build.name,
        dry_run: build.dry_run,
        leave_tags: build.leave_tags,
        verbose: build.verbose,
        color: build.color,
        build_dir,
        build_args,
    };

    Builder::new(backend.as_ref(), options).build(&recipe)
}

fn resolve_backend(config: &Config, facets: &Facets) -> Result<Box<dyn velocity_backend::Backend>> {
    if facets.backend == "openshift" {
        let cpu = config
            .get_quiet("velocity:openshift_cpu_limit")
            .and_then(|s| s.parse().ok())
            .unwrap_or(1000);
        let memory = config.get_quiet("velocity:openshift_memory_limit").unwrap_or_else(|| "2Gi".to_string());
        return velocity_backend::openshift_with_limits(cpu, memory).context("failed to construct openshift backend");
    }
    velocity_backend::from_name(&facets.backend).context("failed to construct backend")
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn facets() -> Facets {
        Facets {
            system: "x86_64".to_string(),
            backend: "apptainer".to_string(),
            distro: "ubuntu".to_string(),
        }
    }

    fn write_image(dir: &std::path::Path, name: &str, version: &str) {
        let image_dir = dir.join(name);
        fs::create_dir(&image_dir).unwrap();
        fs::write(image_dir.join("specs.yaml"), format!("versions:\n  - spec: \"{version}\"\n")).unwrap();
    }

    #[test]
    fn earlier_directory_wins_on_duplicate_name() {
        let first = TempDir::new().unwrap();
        let second = TempDir::new().unwrap();
        write_image(first.path(), "gcc", "12.3");
        write_image(second.path(), "gcc", "11.2");
        write_image(second.path(), "make", "4.3");

        let image_path = format!("{}:{}", first.path().display(), second.path().display());
        let (images, _) = load_catalog(&image_path, &facets()).unwrap();

        assert!(images.iter().any(|i| i.name == "gcc" && i.version.to_string() == "12.3"));
        assert!(!images.iter().any(|i| i.name == "gcc" && i.version.to_string() == "11.2"));
        assert!(images.iter().any(|i| i.name == "make"));
    }
}
