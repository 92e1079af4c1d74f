use clap::{Parser, Subcommand};
use log::LevelFilter;

const DEFAULT_LEVEL_FILTER: LevelFilter = LevelFilter::Info;

/// Build tool for container images, driven by a versioned catalog of recipes.
#[derive(Debug, Parser)]
#[clap(about, long_about = None, version)]
pub(crate) struct Args {
    /// Backend to build with: apptainer, singularity, docker, podman, openshift.
    #[clap(short = 'b', long, env = "VELOCITY_BACKEND")]
    pub(crate) backend: Option<String>,

    /// Target system/architecture facet, e.g. x86_64 or frontier.
    #[clap(short = 's', long, env = "VELOCITY_SYSTEM")]
    pub(crate) system: Option<String>,

    /// Distro facet used to select templates, e.g. ubuntu or rhel.
    #[clap(short = 'd', long = "distro", env = "VELOCITY_DISTRO")]
    pub(crate) distro: Option<String>,

    #[clap(short = 'L', long = "log-level", env = "VELOCITY_LOGGING_LEVEL")]
    pub(crate) log_level: Option<LevelFilter>,

    #[clap(subcommand)]
    pub(crate) subcommand: Subcommand_,
}

#[derive(Debug, Subcommand)]
pub(crate) enum Subcommand_ {
    /// Plan and build the given targets.
    Build(Build),
    /// List every image name and the versions available for it.
    Avail(Avail),
    /// Print the resolved dependency tree for the given targets without building.
    Spec(Spec),
}

#[derive(Debug, Parser)]
pub(crate) struct Build {
    /// Build targets, e.g. `gcc`, `gcc@12.3`, `gcc@11.5:`, `gcc@:11.5`.
    pub(crate) targets: Vec<String>,

    /// Name of the final, tagged image. Defaults to the last stage's own tag.
    #[clap(short = 'n', long)]
    pub(crate) name: Option<String>,

    /// Plan and print the recipe without running any build commands.
    #[clap(short = 'd', long = "dry-run")]
    pub(crate) dry_run: bool,

    /// Do not clean up intermediate build tags after the final stage completes.
    #[clap(short = 'l', long = "leave-tags")]
    pub(crate) leave_tags: bool,

    /// Stream each stage's build output to the terminal as it runs.
    #[clap(short = 'v', long)]
    pub(crate) verbose: bool,

    /// Colorize terminal output.
    #[clap(short = 'c', long)]
    pub(crate) color: bool,

    /// Build-argument overrides, `key:value` pairs separated by `;`.
    #[clap(short = 'A', long = "args")]
    pub(crate) args: Option<String>,

    /// Variable overrides, `name:NAME;value:VALUE` separated by `;`, repeatable.
    #[clap(short = 'V', long = "vars", action = clap::ArgAction::Append)]
    pub(crate) vars: Vec<String>,
}

#[derive(Debug, Parser)]
pub(crate) struct Avail {
    /// Restrict listing to these image names; lists the whole catalog if empty.
    pub(crate) targets: Vec<String>,
}

#[derive(Debug, Parser)]
pub(crate) struct Spec {
    /// Targets to resolve and print the dependency tree for.
    pub(crate) targets: Vec<String>,
}

pub(crate) fn init_logger(level: Option<LevelFilter>) {
    match (std::env::var(env_logger::DEFAULT_FILTER_ENV).ok(), level) {
        (Some(_), None) => {
            env_logger::Builder::from_default_env().init();
        }
        _ => {
            env_logger::Builder::new()
                .filter(Some(env!("CARGO_CRATE_NAME")), level.unwrap_or(DEFAULT_LEVEL_FILTER))
                .init();
        }
    }
}
