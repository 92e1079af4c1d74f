use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("invalid image version '{version}' for image '{name}'"))]
    InvalidImageVersion {
        name: String,
        version: String,
        source: velocity_version::Error,
    },

    #[snafu(display("unknown clause in spec '{spec}'"))]
    UnknownSpecClause { spec: String },

    #[snafu(display("catalog path '{}' is not a directory", path.display()))]
    NotADirectory { path: std::path::PathBuf },

    #[snafu(display("missing specs.yaml in catalog entry '{}'", path.display()))]
    MissingSpecsFile { path: std::path::PathBuf },

    #[snafu(display("failed to read '{}'", path.display()))]
    ReadCatalogFile {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed to parse catalog file '{}'", path.display()))]
    ParseCatalogFile {
        path: std::path::PathBuf,
        source: serde_yaml::Error,
    },

    #[snafu(display("dependency '{dep}' of image '{image}' cannot be found"))]
    CannotFindDependency { image: String, dep: String },

    #[snafu(display("edge {from} -> {to} would violate the graph's acyclicity: cycle {cycle:?}"))]
    EdgeViolatesDag {
        from: String,
        to: String,
        cycle: Vec<String>,
    },

    #[snafu(display("no available build satisfies target(s): {targets:?}"))]
    NoAvailableBuild { targets: Vec<String> },

    #[snafu(display("invalid target spec '{spec}'"))]
    InvalidTargetSpec { spec: String },

    #[snafu(display("invalid config identifier '{id}': must be alphanumeric/underscore"))]
    InvalidConfigIdentifier { id: String },

    #[snafu(display("invalid CLI argument format '{arg}': expected '{expected}'"))]
    InvalidCliArgumentFormat { arg: String, expected: String },

    #[snafu(display("failed to read config file '{}'", path.display()))]
    ReadConfigFile {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed to parse config file '{}'", path.display()))]
    ParseConfigFile {
        path: std::path::PathBuf,
        source: serde_yaml::Error,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
