use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("template syntax error in '{}': {message}", path.display()))]
    TemplateSyntaxError { path: std::path::PathBuf, message: String },

    #[snafu(display("section '{header}' repeated in '{}'", path.display()))]
    RepeatedSection { path: std::path::PathBuf, header: String },

    #[snafu(display("line outside of any section in '{}': '{line}'", path.display()))]
    LineOutsideOfSection { path: std::path::PathBuf, line: String },

    #[snafu(display("failed to read template '{}'", path.display()))]
    ReadTemplate {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed to evaluate conditional in '{}': {source}", path.display()))]
    EvaluateConditional {
        path: std::path::PathBuf,
        source: velocity_core::Error,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
