use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("backend '{name}' is not supported"))]
    BackendNotSupported { name: String },

    #[snafu(display("backend '{name}' is not available on this host: {reason}"))]
    BackendNotAvailable { name: String, reason: String },

    #[snafu(display("failed to run '{program}': {source}"))]
    RunCommand { program: String, source: std::io::Error },

    #[snafu(display("unrecognized '@from' image reference '{reference}'"))]
    UnknownFromReference { reference: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
