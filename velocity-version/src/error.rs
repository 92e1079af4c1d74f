use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("invalid version '{input}': expected `M[.m[.p]][-suffix]`"))]
    InvalidVersion { input: String },

    #[snafu(display("invalid version suffix '{suffix}' in '{input}': must be alphanumeric"))]
    InvalidSuffix { input: String, suffix: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
