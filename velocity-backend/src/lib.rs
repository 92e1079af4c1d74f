//! Container build backends: render a template into a build script, emit the command that
//! builds it, and query whether an image tag already exists.

mod apptainer;
mod docker;
mod error;
mod openshift;

pub use error::{Error, Result};

use apptainer::ApptainerBackend;
use docker::DockerBackend;
use openshift::OpenShiftBackend;
use std::collections::HashMap;
use std::fmt::Debug;
use std::path::Path;
use velocity_template::Template;

/// Polymorphic over rendering a template, emitting its build command, formatting an image
/// name, and checking/mutating tag existence. Variants: Apptainer, Docker, Podman (= Docker),
/// Singularity (= Apptainer), OpenShift.
pub trait Backend: Debug {
    fn name(&self) -> &str;

    /// Render a parsed template into this backend's build-script syntax.
    fn render(&self, template: &Template) -> Result<String>;

    /// The shell command that builds `script` into an image tagged `tag`.
    fn generate_build_cmd(&self, script: &Path, tag: &str, args: &HashMap<String, String>) -> String;

    fn format_image_name(&self, path: &Path, tag: &str) -> String;

    /// Whether an image tag already exists. Cached per backend instance: populated lazily,
    /// never invalidated within a run.
    fn build_exists(&self, name: &str) -> Result<bool>;

    fn tag_final_layer_cmd(&self, source: &str, dest: &str) -> String;

    fn remove_intermediate_tag_cmd(&self, name: &str) -> String;

    /// The `__threads__` value injected into templates. Defaults to the host's CPU count;
    /// backends with their own resource limits (OpenShift) clamp it instead.
    fn thread_count(&self) -> u64 {
        num_cpus::get() as u64
    }
}

/// Construct the backend named by `velocity:backend` (or an explicit `--backend` override).
pub fn from_name(name: &str) -> Result<Box<dyn Backend>> {
    match name {
        "docker" => Ok(Box::new(DockerBackend::new("docker")?)),
        "podman" => Ok(Box::new(DockerBackend::new("podman")?)),
        "apptainer" => Ok(Box::new(ApptainerBackend::new("apptainer")?)),
        "singularity" => Ok(Box::new(ApptainerBackend::new("singularity")?)),
        "openshift" => Ok(Box::new(OpenShiftBackend::new(1000, "2Gi")?)),
        other => error::BackendNotSupportedSnafu { name: other.to_string() }.fail(),
    }
}

/// Construct the OpenShift backend with explicit resource limits, as surfaced by
/// `VELOCITY_OPENSHIFT_CPU_LIMIT`/`VELOCITY_OPENSHIFT_MEMORY_LIMIT`.
pub fn openshift_with_limits(cpu_limit_millicores: u64, memory_limit: impl Into<String>) -> Result<Box<dyn Backend>> {
    Ok(Box::new(OpenShiftBackend::new(cpu_limit_millicores, memory_limit)?))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn unsupported_name_is_rejected() {
        let err = from_name("vmware").unwrap_err();
        assert!(err.to_string().contains("not supported"));
    }
}
