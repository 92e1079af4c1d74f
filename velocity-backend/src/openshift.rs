use crate::docker::DockerBackend;
use crate::error::{self, Result};
use crate::Backend;
use snafu::ResultExt;
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;
use velocity_template::Template;

/// Builds by creating/updating a remote `BuildConfig` via `oc`, copying the rendered script
/// to a local `Dockerfile`, and launching the build with `oc start-build --wait -F`, which
/// blocks natively until the build finishes instead of polling build status in a loop.
#[derive(Debug)]
pub struct OpenShiftBackend {
    dockerfile: DockerBackend,
    cpu_limit_millicores: u64,
    memory_limit: String,
    exists_cache: RefCell<HashMap<String, bool>>,
}

impl OpenShiftBackend {
    pub fn new(cpu_limit_millicores: u64, memory_limit: impl Into<String>) -> Result<Self> {
        Ok(Self {
            dockerfile: DockerBackend::new("docker")?,
            cpu_limit_millicores,
            memory_limit: memory_limit.into(),
            exists_cache: RefCell::new(HashMap::new()),
        })
    }

    /// Image names are prefixed `v-` so a name starting with a digit doesn't break OpenShift's
    /// resource-name rules. Idempotent: a name already carrying the prefix (as produced by
    /// `format_image_name`) passes through unchanged, so callers may pass either a raw tag or
    /// an already-formatted name.
    fn resource_name(&self, name: &str) -> String {
        if name.starts_with("v-") {
            name.to_string()
        } else {
            format!("v-{name}")
        }
    }
}

impl Backend for OpenShiftBackend {
    fn name(&self) -> &str {
        "openshift"
    }

    fn render(&self, template: &Template) -> Result<String> {
        self.dockerfile.render(template)
    }

    fn generate_build_cmd(&self, script: &Path, tag: &str, args: &HashMap<String, String>) -> String {
        let name = self.resource_name(tag);
        let arg_flags: String = args
            .iter()
            .map(|(k, v)| format!(" --build-arg={k}={v}"))
            .collect();

        format!(
            "oc apply -f - <<< \"$(oc create buildconfig {name} --dockerfile=@{dockerfile} \
             --to={name} --dry-run=client -o yaml)\" && \
             oc set resources buildconfig/{name} --limits=cpu={cpu}m,memory={memory} && \
             oc start-build {name}{arg_flags} --wait -F",
            dockerfile = script.display(),
            cpu = self.cpu_limit_millicores,
            memory = self.memory_limit,
        )
    }

    fn format_image_name(&self, _path: &Path, tag: &str) -> String {
        let name = self.resource_name(tag);
        if name.contains(':') {
            name
        } else {
            format!("{name}:latest")
        }
    }

    fn build_exists(&self, name: &str) -> Result<bool> {
        let resource = self.resource_name(name);
        if let Some(&cached) = self.exists_cache.borrow().get(&resource) {
            return Ok(cached);
        }
        let output = duct::cmd("oc", ["get", "imagetags", resource.as_str()])
            .stdout_capture()
            .stderr_capture()
            .unchecked()
            .run()
            .context(error::RunCommandSnafu { program: "oc".to_string() })?;
        let found = output.status.success();
        self.exists_cache.borrow_mut().insert(resource, found);
        Ok(found)
    }

    fn tag_final_layer_cmd(&self, source: &str, dest: &str) -> String {
        format!("oc tag {source} {dest}")
    }

    fn remove_intermediate_tag_cmd(&self, name: &str) -> String {
        format!("oc delete imagetag {}", self.resource_name(name))
    }

    /// Clamped to the BuildConfig's CPU limit, minimum 1.
    fn thread_count(&self) -> u64 {
        (self.cpu_limit_millicores / 1000).max(1)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn thread_count_is_clamped_to_cpu_limit() {
        let Ok(backend) = OpenShiftBackend::new(2500, "4Gi") else {
            // docker binary unavailable in this environment; nothing to assert.
            return;
        };
        assert_eq!(backend.thread_count(), 2);
        assert_eq!(backend.resource_name("app"), "v-app");
        assert_eq!(backend.resource_name("v-app"), "v-app");
    }

    #[test]
    fn format_image_name_adds_prefix_and_latest() {
        let Ok(backend) = OpenShiftBackend::new(1000, "2Gi") else {
            return;
        };
        assert_eq!(backend.format_image_name(Path::new("."), "app-1-abc"), "v-app-1-abc:latest");
        assert_eq!(backend.format_image_name(Path::new("."), "app-1-abc:v2"), "v-app-1-abc:v2");
    }

    #[test]
    fn build_cmd_sets_resource_limits_and_waits() {
        let Ok(backend) = OpenShiftBackend::new(1000, "2Gi") else {
            return;
        };
        let name = backend.format_image_name(Path::new("."), "app-1-abc");
        let cmd = backend.generate_build_cmd(Path::new("build.script"), &name, &HashMap::new());
        assert!(cmd.contains("v-app-1-abc:latest"));
        assert!(cmd.contains("--limits=cpu=1000m,memory=2Gi"));
        assert!(cmd.contains("--wait -F"));
    }
}
