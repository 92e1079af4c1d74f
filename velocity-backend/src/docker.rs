use crate::error::{self, Result};
use crate::Backend;
use snafu::ResultExt;
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;
use velocity_template::{RunStep, Template};

/// Renders Dockerfiles and shells out to `docker`/`podman`. Podman is the same
/// implementation under a different program name.
#[derive(Debug)]
pub struct DockerBackend {
    program: String,
    exists_cache: RefCell<HashMap<String, bool>>,
}

impl DockerBackend {
    pub fn new(program: impl Into<String>) -> Result<Self> {
        let program = program.into();
        which::which(&program).map_err(|e| {
            error::BackendNotAvailableSnafu {
                name: program.clone(),
                reason: e.to_string(),
            }
            .build()
        })?;
        Ok(Self { program, exists_cache: RefCell::new(HashMap::new()) })
    }
}

impl Backend for DockerBackend {
    fn name(&self) -> &str {
        &self.program
    }

    fn render(&self, template: &Template) -> Result<String> {
        let mut lines = vec![format!("FROM {}", template.from)];

        if !template.arguments.is_empty() {
            lines.push(String::new());
            for arg in &template.arguments {
                lines.push(format!("ARG {arg}"));
            }
        }

        if !template.copies.is_empty() {
            lines.push(String::new());
            for (src, dest) in &template.copies {
                lines.push(substitute_arguments(&format!("COPY {src} {dest}"), template));
            }
        }

        if !template.run.is_empty() {
            lines.push(String::new());
            let commands: Vec<String> = template
                .run
                .iter()
                .map(|step| match step {
                    RunStep::Command(c) => substitute_arguments(c, template),
                    RunStep::EnvVar { name, value } => format!(r#"export {name}="{value}""#),
                })
                .collect();
            for (i, cmd) in commands.iter().enumerate() {
                let prefix = if i == 0 { "RUN " } else { "    " };
                let suffix = if i + 1 < commands.len() && !cmd.ends_with('\\') { " && \\" } else { "" };
                lines.push(format!("{prefix}{cmd}{suffix}"));
            }
        }

        push_directive(&mut lines, "ENV", &template.env);
        push_directive(&mut lines, "LABEL", &template.label);

        if !template.entry.is_empty() {
            lines.push(String::new());
            let quoted: Vec<String> = template.entry.iter().map(|t| format!("\"{t}\"")).collect();
            lines.push(format!("ENTRYPOINT [{}]", quoted.join(", ")));
        }

        lines.push(String::new());
        Ok(lines.join("\n"))
    }

    fn generate_build_cmd(&self, script: &Path, tag: &str, args: &HashMap<String, String>) -> String {
        let arg_flags: String = args
            .iter()
            .map(|(k, v)| format!(" --build-arg {k}={v}"))
            .collect();
        format!("{} build -f {}{arg_flags} -t {tag} .", self.program, script.display())
    }

    fn format_image_name(&self, _path: &Path, tag: &str) -> String {
        let tag = if tag.contains('/') { tag.to_string() } else { format!("localhost/{tag}") };
        if tag.contains(':') {
            tag
        } else {
            format!("{tag}:latest")
        }
    }

    fn build_exists(&self, name: &str) -> Result<bool> {
        if let Some(&cached) = self.exists_cache.borrow().get(name) {
            return Ok(cached);
        }
        let args = ["image", "ls", "--format", "{{.Repository}}:{{.Tag}}"];
        let output = duct::cmd(&self.program, args)
            .stdout_capture()
            .unchecked()
            .run()
            .context(error::RunCommandSnafu { program: self.program.clone() })?;
        let listing = String::from_utf8_lossy(&output.stdout);
        let found = listing.lines().any(|line| line.trim() == name);
        self.exists_cache.borrow_mut().insert(name.to_string(), found);
        Ok(found)
    }

    fn tag_final_layer_cmd(&self, source: &str, dest: &str) -> String {
        format!("{} tag {source} {dest}", self.program)
    }

    fn remove_intermediate_tag_cmd(&self, name: &str) -> String {
        format!("{} untag {name}", self.program)
    }
}

fn substitute_arguments(text: &str, template: &Template) -> String {
    let mut out = text.to_string();
    for arg in &template.arguments {
        out = out.replace(&format!("@@{arg}@@"), &format!("${arg}"));
        out = out.replace(&format!("@@ {arg} @@"), &format!("${arg}"));
    }
    out
}

fn push_directive(lines: &mut Vec<String>, keyword: &str, pairs: &[(String, String)]) {
    if pairs.is_empty() {
        return;
    }
    lines.push(String::new());
    for (i, (k, v)) in pairs.iter().enumerate() {
        let prefix = if i == 0 { format!("{keyword} ") } else { "    ".to_string() };
        let suffix = if i + 1 < pairs.len() { " \\" } else { "" };
        lines.push(format!(r#"{prefix}{k}="{v}"{suffix}"#));
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn backend() -> DockerBackend {
        DockerBackend { program: "docker".to_string(), exists_cache: RefCell::new(HashMap::new()) }
    }

    #[test]
    fn renders_from_and_run_lines() {
        let mut template = Template { from: "alpine".to_string(), ..Template::default() };
        template.run.push(RunStep::Command("echo hi".to_string()));
        let dockerfile = backend().render(&template).unwrap();
        assert!(dockerfile.contains("FROM alpine"));
        assert!(dockerfile.contains("RUN echo hi"));
    }

    #[test]
    fn envar_sugar_becomes_export_line() {
        let mut template = Template { from: "alpine".to_string(), ..Template::default() };
        template.run.push(RunStep::EnvVar { name: "FOO".to_string(), value: "bar".to_string() });
        let dockerfile = backend().render(&template).unwrap();
        assert!(dockerfile.contains(r#"export FOO="bar""#));
    }

    #[test]
    fn build_cmd_includes_build_args() {
        let mut args = HashMap::new();
        args.insert("FLAG".to_string(), "1".to_string());
        let cmd = backend().generate_build_cmd(Path::new("build.script"), "app-1-abc", &args);
        assert!(cmd.contains("--build-arg FLAG=1"));
        assert!(cmd.contains("-t app-1-abc"));
    }

    #[test]
    fn format_image_name_adds_localhost_and_latest() {
        assert_eq!(backend().format_image_name(Path::new("."), "app"), "localhost/app:latest");
        assert_eq!(backend().format_image_name(Path::new("."), "app:1.0"), "localhost/app:1.0");
        assert_eq!(backend().format_image_name(Path::new("."), "registry.example/app"), "registry.example/app:latest");
    }
}
