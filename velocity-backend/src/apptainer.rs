use crate::error::{self, Result};
use crate::Backend;
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;
use velocity_template::{RunStep, Template};

/// Renders Apptainer/Singularity definition files. Singularity is the same implementation
/// under a different program name.
#[derive(Debug)]
pub struct ApptainerBackend {
    program: String,
    exists_cache: RefCell<HashMap<String, bool>>,
}

impl ApptainerBackend {
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

    fn classify_from(&self, reference: &str) -> Result<(&'static str, String)> {
        if let Some(rest) = reference.strip_prefix("localimage://") {
            return Ok(("localimage", rest.to_string()));
        }
        if let Some(rest) = reference.strip_prefix("docker://") {
            return Ok(("docker", rest.to_string()));
        }
        if let Some(rest) = reference.strip_prefix("oras://") {
            return Ok(("oras", rest.to_string()));
        }
        if reference.ends_with(".sif") {
            return Ok(("localimage", reference.to_string()));
        }
        if reference.contains(':') {
            return Ok(("docker", reference.to_string()));
        }
        error::UnknownFromReferenceSnafu { reference: reference.to_string() }.fail()
    }
}

impl Backend for ApptainerBackend {
    fn name(&self) -> &str {
        &self.program
    }

    fn render(&self, template: &Template) -> Result<String> {
        let (bootstrap, from) = self.classify_from(&template.from)?;
        let mut lines = vec![format!("Bootstrap: {bootstrap}"), format!("From: {from}")];

        if !template.pre.is_empty() {
            lines.push(String::new());
            lines.extend(template.pre.iter().cloned());
        }

        if !template.copies.is_empty() {
            lines.push(String::new());
            lines.push("%files".to_string());
            for (src, dest) in &template.copies {
                lines.push(format!("    {}", substitute_arguments(&format!("{src} {dest}"))));
            }
        }

        if !template.run.is_empty() {
            lines.push(String::new());
            lines.push("%post".to_string());
            for step in &template.run {
                let cmd = match step {
                    RunStep::Command(c) => substitute_arguments(c),
                    RunStep::EnvVar { name, value } => format!(r#"export {name}="{value}""#),
                };
                lines.push(format!("    {cmd}"));
            }
        }

        if !template.env.is_empty() {
            lines.push(String::new());
            lines.push("%environment".to_string());
            for (k, v) in &template.env {
                lines.push(format!(r#"    export {k}="{v}""#));
            }
        }

        if !template.label.is_empty() {
            lines.push(String::new());
            lines.push("%labels".to_string());
            for (k, v) in &template.label {
                lines.push(format!("    {k} {v}"));
            }
        }

        if !template.entry.is_empty() {
            lines.push(String::new());
            lines.push("%runscript".to_string());
            lines.push(format!("    {}", template.entry.join(" ")));
        }

        if !template.post.is_empty() {
            lines.push(String::new());
            lines.extend(template.post.iter().cloned());
        }

        lines.push(String::new());
        Ok(lines.join("\n"))
    }

    fn generate_build_cmd(&self, script: &Path, tag: &str, args: &HashMap<String, String>) -> String {
        let arg_flags: String = args
            .iter()
            .map(|(k, v)| format!(" --build-arg {k}={v}"))
            .collect();
        format!("{} build{arg_flags} {tag} {};", self.program, script.display())
    }

    fn format_image_name(&self, path: &Path, tag: &str) -> String {
        let tag = if tag.ends_with(".sif") { tag.to_string() } else { format!("{tag}.sif") };
        path.join(tag).display().to_string()
    }

    fn build_exists(&self, name: &str) -> Result<bool> {
        if let Some(&cached) = self.exists_cache.borrow().get(name) {
            return Ok(cached);
        }
        let found = Path::new(name).is_file();
        self.exists_cache.borrow_mut().insert(name.to_string(), found);
        Ok(found)
    }

    fn tag_final_layer_cmd(&self, _source: &str, _dest: &str) -> String {
        "echo".to_string()
    }

    fn remove_intermediate_tag_cmd(&self, _name: &str) -> String {
        "echo".to_string()
    }
}

fn substitute_arguments(text: &str) -> String {
    let mut out = text.to_string();
    while let Some(start) = out.find("@@") {
        let Some(rel_end) = out[start + 2..].find("@@") else { break };
        let end = start + 2 + rel_end;
        let name = out[start + 2..end].trim();
        out.replace_range(start..end + 2, &format!("{{{{ {name} }}}}"));
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;
    use velocity_template::Template;

    fn backend() -> ApptainerBackend {
        ApptainerBackend { program: "apptainer".to_string(), exists_cache: RefCell::new(HashMap::new()) }
    }

    #[test]
    fn classifies_from_references() {
        let b = backend();
        assert_eq!(b.classify_from("docker://ubuntu:22.04").unwrap().0, "docker");
        assert_eq!(b.classify_from("localimage://base.sif").unwrap().0, "localimage");
        assert_eq!(b.classify_from("base.sif").unwrap().0, "localimage");
        assert_eq!(b.classify_from("ubuntu:22.04").unwrap().0, "docker");
        assert!(b.classify_from("ubuntu").is_err());
    }

    #[test]
    fn renders_bootstrap_and_post_section() {
        let mut template = Template { from: "docker://alpine".to_string(), ..Template::default() };
        template.run.push(RunStep::Command("echo hi".to_string()));
        let def = backend().render(&template).unwrap();
        assert!(def.contains("Bootstrap: docker"));
        assert!(def.contains("From: alpine"));
        assert!(def.contains("%post"));
        assert!(def.contains("echo hi"));
    }

    #[test]
    fn argument_placeholder_becomes_template_variable() {
        let mut template = Template { from: "docker://alpine".to_string(), ..Template::default() };
        template.run.push(RunStep::Command("echo @@ FLAG @@".to_string()));
        let def = backend().render(&template).unwrap();
        assert!(def.contains("echo {{ FLAG }}"));
    }

    #[test]
    fn format_image_name_appends_sif_extension() {
        let name = backend().format_image_name(Path::new("/build"), "app-1-abc");
        assert!(name.ends_with("app-1-abc.sif"));
    }
}
