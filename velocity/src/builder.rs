//! Drives a resolved recipe through template rendering and backend execution.
//!
//! `duct`'s single-capture invocation is fine for the short-lived queries in
//! `velocity-backend`, but a build's stdout/stderr need to stream to both a log file and (if
//! verbose) the terminal while the driver stays responsive, so this spawns
//! `std::process::Command` directly and drains each pipe on its own reader thread into a
//! shared channel.

use anyhow::{bail, Context, Result};
use colored::Colorize;
use log::{debug, info};
use std::collections::HashMap;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::thread;
use velocity_backend::Backend;
use velocity_core::Image;
use velocity_template::TemplateEngine;

pub(crate) struct BuildOptions {
    pub(crate) name: Option<String>,
    pub(crate) dry_run: bool,
    pub(crate) leave_tags: bool,
    pub(crate) verbose: bool,
    pub(crate) color: bool,
    pub(crate) build_dir: PathBuf,
    pub(crate) build_args: HashMap<String, String>,
}

pub(crate) struct Builder<'a> {
    backend: &'a dyn Backend,
    options: BuildOptions,
}

enum LogLine {
    Stdout(String),
    Stderr(String),
}

impl<'a> Builder<'a> {
    pub(crate) fn new(backend: &'a dyn Backend, options: BuildOptions) -> Self {
        Self { backend, options }
    }

    /// Build every stage of `recipe` in order, tag the final layer under `name` (or the last
    /// stage's own tag), and clean up intermediate tags unless `leave_tags` is set.
    pub(crate) fn build(&self, recipe: &[Image]) -> Result<()> {
        fs::create_dir_all(&self.options.build_dir)
            .with_context(|| format!("failed to create build dir '{}'", self.options.build_dir.display()))?;

        let mut previous_stage: Option<String> = None;
        let mut last_name = String::new();

        for (index, image) in recipe.iter().enumerate() {
            let tag = format!("{}-{}-{}", image.name, image.version, image.id());
            let stage_dir = self.options.build_dir.join(&tag);
            let name = self.backend.format_image_name(&stage_dir, &tag);
            last_name = name.clone();

            fs::create_dir_all(&stage_dir)
                .with_context(|| format!("failed to create stage dir '{}'", stage_dir.display()))?;

            self.copy_declared_files(image, &stage_dir)?;

            let variables = self.variable_map(recipe, index, &previous_stage);
            let script_path = self.render_stage(image, &stage_dir, &variables)?;
            let wrapper_path = self.write_wrapper(image, &stage_dir, &script_path, &variables, &name)?;

            let exists = self.backend.build_exists(&name)?;
            if !self.options.dry_run && !exists {
                info!("building stage '{name}'");
                let log_path = stage_dir.join("build.log");
                self.run_stage(&wrapper_path, &stage_dir, &log_path, &name)?;
            } else if exists {
                debug!("stage '{name}' already exists, skipping");
            } else {
                info!("dry run: would build stage '{name}'");
            }

            previous_stage = Some(name);
        }

        let final_name = self.options.name.clone().unwrap_or(last_name.clone());
        if !self.options.dry_run {
            let tag_cmd = self.backend.tag_final_layer_cmd(&last_name, &final_name);
            self.run_shell(&tag_cmd, &self.options.build_dir)?;

            if !self.options.leave_tags {
                for image in &recipe[..recipe.len().saturating_sub(1)] {
                    let tag = format!("{}-{}-{}", image.name, image.version, image.id());
                    let stage_dir = self.options.build_dir.join(&tag);
                    let name = self.backend.format_image_name(&stage_dir, &tag);
                    let cleanup_cmd = self.backend.remove_intermediate_tag_cmd(&name);
                    self.run_shell(&cleanup_cmd, &self.options.build_dir)?;
                }
            }
        }

        Ok(())
    }

    fn copy_declared_files(&self, image: &Image, stage_dir: &Path) -> Result<()> {
        for file_name in &image.files {
            let source = image.catalog_path.join("files").join(file_name);
            let dest = stage_dir.join(file_name);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(&source, &dest)
                .with_context(|| format!("failed to copy declared file '{}'", source.display()))?;
        }
        Ok(())
    }

    /// Injected variables available to every template, plus the image's own declared variables.
    fn variable_map(&self, recipe: &[Image], index: usize, previous_stage: &Option<String>) -> HashMap<String, String> {
        let image = &recipe[index];
        let mut vars: HashMap<String, String> = HashMap::new();

        vars.insert("__backend__".to_string(), self.backend.name().to_string());
        vars.insert("__backend_executable__".to_string(), self.backend.name().to_string());
        vars.insert("__arch__".to_string(), image.system.clone());
        vars.insert("__threads__".to_string(), self.backend.thread_count().to_string());
        vars.insert("__timestamp__".to_string(), chrono::Local::now().to_rfc3339());
        if let Some(base) = previous_stage {
            vars.insert("__base__".to_string(), base.clone());
        }
        vars.insert("__name__".to_string(), image.name.clone());
        vars.insert("__version__".to_string(), image.version.to_string());
        vars.insert("__version_major__".to_string(), image.version.major().to_string());
        vars.insert(
            "__version_minor__".to_string(),
            image.version.minor().map(|v| v.to_string()).unwrap_or_default(),
        );
        vars.insert(
            "__version_patch__".to_string(),
            image.version.patch().map(|v| v.to_string()).unwrap_or_default(),
        );
        vars.insert("__version_suffix__".to_string(), image.version.suffix().unwrap_or_default().to_string());
        vars.insert("__image_id__".to_string(), image.id());

        for layer in &recipe[..index] {
            vars.insert(format!("__{}__version__", layer.name), layer.version.to_string());
        }

        for (k, v) in &image.variables {
            vars.insert(k.clone(), v.clone());
        }

        vars
    }

    fn render_stage(&self, image: &Image, stage_dir: &Path, variables: &HashMap<String, String>) -> Result<PathBuf> {
        let Some(template_path) = image.template_path() else {
            bail!("image '{}' has no template assigned", image.name);
        };

        let vars: std::collections::BTreeMap<String, String> = variables.clone().into_iter().collect();
        let template = TemplateEngine::parse(&template_path, &vars, image)
            .with_context(|| format!("failed to parse template '{}'", template_path.display()))?;
        let rendered = self.backend.render(&template).context("failed to render template")?;

        let script_path = stage_dir.join("build.script");
        fs::write(&script_path, rendered).with_context(|| format!("failed to write '{}'", script_path.display()))?;
        Ok(script_path)
    }

    /// Wraps `set -e`, sourced variables, the prolog (if any), and the backend's build
    /// command into one shell file.
    fn write_wrapper(
        &self,
        image: &Image,
        stage_dir: &Path,
        script_path: &Path,
        variables: &HashMap<String, String>,
        name: &str,
    ) -> Result<PathBuf> {
        let build_cmd = self.backend.generate_build_cmd(script_path, name, &self.options.build_args);

        let mut wrapper = String::from("set -e\n");
        let mut sorted: Vec<(&String, &String)> = variables.iter().collect();
        sorted.sort_by_key(|(k, _)| k.clone());
        for (k, v) in sorted {
            wrapper.push_str(&format!("export {k}={}\n", shell_quote(v)));
        }
        if let Some(prolog) = &image.prolog {
            wrapper.push_str(prolog);
            wrapper.push('\n');
        }
        wrapper.push_str(&build_cmd);
        wrapper.push('\n');

        let wrapper_path = stage_dir.join("build.sh");
        fs::write(&wrapper_path, wrapper).with_context(|| format!("failed to write '{}'", wrapper_path.display()))?;
        Ok(wrapper_path)
    }

    /// Run `wrapper_path` as a shell script, streaming stdout/stderr via two reader threads
    /// onto separate queues plus a combined log file. A non-zero exit code propagates the
    /// child's own code.
    fn run_stage(&self, wrapper_path: &Path, stage_dir: &Path, log_path: &Path, tag: &str) -> Result<()> {
        let mut child = Command::new("sh")
            .arg(wrapper_path)
            .current_dir(stage_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn build for stage '{tag}'"))?;

        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");

        let (tx, rx) = mpsc::channel::<LogLine>();

        let tx_out = tx.clone();
        let out_reader = thread::spawn(move || {
            for line in BufReader::new(stdout).lines().map_while(std::result::Result::ok) {
                let _ = tx_out.send(LogLine::Stdout(line));
            }
        });
        let tx_err = tx;
        let err_reader = thread::spawn(move || {
            for line in BufReader::new(stderr).lines().map_while(std::result::Result::ok) {
                let _ = tx_err.send(LogLine::Stderr(line));
            }
        });

        let mut log_file = fs::File::create(log_path)
            .with_context(|| format!("failed to create log file '{}'", log_path.display()))?;

        let verbose = self.options.verbose;
        let color = self.options.color;
        for line in rx {
            let (prefix, text, is_stderr) = match &line {
                LogLine::Stdout(l) => ("stdout", l.as_str(), false),
                LogLine::Stderr(l) => ("stderr", l.as_str(), true),
            };
            writeln!(log_file, "[{prefix}] {text}")?;
            if verbose {
                let header = format!("[{tag}:{prefix}]");
                if color {
                    let header = if is_stderr { header.red() } else { header.green() };
                    println!("{header} {text}");
                } else {
                    println!("{header} {text}");
                }
            }
        }

        out_reader.join().expect("stdout reader thread panicked");
        err_reader.join().expect("stderr reader thread panicked");

        let status = child.wait().with_context(|| format!("failed waiting on stage '{tag}'"))?;
        if !status.success() {
            bail!("build for stage '{tag}' failed with exit code {}", status.code().unwrap_or(1));
        }
        Ok(())
    }

    fn run_shell(&self, command: &str, cwd: &Path) -> Result<()> {
        let status = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(cwd)
            .status()
            .with_context(|| format!("failed to run '{command}'"))?;
        if !status.success() {
            bail!("command '{command}' failed with exit code {}", status.code().unwrap_or(1));
        }
        Ok(())
    }
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(test)]
mod test {
    use super::*;
    use std::path::PathBuf;
    use velocity_core::Image;
    use velocity_version::Version;

    fn image(name: &str) -> Image {
        Image::new(name, Version::parse("1").unwrap(), PathBuf::from("."))
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn variable_map_includes_injected_names() {
        let backend = velocity_backend::from_name("apptainer");
        let Ok(backend) = backend else {
            // apptainer binary unavailable in this environment; nothing to assert.
            return;
        };
        let options = BuildOptions {
            name: None,
            dry_run: true,
            leave_tags: false,
            verbose: false,
            color: false,
            build_dir: PathBuf::from("."),
            build_args: HashMap::new(),
        };
        let builder = Builder::new(backend.as_ref(), options);
        let recipe = vec![image("gcc")];
        let vars = builder.variable_map(&recipe, 0, &None);
        assert!(vars.contains_key("__name__"));
        assert!(vars.contains_key("__version__"));
        assert!(vars.contains_key("__image_id__"));
    }
}
