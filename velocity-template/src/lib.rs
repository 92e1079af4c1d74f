//! Parses Velocity's section-oriented template format into a backend-neutral AST.

mod error;

pub use error::{Error, Result};

use regex::Regex;
use snafu::{ensure, ResultExt};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use velocity_core::Image;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
enum Section {
    From,
    Pre,
    Copy,
    Run,
    Env,
    Label,
    Entry,
    Post,
}

impl Section {
    fn header(line: &str) -> Option<Self> {
        match line {
            "@from" => Some(Section::From),
            "@pre" => Some(Section::Pre),
            "@copy" => Some(Section::Copy),
            "@run" => Some(Section::Run),
            "@env" => Some(Section::Env),
            "@label" => Some(Section::Label),
            "@entry" => Some(Section::Entry),
            "@post" => Some(Section::Post),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Section::From => "@from",
            Section::Pre => "@pre",
            Section::Copy => "@copy",
            Section::Run => "@run",
            Section::Env => "@env",
            Section::Label => "@label",
            Section::Entry => "@entry",
            Section::Post => "@post",
        }
    }
}

/// One `@run` line, with `!envar NAME VALUE` sugar already expanded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStep {
    Command(String),
    /// `!envar NAME VALUE`: export `NAME=VALUE` during the build and also record a label.
    EnvVar { name: String, value: String },
}

/// The parsed, backend-neutral form of one template file.
#[derive(Debug, Clone, Default)]
pub struct Template {
    pub from: String,
    pub pre: Vec<String>,
    pub copies: Vec<(String, String)>,
    pub run: Vec<RunStep>,
    pub env: Vec<(String, String)>,
    pub label: Vec<(String, String)>,
    pub entry: Vec<String>,
    pub post: Vec<String>,
    /// Build-time argument names discovered via `@@ NAME @@`, in first-seen order.
    pub arguments: BTreeSet<String>,
}

fn var_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*(\w+)\s*\}\}").expect("static regex"))
}

fn conditional_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\?\?\s*(.+?)\s*\|>\s*(.*?)\s*\?\?").expect("static regex"))
}

fn argument_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"@@\s*(\w+)\s*@@").expect("static regex"))
}

pub struct TemplateEngine;

impl TemplateEngine {
    /// Parse a template file, substituting `variables` and evaluating `?? WHEN |> TEXT ??`
    /// conditionals against `image`.
    pub fn parse(path: &Path, variables: &BTreeMap<String, String>, image: &Image) -> Result<Template> {
        let contents = std::fs::read_to_string(path).context(error::ReadTemplateSnafu { path })?;

        let mut sections: BTreeMap<Section, Vec<String>> = BTreeMap::new();
        let mut seen: HashSet<Section> = HashSet::new();
        let mut current: Option<Section> = None;
        let mut arguments = BTreeSet::new();

        for raw_line in contents.lines() {
            let line = strip_comment(raw_line).trim().to_string();
            if line.is_empty() {
                continue;
            }

            let line = substitute_variables(&line, variables);
            let line = evaluate_conditionals(&line, image, path)?;
            for cap in argument_regex().captures_iter(&line) {
                arguments.insert(cap[1].to_string());
            }

            let line = line.trim().to_string();
            if line.is_empty() {
                continue;
            }

            if let Some(header) = Section::header(&line) {
                ensure!(
                    seen.insert(header),
                    error::RepeatedSectionSnafu {
                        path: path.to_path_buf(),
                        header: header.name(),
                    }
                );
                current = Some(header);
                sections.entry(header).or_default();
                continue;
            }

            let Some(section) = current else {
                return error::LineOutsideOfSectionSnafu {
                    path: path.to_path_buf(),
                    line,
                }
                .fail();
            };
            sections.entry(section).or_default().push(line);
        }

        let run = parse_run(&sections);
        let label = parse_kv_with_run_labels(&sections, Section::Label, &run);

        Ok(Template {
            from: parse_from(&sections, path)?,
            pre: sections.get(&Section::Pre).cloned().unwrap_or_default().into_iter().map(strip_pipe).collect(),
            copies: parse_copies(&sections, path)?,
            run,
            env: parse_kv(&sections, Section::Env),
            label,
            entry: parse_entry(&sections, path)?,
            post: sections.get(&Section::Post).cloned().unwrap_or_default().into_iter().map(strip_pipe).collect(),
            arguments,
        })
    }
}

fn strip_comment(line: &str) -> &str {
    match line.find(">>>") {
        Some(idx) => &line[..idx],
        None => line,
    }
}

fn substitute_variables(line: &str, variables: &BTreeMap<String, String>) -> String {
    var_regex()
        .replace_all(line, |caps: &regex::Captures| {
            let name = &caps[1];
            match variables.get(name) {
                Some(value) => value.clone(),
                None => {
                    log::warn!("undefined template variable '{name}'");
                    String::new()
                }
            }
        })
        .into_owned()
}

fn evaluate_conditionals(line: &str, image: &Image, path: &Path) -> Result<String> {
    let mut result = String::new();
    let mut last_end = 0;
    for caps in conditional_regex().captures_iter(line) {
        let whole = caps.get(0).expect("capture 0 always present");
        result.push_str(&line[last_end..whole.start()]);
        let when = &caps[1];
        let text = &caps[2];
        let satisfies = image
            .satisfies(when)
            .context(error::EvaluateConditionalSnafu { path: path.to_path_buf() })?;
        if satisfies {
            result.push_str(text);
        }
        last_end = whole.end();
    }
    result.push_str(&line[last_end..]);
    Ok(result)
}

fn parse_from(sections: &BTreeMap<Section, Vec<String>>, path: &Path) -> Result<String> {
    let lines = sections.get(&Section::From).cloned().unwrap_or_default();
    ensure!(
        lines.len() == 1,
        error::TemplateSyntaxErrorSnafu {
            path: path.to_path_buf(),
            message: "a template must have exactly one '@from' line".to_string(),
        }
    );
    ensure!(
        lines[0].split_whitespace().count() == 1,
        error::TemplateSyntaxErrorSnafu {
            path: path.to_path_buf(),
            message: "'@from' must be a single token".to_string(),
        }
    );
    Ok(lines[0].clone())
}

fn parse_copies(sections: &BTreeMap<Section, Vec<String>>, path: &Path) -> Result<Vec<(String, String)>> {
    let mut out = Vec::new();
    for line in sections.get(&Section::Copy).cloned().unwrap_or_default() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        ensure!(
            tokens.len() == 2,
            error::TemplateSyntaxErrorSnafu {
                path: path.to_path_buf(),
                message: format!("'@copy' line '{line}' must have exactly two tokens"),
            }
        );
        out.push((tokens[0].to_string(), tokens[1].to_string()));
    }
    Ok(out)
}

fn parse_run(sections: &BTreeMap<Section, Vec<String>>) -> Vec<RunStep> {
    sections
        .get(&Section::Run)
        .cloned()
        .unwrap_or_default()
        .into_iter()
        .map(|line| match line.strip_prefix("!envar ") {
            Some(rest) => {
                let mut parts = rest.splitn(2, char::is_whitespace);
                let name = parts.next().unwrap_or_default().to_string();
                let value = parts.next().unwrap_or_default().trim().to_string();
                RunStep::EnvVar { name, value }
            }
            None => RunStep::Command(line),
        })
        .collect()
}

fn parse_kv(sections: &BTreeMap<Section, Vec<String>>, section: Section) -> Vec<(String, String)> {
    sections
        .get(&section)
        .cloned()
        .unwrap_or_default()
        .into_iter()
        .map(|line| {
            let mut parts = line.splitn(2, char::is_whitespace);
            let key = parts.next().unwrap_or_default().to_string();
            let value = parts.next().unwrap_or_default().trim().to_string();
            (key, value)
        })
        .collect()
}

/// `@label` entries plus the implicit labels contributed by `!envar` sugar in `@run`.
fn parse_kv_with_run_labels(
    sections: &BTreeMap<Section, Vec<String>>,
    section: Section,
    run: &[RunStep],
) -> Vec<(String, String)> {
    let mut labels = parse_kv(sections, section);
    for step in run {
        if let RunStep::EnvVar { name, value } = step {
            labels.push((name.clone(), value.clone()));
        }
    }
    labels
}

fn parse_entry(sections: &BTreeMap<Section, Vec<String>>, path: &Path) -> Result<Vec<String>> {
    let Some(lines) = sections.get(&Section::Entry) else {
        return Ok(Vec::new());
    };
    ensure!(
        lines.len() == 1,
        error::TemplateSyntaxErrorSnafu {
            path: path.to_path_buf(),
            message: "'@entry' must have exactly one line".to_string(),
        }
    );
    Ok(lines[0].split_whitespace().map(str::to_string).collect())
}

fn strip_pipe(line: String) -> String {
    line.strip_prefix('|').unwrap_or(&line).to_string()
}

#[cfg(test)]
mod test {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;
    use velocity_core::Image;
    use velocity_version::Version;

    fn image(name: &str) -> Image {
        Image::new(name, Version::parse("1").unwrap(), PathBuf::from("."))
    }

    fn write_template(dir: &TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("test.vtmp");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn parses_sections_and_strips_comments() {
        let dir = TempDir::new().unwrap();
        let path = write_template(
            &dir,
            "@from\nalpine >>> base image\n@run\necho one\necho two\n@env\nK V\n",
        );
        let tmpl = TemplateEngine::parse(&path, &BTreeMap::new(), &image("app")).unwrap();
        assert_eq!(tmpl.from, "alpine");
        assert_eq!(tmpl.run.len(), 2);
        assert_eq!(tmpl.env, vec![("K".to_string(), "V".to_string())]);
    }

    #[test]
    fn substitutes_variables_and_warns_on_missing() {
        let dir = TempDir::new().unwrap();
        let path = write_template(&dir, "@from\n{{ BASE }}\n");
        let mut vars = BTreeMap::new();
        vars.insert("BASE".to_string(), "ubuntu".to_string());
        let tmpl = TemplateEngine::parse(&path, &vars, &image("app")).unwrap();
        assert_eq!(tmpl.from, "ubuntu");
    }

    #[test]
    fn conditional_expands_when_satisfied() {
        let dir = TempDir::new().unwrap();
        let path = write_template(&dir, "@from\nalpine\n@run\n?? app |> echo hi ??\n");
        let tmpl = TemplateEngine::parse(&path, &BTreeMap::new(), &image("app")).unwrap();
        assert_eq!(tmpl.run, vec![RunStep::Command("echo hi".to_string())]);
    }

    #[test]
    fn conditional_vanishes_when_unsatisfied() {
        let dir = TempDir::new().unwrap();
        let path = write_template(&dir, "@from\nalpine\n@run\n?? clang |> echo hi ??\n");
        let tmpl = TemplateEngine::parse(&path, &BTreeMap::new(), &image("app")).unwrap();
        assert!(tmpl.run.is_empty());
    }

    #[test]
    fn discovers_build_time_arguments_without_substituting() {
        let dir = TempDir::new().unwrap();
        let path = write_template(&dir, "@from\nalpine\n@run\necho @@ FLAG @@\n");
        let tmpl = TemplateEngine::parse(&path, &BTreeMap::new(), &image("app")).unwrap();
        assert!(tmpl.arguments.contains("FLAG"));
        assert_eq!(tmpl.run, vec![RunStep::Command("echo @@ FLAG @@".to_string())]);
    }

    #[test]
    fn envar_sugar_expands_to_env_and_label() {
        let dir = TempDir::new().unwrap();
        let path = write_template(&dir, "@from\nalpine\n@run\n!envar FOO bar\n");
        let tmpl = TemplateEngine::parse(&path, &BTreeMap::new(), &image("app")).unwrap();
        assert_eq!(
            tmpl.run,
            vec![RunStep::EnvVar { name: "FOO".to_string(), value: "bar".to_string() }]
        );
        assert_eq!(tmpl.label, vec![("FOO".to_string(), "bar".to_string())]);
    }

    #[test]
    fn repeated_section_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write_template(&dir, "@from\nalpine\n@run\necho a\n@from\nubuntu\n");
        let err = TemplateEngine::parse(&path, &BTreeMap::new(), &image("app")).unwrap_err();
        assert!(err.to_string().contains("repeated"));
    }

    #[test]
    fn line_outside_section_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write_template(&dir, "echo a\n@from\nalpine\n");
        let err = TemplateEngine::parse(&path, &BTreeMap::new(), &image("app")).unwrap_err();
        assert!(err.to_string().contains("outside"));
    }

    #[test]
    fn copy_requires_two_tokens() {
        let dir = TempDir::new().unwrap();
        let path = write_template(&dir, "@from\nalpine\n@copy\nsrc\n");
        assert!(TemplateEngine::parse(&path, &BTreeMap::new(), &image("app")).is_err());
    }
}
