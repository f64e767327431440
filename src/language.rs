//! Language tag → run command mapping.
//!
//! The mapper is a pure lookup. It also derives the staged file name for a
//! block, honouring a `filename:` directive on the block's first line.

use std::collections::HashMap;

use uuid::Uuid;

use crate::block::CodeBlock;
use crate::error::{ExecutorError, Result};

/// Placeholder substituted with the staged file name in run templates.
const FILE_PLACEHOLDER: &str = "{file}";

/// How `pip install` lines are recognised for silencing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipStyle {
    /// Never rewrite.
    None,
    /// Notebook-style `!pip install` / `! pip install`.
    Magic,
    /// Plain `pip install` at the start of a line.
    Shell,
}

/// How to stage and run code of one language.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    /// Extension of the staged source file, without the dot.
    pub file_extension: String,
    /// Argument vector; `{file}` is replaced by the staged file name.
    pub run: Vec<String>,
    /// Files produced next to the source by the run command (e.g. a build
    /// output), also written with `{file}`. Removed alongside the source.
    pub artifacts: Vec<String>,
    /// Line comment prefix used for the `filename:` directive.
    pub comment_prefix: String,
    pub pip_style: PipStyle,
}

impl CommandTemplate {
    /// Interpreted language: `<interpreter> <file>`.
    pub fn interpreter(file_extension: &str, interpreter: &str, comment_prefix: &str) -> Self {
        Self {
            file_extension: file_extension.to_string(),
            run: vec![interpreter.to_string(), FILE_PLACEHOLDER.to_string()],
            artifacts: Vec::new(),
            comment_prefix: comment_prefix.to_string(),
            pip_style: PipStyle::None,
        }
    }

    /// Language with a build step, run through `sh -c`.
    pub fn compiled(
        file_extension: &str,
        script: &str,
        artifacts: &[&str],
        comment_prefix: &str,
    ) -> Self {
        Self {
            file_extension: file_extension.to_string(),
            run: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            artifacts: artifacts.iter().map(ToString::to_string).collect(),
            comment_prefix: comment_prefix.to_string(),
            pip_style: PipStyle::None,
        }
    }

    #[must_use]
    pub fn with_pip_style(mut self, pip_style: PipStyle) -> Self {
        self.pip_style = pip_style;
        self
    }

    /// Run command for a staged file.
    pub fn command_for_file(&self, file_name: &str) -> Vec<String> {
        self.run
            .iter()
            .map(|arg| arg.replace(FILE_PLACEHOLDER, file_name))
            .collect()
    }

    /// Extra files the command leaves next to `file_name`.
    pub fn artifacts_for_file(&self, file_name: &str) -> Vec<String> {
        self.artifacts
            .iter()
            .map(|a| a.replace(FILE_PLACEHOLDER, file_name))
            .collect()
    }
}

/// Lookup table from language tag to [`CommandTemplate`].
///
/// Tags are matched case-insensitively. The built-in set can be extended
/// with [`CommandMapper::register`].
#[derive(Debug, Clone)]
pub struct CommandMapper {
    templates: HashMap<String, CommandTemplate>,
}

impl Default for CommandMapper {
    fn default() -> Self {
        let mut mapper = Self {
            templates: HashMap::new(),
        };

        let python =
            CommandTemplate::interpreter("py", "python", "#").with_pip_style(PipStyle::Magic);
        mapper.register_aliases(&["python", "python3", "py"], &python);

        let shell = CommandTemplate::interpreter("sh", "sh", "#").with_pip_style(PipStyle::Shell);
        mapper.register_aliases(&["bash", "shell", "sh"], &shell);

        let pwsh = CommandTemplate::interpreter("ps1", "pwsh", "#").with_pip_style(PipStyle::Shell);
        mapper.register_aliases(&["pwsh", "powershell", "ps1"], &pwsh);

        let node = CommandTemplate::interpreter("js", "node", "//");
        mapper.register_aliases(&["javascript", "js", "node"], &node);

        let c = CommandTemplate::compiled(
            "c",
            "cc {file} -o {file}.out && ./{file}.out",
            &["{file}.out"],
            "//",
        );
        mapper.register("c", c);

        mapper
    }
}

impl CommandMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the template for `language`.
    pub fn register(&mut self, language: &str, template: CommandTemplate) {
        self.templates.insert(language.to_lowercase(), template);
    }

    fn register_aliases(&mut self, languages: &[&str], template: &CommandTemplate) {
        for language in languages {
            self.register(language, template.clone());
        }
    }

    /// Resolve the template for a language tag.
    pub fn command_for(&self, language: &str) -> Result<&CommandTemplate> {
        self.templates
            .get(&language.trim().to_lowercase())
            .ok_or_else(|| ExecutorError::UnsupportedLanguage(language.to_string()))
    }

    /// Sorted list of recognised tags.
    pub fn languages(&self) -> Vec<&str> {
        let mut langs: Vec<_> = self.templates.keys().map(String::as_str).collect();
        langs.sort_unstable();
        langs
    }

    /// Resolve everything needed to stage and run `block`, without touching
    /// the filesystem.
    pub fn plan(&self, block: &CodeBlock, silence_pip: bool) -> Result<BlockPlan> {
        let template = self.command_for(&block.language)?.clone();

        let file_name = match filename_directive(&block.code, &template.comment_prefix) {
            Some(name) => {
                validate_file_name(name)?;
                name.to_string()
            }
            None => format!("tmp_code_{}.{}", Uuid::new_v4().simple(), template.file_extension),
        };

        let code = if silence_pip {
            silence_pip_lines(&block.code, template.pip_style)
        } else {
            block.code.clone()
        };

        Ok(BlockPlan {
            language: block.language.clone(),
            file_name,
            code,
            template,
        })
    }
}

/// A block ready to be staged: resolved command, file name, final source.
#[derive(Debug, Clone)]
pub struct BlockPlan {
    pub language: String,
    pub file_name: String,
    pub code: String,
    pub template: CommandTemplate,
}

impl BlockPlan {
    pub fn command(&self) -> Vec<String> {
        self.template.command_for_file(&self.file_name)
    }

    pub fn artifacts(&self) -> Vec<String> {
        self.template.artifacts_for_file(&self.file_name)
    }
}

/// Extract `<name>` from a first line of the form `<prefix> filename: <name>`.
fn filename_directive<'a>(code: &'a str, comment_prefix: &str) -> Option<&'a str> {
    let first_line = code.lines().next()?.trim();
    let rest = first_line.strip_prefix(comment_prefix)?.trim_start();
    let name = rest.strip_prefix("filename:")?.trim();
    (!name.is_empty()).then_some(name)
}

/// Staged names must be plain file names inside the working directory.
fn validate_file_name(name: &str) -> Result<()> {
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));

    if !valid_chars || name.starts_with('.') {
        return Err(ExecutorError::InvalidFilename(format!(
            "'{name}' is not a plain file name in the workspace"
        )));
    }
    Ok(())
}

/// Append `-qqq` to `pip install` invocations so installer chatter does not
/// swamp the captured output.
fn silence_pip_lines(code: &str, style: PipStyle) -> String {
    let prefixes: &[&str] = match style {
        PipStyle::None => return code.to_string(),
        PipStyle::Magic => &["!pip install", "! pip install"],
        PipStyle::Shell => &["pip install"],
    };

    code.split('\n')
        .map(|line| {
            prefixes
                .iter()
                .find(|p| line.starts_with(*p))
                .filter(|_| !line.contains("-qqq"))
                .map_or_else(
                    || line.to_string(),
                    |p| format!("{p} -qqq{}", &line[p.len()..]),
                )
        })
        .collect::<Vec<_>>()
        .join("\n")
}
