//! Code blocks submitted for execution.
//!
//! Maps language tags to the interpreter that runs them inside the
//! container and decides the file name each block is written to.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Component, Path, PathBuf};

/// Interpreter definition
struct Interpreter {
    language: Language,
    /// Command run inside the container
    command: &'static str,
    /// Extension for generated file names
    extension: &'static str,
    /// Tags accepted for this interpreter
    tags: &'static [&'static str],
}

const INTERPRETERS: &[Interpreter] = &[
    Interpreter {
        language: Language::Python,
        command: "python",
        extension: "py",
        tags: &["python", "py", "python3"],
    },
    Interpreter {
        language: Language::Shell,
        command: "sh",
        extension: "sh",
        tags: &["sh", "bash", "shell"],
    },
    Interpreter {
        language: Language::PowerShell,
        command: "pwsh",
        extension: "ps1",
        tags: &["pwsh", "powershell", "ps1"],
    },
];

/// Languages the executor knows how to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Shell,
    PowerShell,
}

impl Language {
    /// Resolve a language tag (case-insensitive). Returns None for unknown tags.
    pub fn from_tag(tag: &str) -> Option<Self> {
        let tag = tag.trim().to_lowercase();
        INTERPRETERS
            .iter()
            .find(|i| i.tags.contains(&tag.as_str()))
            .map(|i| i.language)
    }

    fn interpreter(&self) -> &'static Interpreter {
        INTERPRETERS
            .iter()
            .find(|i| i.language == *self)
            .unwrap_or(&INTERPRETERS[0])
    }

    /// Command used to run a file of this language
    pub fn command(&self) -> &'static str {
        self.interpreter().command
    }

    /// File extension for generated file names
    pub fn extension(&self) -> &'static str {
        self.interpreter().extension
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Language::Python => write!(f, "python"),
            Language::Shell => write!(f, "sh"),
            Language::PowerShell => write!(f, "pwsh"),
        }
    }
}

/// A (language tag, source text) pair. The tag is kept verbatim so an
/// unsupported tag can be reported back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeBlock {
    pub language: String,
    pub code: String,
}

impl CodeBlock {
    pub fn new(language: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            language: language.into(),
            code: code.into(),
        }
    }

    pub fn python(code: impl Into<String>) -> Self {
        Self::new("python", code)
    }

    pub fn shell(code: impl Into<String>) -> Self {
        Self::new("sh", code)
    }
}

/// Extract a `filename:` directive from the first line of the code.
///
/// Accepts `# filename: x.py`, `// filename: x.py` and `<!-- filename: x -->`.
pub fn filename_directive(code: &str) -> Option<&str> {
    let first = code.lines().next()?.trim();
    let rest = first
        .strip_prefix('#')
        .or_else(|| first.strip_prefix("//"))
        .or_else(|| first.strip_prefix("<!--").map(|r| r.trim_end_matches("-->")))?;
    let name = rest.trim().strip_prefix("filename:")?.trim();
    if name.is_empty() { None } else { Some(name) }
}

/// Check that a requested file name stays inside the working directory.
pub fn validate_relative_path(name: &str) -> anyhow::Result<PathBuf> {
    let path = Path::new(name);
    if path.is_absolute() {
        anyhow::bail!("Filename must be relative to the working directory: {}", name);
    }
    let mut named = false;
    for component in path.components() {
        match component {
            Component::Normal(_) => named = true,
            Component::CurDir => {}
            _ => anyhow::bail!("Filename is not in the working directory: {}", name),
        }
    }
    if !named || name.ends_with('/') || name.ends_with("/.") {
        anyhow::bail!("Filename must name a file: {}", name);
    }
    Ok(path.to_path_buf())
}

/// File name for a block without a directive: `tmp_code_<sha256>.<ext>`
pub fn generated_filename(code: &str, language: Language) -> String {
    let digest = Sha256::digest(code.as_bytes());
    format!("tmp_code_{}.{}", hex::encode(digest), language.extension())
}

/// Add `-qqq` to `pip install` lines so installs don't flood the output.
pub fn silence_pip(code: &str, language: Language) -> String {
    if language == Language::PowerShell {
        return code.to_string();
    }

    let mut out: Vec<String> = Vec::new();
    for line in code.lines() {
        let trimmed = line.trim_start();
        let is_install = trimmed.starts_with("pip install")
            || trimmed.starts_with("pip3 install")
            || trimmed.starts_with("!pip install");
        if is_install && !line.contains("-qqq") {
            out.push(line.replacen("install", "install -qqq", 1));
        } else {
            out.push(line.to_string());
        }
    }

    let mut result = out.join("\n");
    if code.ends_with('\n') {
        result.push('\n');
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_language_tags() {
        assert_eq!(Language::from_tag("python"), Some(Language::Python));
        assert_eq!(Language::from_tag("Python3"), Some(Language::Python));
        assert_eq!(Language::from_tag("bash"), Some(Language::Shell));
        assert_eq!(Language::from_tag("powershell"), Some(Language::PowerShell));
        assert_eq!(Language::from_tag("ruby"), None);
        assert_eq!(Language::from_tag(""), None);
    }

    #[test]
    fn test_commands_and_extensions() {
        assert_eq!(Language::Python.command(), "python");
        assert_eq!(Language::Python.extension(), "py");
        assert_eq!(Language::Shell.command(), "sh");
        assert_eq!(Language::PowerShell.extension(), "ps1");
    }

    #[test]
    fn test_filename_directive() {
        assert_eq!(
            filename_directive("# filename: analysis.py\nprint(1)"),
            Some("analysis.py")
        );
        assert_eq!(filename_directive("// filename: run.sh\n"), Some("run.sh"));
        assert_eq!(filename_directive("<!-- filename: a.sh -->"), Some("a.sh"));
        assert_eq!(filename_directive("print(1)\n# filename: x.py"), None);
        assert_eq!(filename_directive("# just a comment"), None);
        assert_eq!(filename_directive("# filename:   "), None);
    }

    #[test]
    fn test_validate_relative_path() {
        assert!(validate_relative_path("out/plot.py").is_ok());
        assert!(validate_relative_path("./a.py").is_ok());
        assert!(validate_relative_path("/etc/passwd").is_err());
        assert!(validate_relative_path("../escape.py").is_err());
        assert!(validate_relative_path("a/../../b.py").is_err());
        assert!(validate_relative_path(".").is_err());
        assert!(validate_relative_path("./").is_err());
        assert!(validate_relative_path("out/").is_err());
        assert!(validate_relative_path("out/.").is_err());
    }

    #[test]
    fn test_generated_filename_is_content_addressed() {
        let a = generated_filename("print(1)", Language::Python);
        let b = generated_filename("print(1)", Language::Python);
        let c = generated_filename("print(2)", Language::Python);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("tmp_code_"));
        assert!(a.ends_with(".py"));
        // sha256 hex is 64 chars
        assert_eq!(a.len(), "tmp_code_".len() + 64 + ".py".len());
    }

    #[test]
    fn test_silence_pip() {
        let code = "pip install pandas\nimport pandas\n";
        assert_eq!(
            silence_pip(code, Language::Shell),
            "pip install -qqq pandas\nimport pandas\n"
        );
        let already = "pip install -qqq numpy";
        assert_eq!(silence_pip(already, Language::Python), already);
        let ps = "pip install numpy";
        assert_eq!(silence_pip(ps, Language::PowerShell), ps);
    }
}
