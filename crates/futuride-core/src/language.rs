//! Supported languages

use crate::FuturideError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Closed set of languages the engine accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    C,
    JavaScript,
    Html,
}

/// Display metadata for editors and language pickers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguageInfo {
    pub id: Language,
    pub name: String,
    pub extension: String,
    pub template: String,
}

impl Language {
    #[must_use]
    pub const fn all() -> [Self; 4] {
        [Self::Python, Self::C, Self::JavaScript, Self::Html]
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::C => "c",
            Self::JavaScript => "javascript",
            Self::Html => "html",
        }
    }

    /// Source file extension, without the dot
    #[must_use]
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Python => "py",
            Self::C => "c",
            Self::JavaScript => "js",
            Self::Html => "html",
        }
    }

    #[must_use]
    pub const fn display_name(self) -> &'static str {
        match self {
            Self::Python => "Python",
            Self::C => "C",
            Self::JavaScript => "JavaScript",
            Self::Html => "HTML",
        }
    }

    /// Starter program shown in a fresh editor
    #[must_use]
    pub const fn template(self) -> &'static str {
        match self {
            Self::Python => "print(\"Hello, World!\")",
            Self::C => {
                "#include <stdio.h>\n\nint main() {\n    printf(\"Hello, World!\\n\");\n    return 0;\n}"
            }
            Self::JavaScript => "console.log(\"Hello, World!\");",
            Self::Html => {
                "<!DOCTYPE html>\n<html>\n<head>\n    <title>Hello World</title>\n</head>\n<body>\n    <h1>Hello, World!</h1>\n</body>\n</html>"
            }
        }
    }

    #[must_use]
    pub fn info(self) -> LanguageInfo {
        LanguageInfo {
            id: self,
            name: self.display_name().into(),
            extension: format!(".{}", self.extension()),
            template: self.template().into(),
        }
    }

    /// Guess a language from an uploaded file name, defaulting to Python
    #[must_use]
    pub fn from_filename(name: &str) -> Self {
        let ext = Path::new(name)
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);

        match ext.as_deref() {
            Some("c") => Self::C,
            Some("js") => Self::JavaScript,
            Some("html") => Self::Html,
            _ => Self::Python,
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = FuturideError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "python" => Ok(Self::Python),
            "c" => Ok(Self::C),
            "javascript" => Ok(Self::JavaScript),
            "html" => Ok(Self::Html),
            _ => Err(FuturideError::InvalidInput("Unsupported language".into())),
        }
    }
}
