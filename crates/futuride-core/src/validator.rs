//! Static denylist validation of submitted source
//!
//! Validation is advisory defense-in-depth, not a sandbox guarantee. A denylist
//! can only recognise constructs somebody thought to write down; obfuscated or
//! novel escapes will get through. The process limits in [`crate::isolation`] and
//! the deployment's own privilege separation are what actually bound the damage.
//!
//! Matching uses [`regex::RegexSet`], which runs in time linear in the input and
//! cannot backtrack catastrophically. Validation is pure: no I/O, no logging.

use crate::config::DenylistConfig;
use crate::language::Language;
use crate::{FuturideError, Result};
use regex::{RegexSet, RegexSetBuilder};
use std::fmt;

/// Compiled automaton ceiling per language
const REGEX_SIZE_LIMIT: usize = 32 * 1024 * 1024;

/// Class of construct a denylist rule recognises
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    ProcessSpawn,
    FilesystemAccess,
    NetworkAccess,
    SystemAccess,
    DynamicCode,
    RuntimeEscape,
    /// Operator-supplied pattern
    Restricted,
}

impl Category {
    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::ProcessSpawn => "process spawning",
            Self::FilesystemAccess => "filesystem access",
            Self::NetworkAccess => "network access",
            Self::SystemAccess => "system call invocation",
            Self::DynamicCode => "dynamic code loading",
            Self::RuntimeEscape => "interpreter escape",
            Self::Restricted => "restricted construct",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Why a submission was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Violation {
    Empty,
    TooLong { max: usize },
    Denied(Category),
}

impl Violation {
    /// Caller-facing reason. Never includes the matched source text.
    #[must_use]
    pub fn reason(self) -> String {
        match self {
            Self::Empty => "Code cannot be empty".into(),
            Self::TooLong { max } => {
                format!("Code too long. Maximum {max} characters allowed.")
            }
            Self::Denied(category) => format!("Potentially dangerous code detected: {category}"),
        }
    }

    #[must_use]
    pub const fn is_input_error(self) -> bool {
        matches!(self, Self::Empty | Self::TooLong { .. })
    }
}

impl From<Violation> for FuturideError {
    fn from(violation: Violation) -> Self {
        if violation.is_input_error() {
            Self::InvalidInput(violation.reason())
        } else {
            Self::ValidationRejected(violation.reason())
        }
    }
}

/// Outcome of validating one submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationResult {
    pub allowed: bool,
    pub reason: Option<String>,
    pub violation: Option<Violation>,
}

impl ValidationResult {
    const fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            violation: None,
        }
    }

    fn deny(violation: Violation) -> Self {
        Self {
            allowed: false,
            reason: Some(violation.reason()),
            violation: Some(violation),
        }
    }
}

#[derive(Debug)]
struct Denylist {
    set: RegexSet,
    categories: Vec<Category>,
}

impl Denylist {
    fn compile(builtin: &[(Category, &str)], extra: &[String]) -> Result<Self> {
        let mut patterns: Vec<&str> = builtin.iter().map(|(_, p)| *p).collect();
        let mut categories: Vec<Category> = builtin.iter().map(|(c, _)| *c).collect();
        for pattern in extra {
            patterns.push(pattern);
            categories.push(Category::Restricted);
        }

        let set = RegexSetBuilder::new(&patterns)
            .multi_line(true)
            .size_limit(REGEX_SIZE_LIMIT)
            .build()
            .map_err(|e| FuturideError::Config(format!("invalid denylist pattern: {e}")))?;

        Ok(Self { set, categories })
    }

    fn first_match(&self, code: &str) -> Option<Category> {
        self.set
            .matches(code)
            .into_iter()
            .next()
            .map(|index| self.categories[index])
    }
}

/// Per-language denylist validator
#[derive(Debug)]
pub struct Validator {
    max_code_length: usize,
    python: Denylist,
    c: Denylist,
    javascript: Denylist,
    html: Denylist,
}

impl Validator {
    /// Compile the built-in denylists plus any operator additions
    pub fn new(max_code_length: usize, denylist: &DenylistConfig) -> Result<Self> {
        Ok(Self {
            max_code_length,
            python: Denylist::compile(PYTHON_RULES, extra(denylist, Language::Python))?,
            c: Denylist::compile(C_RULES, extra(denylist, Language::C))?,
            javascript: Denylist::compile(
                JAVASCRIPT_RULES,
                extra(denylist, Language::JavaScript),
            )?,
            html: Denylist::compile(&[], extra(denylist, Language::Html))?,
        })
    }

    /// Full validation: input shape first, then the language denylist
    #[must_use]
    pub fn validate(&self, code: &str, language: Language) -> ValidationResult {
        match self
            .check_input(code)
            .or_else(|| self.check_patterns(code, language))
        {
            Some(violation) => ValidationResult::deny(violation),
            None => ValidationResult::allow(),
        }
    }

    /// Empty and over-length checks. These never depend on the language.
    #[must_use]
    pub fn check_input(&self, code: &str) -> Option<Violation> {
        if code.trim().is_empty() {
            return Some(Violation::Empty);
        }
        // Byte length bounds character count from above, so only count when needed
        if code.len() > self.max_code_length && code.chars().count() > self.max_code_length {
            return Some(Violation::TooLong {
                max: self.max_code_length,
            });
        }
        None
    }

    /// Denylist match for the given language
    #[must_use]
    pub fn check_patterns(&self, code: &str, language: Language) -> Option<Violation> {
        let denylist = match language {
            Language::Python => &self.python,
            Language::C => &self.c,
            Language::JavaScript => &self.javascript,
            Language::Html => &self.html,
        };
        denylist.first_match(code).map(Violation::Denied)
    }
}

fn extra(denylist: &DenylistConfig, language: Language) -> &[String] {
    denylist
        .extra
        .get(&language)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

const PYTHON_RULES: &[(Category, &str)] = &[
    (
        Category::ProcessSpawn,
        r"^\s*(?:import|from)\s+[^\n#]*\b(?:subprocess|multiprocessing|pty|popen2|commands)\b",
    ),
    (
        Category::SystemAccess,
        r"^\s*(?:import|from)\s+[^\n#]*\b(?:os|sys|ctypes|cffi|signal|resource|posix|nt|platform|gc|inspect|builtins|code|codeop)\b",
    ),
    (
        Category::FilesystemAccess,
        r"^\s*(?:import|from)\s+[^\n#]*\b(?:shutil|pathlib|glob|tempfile|io|fileinput|mmap|sqlite3|pickle|marshal|shelve)\b",
    ),
    (
        Category::NetworkAccess,
        r"^\s*(?:import|from)\s+[^\n#]*\b(?:socket|socketserver|ssl|urllib|urllib2|urllib3|http|httplib|requests|ftplib|smtplib|poplib|imaplib|telnetlib|xmlrpc|asyncio|selectors|select)\b",
    ),
    (Category::DynamicCode, r"\b(?:__import__|importlib)\b"),
    // Bare calls only: `re.compile(...)` is a method
    (
        Category::DynamicCode,
        r"(?:^|[^.\w])(?:eval|exec|compile|execfile|reload)\s*\(",
    ),
    (Category::FilesystemAccess, r"\b(?:open|file)\s*\("),
    (
        Category::ProcessSpawn,
        r"\b(?:system|popen|spawn\w*|fork|forkpty|exec[lv]p?e?|posix_spawnp?)\s*\(",
    ),
    (Category::SystemAccess, r"\b(?:kill|killpg|_exit|setuid|chroot)\s*\("),
    (
        Category::RuntimeEscape,
        r"__(?:builtins|subclasses|globals|class|bases|base|mro|code|closure|dict|getattribute|loader|spec|reduce|reduce_ex)__",
    ),
    (
        Category::RuntimeEscape,
        r"\b(?:globals|locals|vars|getattr|setattr|delattr|breakpoint|input)\s*\(",
    ),
];

const C_RULES: &[(Category, &str)] = &[
    (
        Category::SystemAccess,
        r#"#\s*include\s*[<"]\s*(?:unistd|signal|dlfcn|fcntl|dirent|termios|pwd|grp|syscall|pthread|sched|ucontext|setjmp|link|elf|poll|spawn|asm/[\w./]+|linux/[\w./]+|sys/[\w./]+)\.h"#,
    ),
    (
        Category::NetworkAccess,
        r#"#\s*include\s*[<"]\s*(?:netdb|ifaddrs|netinet/[\w./]+|arpa/[\w./]+|net/[\w./]+)\.h"#,
    ),
    (
        Category::ProcessSpawn,
        r"\b(?:system|popen|fork|vfork|clone|execl|execlp|execle|execv|execvp|execvpe|execve|fexecve|posix_spawnp?|daemon)\s*\(",
    ),
    (
        Category::FilesystemAccess,
        r"\b(?:fopen|freopen|fdopen|open|openat|creat|remove|unlink|unlinkat|rename|renameat|rmdir|mkdir|chmod|chown|chdir|chroot|opendir|symlink|link|truncate|tmpfile|mkstemp)\s*\(",
    ),
    (
        Category::NetworkAccess,
        r"\b(?:socket|socketpair|connect|bind|listen|accept|accept4|sendto|recvfrom|gethostbyname|getaddrinfo)\s*\(",
    ),
    (
        Category::SystemAccess,
        r"\b(?:syscall|ptrace|kill|raise|signal|sigaction|setuid|setgid|prctl|ioctl|mmap|mprotect|dlopen|dlsym)\s*\(",
    ),
    (Category::RuntimeEscape, r"\b(?:asm|__asm__|__asm)\b"),
    (Category::RuntimeEscape, r"__attribute__\s*\(\s*\(\s*(?:constructor|destructor|section)"),
];

const JAVASCRIPT_RULES: &[(Category, &str)] = &[
    (Category::ProcessSpawn, r"\b(?:require|process|child_process|Deno|Bun)\b"),
    (Category::DynamicCode, r"\bimport\s*\("),
    (Category::DynamicCode, r#"^\s*import\s+[\w*{\s,}]*\s*(?:from\s*)?['"]"#),
    (Category::DynamicCode, r"\beval\s*\("),
    (Category::DynamicCode, r"\b(?:new\s+)?Function\s*\("),
    (Category::DynamicCode, r#"\b(?:setTimeout|setInterval)\s*\(\s*['"`]"#),
    (
        Category::NetworkAccess,
        r"\b(?:fetch|XMLHttpRequest|WebSocket|EventSource|navigator)\b",
    ),
    (Category::FilesystemAccess, r"\b(?:fs|readFile\w*|writeFile\w*|FileReader)\b"),
    (
        Category::RuntimeEscape,
        r"\b(?:globalThis|__bootstrap|__proto__|__defineGetter__|__defineSetter__|__lookupGetter__|__futuride\w*)\b",
    ),
    (Category::RuntimeEscape, r"\bop_\w+"),
    (Category::RuntimeEscape, r"\.\s*constructor\b"),
    (Category::RuntimeEscape, r#"\[\s*['"`]constructor['"`]\s*\]"#),
    (Category::RuntimeEscape, r"\b(?:WebAssembly|SharedArrayBuffer|Atomics)\b"),
];

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> Validator {
        Validator::new(50_000, &DenylistConfig::default()).unwrap()
    }

    fn denied(code: &str, language: Language) -> Option<Category> {
        match validator().validate(code, language).violation {
            Some(Violation::Denied(category)) => Some(category),
            _ => None,
        }
    }

    #[test]
    fn allows_hello_world_in_every_language() {
        let validator = validator();
        for language in Language::all() {
            let result = validator.validate(language.template(), language);
            assert!(result.allowed, "{language} template rejected: {:?}", result.reason);
            assert!(result.reason.is_none());
        }
    }

    #[test]
    fn empty_and_whitespace_are_input_errors() {
        let validator = validator();
        for code in ["", "   ", "\n\t\n"] {
            let result = validator.validate(code, Language::Python);
            assert!(!result.allowed);
            assert_eq!(result.violation, Some(Violation::Empty));
            assert!(result.reason.unwrap().contains("empty"));
        }
    }

    #[test]
    fn length_is_counted_in_characters() {
        let validator = Validator::new(5, &DenylistConfig::default()).unwrap();
        // five characters, ten bytes
        assert!(validator.validate("ééééé", Language::Html).allowed);

        let result = validator.validate("print(1)", Language::Python);
        assert_eq!(result.violation, Some(Violation::TooLong { max: 5 }));
        assert!(result.reason.unwrap().contains("Maximum 5 characters"));
    }

    #[test]
    fn python_os_system_is_rejected() {
        let result = validator().validate("import os; os.system('ls')", Language::Python);
        assert!(!result.allowed);
        let reason = result.reason.unwrap();
        assert!(reason.contains("dangerous"));
        assert!(!reason.contains("import os"));
    }

    #[test]
    fn python_rules() {
        for (code, category) in [
            ("import subprocess", Category::ProcessSpawn),
            ("import math, sys", Category::SystemAccess),
            ("from os import path", Category::SystemAccess),
            ("import socket", Category::NetworkAccess),
            ("open('/etc/passwd')", Category::FilesystemAccess),
            ("__import__('os')", Category::DynamicCode),
            ("eval('1+1')", Category::DynamicCode),
            ("x = 1\nexec('print(x)')", Category::DynamicCode),
            ("print(compile('1', 'f', 'eval'))", Category::DynamicCode),
            ("().__class__.__bases__[0].__subclasses__()", Category::RuntimeEscape),
            ("print(globals())", Category::RuntimeEscape),
        ] {
            assert_eq!(denied(code, Language::Python), Some(category), "{code}");
        }
    }

    #[test]
    fn python_lookalikes_are_allowed() {
        for code in [
            "import math\nprint(math.sqrt(2))",
            "import ossaudiodev_stub_name as x",
            "positions = [1, 2]\nprint(positions)",
            "def reopen_count(n):\n    return n\nprint(reopen_count(3))",
            "import re\npat = re.compile(r'\\d+')\nprint(pat.findall('a1b22'))",
        ] {
            assert!(validator().validate(code, Language::Python).allowed, "{code}");
        }
    }

    #[test]
    fn c_rules() {
        assert_eq!(denied("#include <unistd.h>", Language::C), Some(Category::SystemAccess));
        assert_eq!(denied("#include <sys/socket.h>", Language::C), Some(Category::SystemAccess));
        assert_eq!(denied("#include <netinet/in.h>", Language::C), Some(Category::NetworkAccess));
        assert_eq!(
            denied("int main(){system(\"ls\");}", Language::C),
            Some(Category::ProcessSpawn)
        );
        assert_eq!(
            denied("int main(){FILE*f=fopen(\"x\",\"w\");}", Language::C),
            Some(Category::FilesystemAccess)
        );
        assert_eq!(denied("int main(){asm(\"nop\");}", Language::C), Some(Category::RuntimeEscape));
    }

    #[test]
    fn c_busy_loop_is_allowed() {
        assert!(validator().validate("int main(){while(1);}", Language::C).allowed);
        let code = "#include <stdio.h>\n#include <math.h>\nint main(){printf(\"%f\", sqrt(2.0));}";
        assert!(validator().validate(code, Language::C).allowed);
    }

    #[test]
    fn javascript_rules() {
        assert_eq!(
            denied("const cp = require('child_process')", Language::JavaScript),
            Some(Category::ProcessSpawn)
        );
        assert_eq!(
            denied("process.exit(1)", Language::JavaScript),
            Some(Category::ProcessSpawn)
        );
        assert_eq!(denied("import('fs')", Language::JavaScript), Some(Category::DynamicCode));
        assert_eq!(
            denied("import fs from 'fs'", Language::JavaScript),
            Some(Category::DynamicCode)
        );
        assert_eq!(
            denied("new Function('return 1')()", Language::JavaScript),
            Some(Category::DynamicCode)
        );
        assert_eq!(
            denied("fetch('http://x')", Language::JavaScript),
            Some(Category::NetworkAccess)
        );
        assert_eq!(
            denied("(()=>{}).constructor('return this')()", Language::JavaScript),
            Some(Category::RuntimeEscape)
        );
    }

    #[test]
    fn javascript_runtime_internals_are_rejected() {
        for code in [
            "__bootstrap.core.ops.op_panic('x')",
            "__bootstrap.core.print('hi')",
            "this.__bootstrap.core.ops.op_resources()",
            "const { op_print } = ops;",
        ] {
            assert_eq!(denied(code, Language::JavaScript), Some(Category::RuntimeEscape), "{code}");
        }
    }

    #[test]
    fn javascript_classes_are_allowed() {
        let code = "class Point { constructor(x) { this.x = x; } }\nconsole.log(new Point(3).x);";
        assert!(validator().validate(code, Language::JavaScript).allowed);
    }

    #[test]
    fn html_has_no_builtin_denylist() {
        let code = "<script>fetch('/api')</script><h1>Test</h1>";
        assert!(validator().validate(code, Language::Html).allowed);
    }

    #[test]
    fn operator_patterns_extend_the_builtins() {
        let mut denylist = DenylistConfig::default();
        denylist
            .extra
            .insert(Language::Html, vec![r"(?i)<\s*iframe".to_string()]);
        let validator = Validator::new(50_000, &denylist).unwrap();

        let result = validator.validate("<IFRAME src=x>", Language::Html);
        assert_eq!(result.violation, Some(Violation::Denied(Category::Restricted)));
        // built-ins still apply
        assert!(!validator.validate("import os", Language::Python).allowed);
    }

    #[test]
    fn invalid_operator_pattern_is_a_config_error() {
        let mut denylist = DenylistConfig::default();
        denylist.extra.insert(Language::C, vec!["(unclosed".to_string()]);
        assert!(matches!(
            Validator::new(50_000, &denylist),
            Err(FuturideError::Config(_))
        ));
    }

    #[test]
    fn violations_map_to_error_kinds() {
        use crate::result::ErrorKind;

        let err: FuturideError = Violation::Empty.into();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        let err: FuturideError = Violation::Denied(Category::NetworkAccess).into();
        assert_eq!(err.kind(), ErrorKind::ValidationRejected);
    }

    #[test]
    fn large_input_stays_linear() {
        let code = "a".repeat(49_999);
        assert!(validator().validate(&code, Language::Python).allowed);
    }
}
