use std::collections::HashMap;
use std::path::Path;

use anyhow::{Result, anyhow};
use serde::Deserialize;

use crate::sandbox::RunCommand;

/// Placeholder replaced by the absolute path of the source file
pub const INPUT_PLACEHOLDER: &str = "%INPUT%";
/// Placeholder replaced by the absolute path of the compiled artifact
pub const OUTPUT_PLACEHOLDER: &str = "%OUTPUT%";

/// How to build and start programs written in one language
///
/// Command templates are argv vectors. Languages without a compile step
/// (interpreted ones) leave `compile` empty and run the source directly.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LanguageProfile {
    pub name: String,
    /// File name the source is saved under, e.g. `main.cpp`
    pub source: String,
    #[serde(default)]
    pub compile: Option<Vec<String>>,
    pub run: Vec<String>,
}

impl LanguageProfile {
    /// An empty `compile` template means the language is not compiled
    fn new(name: &str, source: &str, compile: &[&str], run: &[&str]) -> Self {
        let owned = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Self {
            name: name.to_string(),
            source: source.to_string(),
            compile: (!compile.is_empty()).then(|| owned(compile)),
            run: owned(run),
        }
    }

    /// Extension of the source file name, used to name the checker source
    pub fn extension(&self) -> &str {
        Path::new(&self.source)
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("")
    }

    /// Compile command for `source` producing `artifact`, or `None` when the
    /// language needs no compilation
    pub fn compile_command(
        &self,
        source: &Path,
        artifact: &Path,
        dir: &Path,
    ) -> Option<Result<RunCommand>> {
        self.compile
            .as_ref()
            .map(|template| RunCommand::from_argv(&apply_template(template, source, artifact), dir))
    }

    pub fn run_command(&self, source: &Path, artifact: &Path, dir: &Path) -> Result<RunCommand> {
        RunCommand::from_argv(&apply_template(&self.run, source, artifact), dir)
    }
}

/// Applies `%INPUT%`/`%OUTPUT%` substitutions to each argument of a template
fn apply_template(template: &[String], source: &Path, artifact: &Path) -> Vec<String> {
    let source = source.to_string_lossy();
    let artifact = artifact.to_string_lossy();
    template
        .iter()
        .map(|arg| {
            arg.replace(INPUT_PLACEHOLDER, &source)
                .replace(OUTPUT_PLACEHOLDER, &artifact)
        })
        .collect()
}

/// Lookup table from language identifier to profile
#[derive(Debug, Clone)]
pub struct LanguageRegistry {
    profiles: HashMap<String, LanguageProfile>,
}

impl LanguageRegistry {
    fn empty() -> Self {
        Self {
            profiles: HashMap::new(),
        }
    }

    /// The languages supported out of the box
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        for profile in [
            LanguageProfile::new(
                "cpp",
                "main.cpp",
                &["g++", "-O2", "-std=c++17", "-o", "%OUTPUT%", "%INPUT%"],
                &["%OUTPUT%"],
            ),
            LanguageProfile::new(
                "c",
                "main.c",
                &["gcc", "-O2", "-std=c11", "-o", "%OUTPUT%", "%INPUT%", "-lm"],
                &["%OUTPUT%"],
            ),
            LanguageProfile::new(
                "rust",
                "main.rs",
                &["rustc", "-O", "--edition", "2021", "-o", "%OUTPUT%", "%INPUT%"],
                &["%OUTPUT%"],
            ),
            LanguageProfile::new(
                "haskell",
                "main.hs",
                &["ghc", "-O2", "-o", "%OUTPUT%", "%INPUT%"],
                &["%OUTPUT%"],
            ),
            LanguageProfile::new(
                "csharp",
                "main.cs",
                &["mcs", "-O+", "-out:%OUTPUT%.exe", "%INPUT%"],
                &["mono", "%OUTPUT%.exe"],
            ),
            LanguageProfile::new(
                "d",
                "main.d",
                &["ldc2", "-O", "-of=%OUTPUT%", "%INPUT%"],
                &["%OUTPUT%"],
            ),
            LanguageProfile::new("python3", "main.py", &[], &["python3", "%INPUT%"]),
        ] {
            registry.insert(profile);
        }
        registry
    }

    /// Built-in profiles with `overrides` replacing same-named entries
    pub fn with_overrides(overrides: &[LanguageProfile]) -> Self {
        let mut registry = Self::builtin();
        for profile in overrides {
            registry.insert(profile.clone());
        }
        registry
    }

    pub fn insert(&mut self, profile: LanguageProfile) {
        self.profiles.insert(profile.name.clone(), profile);
    }

    pub fn get(&self, name: &str) -> Result<&LanguageProfile> {
        self.profiles
            .get(name)
            .ok_or_else(|| anyhow!("Unsupported language: {name}"))
    }
}

impl Default for LanguageRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
