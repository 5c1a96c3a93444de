//! Script synthesis and variable injection for automations.
//!
//! Every run receives the predeclared variables of its triggering event. Bash
//! scripts get them as exported environment variables, except when a value
//! exceeds the per-variable or aggregate thresholds: oversized values are
//! written under the vars directory and loaded into non-exported shell
//! variables at script startup, which keeps argv+envp under the kernel's
//! `E2BIG` limit when the script execs children. JavaScript and Python
//! scripts receive a literal object at the top of the generated file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::json;

use ariana_types::{AutomationId, ScriptLanguage};

/// A bash variable larger than this is file-backed instead of exported.
pub const MAX_ENV_VAR_BYTES: usize = 4 * 1024;

/// Once exported variables sum past this, the remainder is file-backed.
pub const MAX_ENV_TOTAL_BYTES: usize = 16 * 1024;

/// Ordered set of variables injected into a script run.
///
/// Empty values are dropped at insertion so scripts can test for presence.
#[derive(Debug, Clone, Default)]
pub struct ScriptVariables {
    values: Vec<(String, String)>,
}

impl ScriptVariables {
    /// Empty variable set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a variable; empty values are skipped.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        if !value.is_empty() {
            self.values.push((name.to_string(), value));
        }
    }

    /// Iterate name/value pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Number of variables present.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True when no variable is set.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Everything needed to execute one synthesized run.
#[derive(Debug)]
pub struct PreparedScript {
    /// Path of the generated script file.
    pub script_path: PathBuf,
    /// Variables passed through the process environment.
    pub env: BTreeMap<String, String>,
    /// Files written for oversized variables, removed after the run.
    pub spilled_files: Vec<PathBuf>,
}

/// Interpreter invocation for a language.
pub fn interpreter(language: ScriptLanguage) -> (&'static str, &'static [&'static str]) {
    match language {
        // Login shell so interactive-session rc files apply.
        ScriptLanguage::Bash => ("bash", &["-l"]),
        ScriptLanguage::JavaScript => ("node", &[]),
        ScriptLanguage::Python => ("python3", &[]),
    }
}

/// Synthesize the script file and environment for one run.
pub fn prepare(
    automation_id: &AutomationId,
    language: ScriptLanguage,
    script_content: &str,
    variables: &ScriptVariables,
    scripts_dir: &Path,
    vars_dir: &Path,
) -> Result<PreparedScript> {
    std::fs::create_dir_all(scripts_dir)
        .with_context(|| format!("creating scripts dir {}", scripts_dir.display()))?;

    let run_id = uuid::Uuid::new_v4();
    let mut env = BTreeMap::new();
    let mut spilled_files = Vec::new();

    let body = match language {
        ScriptLanguage::Bash => {
            let mut prelude = String::from("#!/bin/bash\n");
            let mut exported_total = 0usize;
            for (name, value) in variables.iter() {
                let oversized = value.len() > MAX_ENV_VAR_BYTES
                    || exported_total + value.len() > MAX_ENV_TOTAL_BYTES;
                if oversized {
                    std::fs::create_dir_all(vars_dir)
                        .with_context(|| format!("creating vars dir {}", vars_dir.display()))?;
                    let file = vars_dir.join(format!("{automation_id}-{name}"));
                    std::fs::write(&file, value)
                        .with_context(|| format!("spilling variable {name}"))?;
                    // The path rides the environment; the value loads into a
                    // non-exported shell variable at startup.
                    env.insert(format!("{name}_FILE"), file.display().to_string());
                    prelude.push_str(&format!("{name}=\"$(cat \"${name}_FILE\")\"\n"));
                    spilled_files.push(file);
                } else {
                    exported_total += value.len();
                    env.insert(name.to_string(), value.to_string());
                }
            }
            format!("{prelude}\n{script_content}\n")
        }
        ScriptLanguage::JavaScript => {
            format!("const VARS = {};\n\n{script_content}\n", variables_object(variables))
        }
        ScriptLanguage::Python => {
            format!("VARS = {}\n\n{script_content}\n", variables_object(variables))
        }
    };

    let extension = match language {
        ScriptLanguage::Bash => "sh",
        ScriptLanguage::JavaScript => "js",
        ScriptLanguage::Python => "py",
    };
    let script_path = scripts_dir.join(format!("{automation_id}-{run_id}.{extension}"));
    std::fs::write(&script_path, body)
        .with_context(|| format!("writing script {}", script_path.display()))?;

    Ok(PreparedScript {
        script_path,
        env,
        spilled_files,
    })
}

/// JSON object literal of all variables, valid in both JS and Python source.
fn variables_object(variables: &ScriptVariables) -> String {
    let mut object = serde_json::Map::new();
    for (name, value) in variables.iter() {
        object.insert(name.to_string(), json!(value));
    }
    serde_json::Value::Object(object).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn vars(pairs: &[(&str, &str)]) -> ScriptVariables {
        let mut v = ScriptVariables::new();
        for (name, value) in pairs {
            v.set(name, *value);
        }
        v
    }

    #[test]
    fn small_bash_variables_ride_the_environment() {
        let dir = tempdir().unwrap();
        let prepared = prepare(
            &AutomationId("a1".into()),
            ScriptLanguage::Bash,
            "echo \"$LAST_PROMPT\"",
            &vars(&[("LAST_PROMPT", "fix the bug")]),
            &dir.path().join("scripts"),
            &dir.path().join("vars"),
        )
        .unwrap();

        assert_eq!(prepared.env.get("LAST_PROMPT").unwrap(), "fix the bug");
        assert!(prepared.spilled_files.is_empty());
    }

    #[test]
    fn oversized_bash_variable_is_file_backed() {
        let dir = tempdir().unwrap();
        let large = "x".repeat(20 * 1024);
        let prepared = prepare(
            &AutomationId("a1".into()),
            ScriptLanguage::Bash,
            "echo \"${#ENTIRE_AGENT_DIFF}\"",
            &vars(&[("ENTIRE_AGENT_DIFF", large.as_str())]),
            &dir.path().join("scripts"),
            &dir.path().join("vars"),
        )
        .unwrap();

        // The value itself stays out of the environment.
        assert!(!prepared.env.contains_key("ENTIRE_AGENT_DIFF"));
        let file = prepared.env.get("ENTIRE_AGENT_DIFF_FILE").unwrap();
        assert_eq!(std::fs::read_to_string(file).unwrap(), large);

        let script = std::fs::read_to_string(&prepared.script_path).unwrap();
        assert!(script.contains("ENTIRE_AGENT_DIFF=\"$(cat \"$ENTIRE_AGENT_DIFF_FILE\")\""));
    }

    #[test]
    fn aggregate_threshold_spills_the_remainder() {
        let dir = tempdir().unwrap();
        let chunk = "y".repeat(3 * 1024);
        let prepared = prepare(
            &AutomationId("a1".into()),
            ScriptLanguage::Bash,
            "true",
            &vars(&[
                ("V1", chunk.as_str()),
                ("V2", chunk.as_str()),
                ("V3", chunk.as_str()),
                ("V4", chunk.as_str()),
                ("V5", chunk.as_str()),
                ("V6", chunk.as_str()),
            ]),
            &dir.path().join("scripts"),
            &dir.path().join("vars"),
        )
        .unwrap();

        // 6 × 3 KiB exceeds the 16 KiB aggregate; the tail spills to disk.
        let exported: usize = prepared
            .env
            .iter()
            .filter(|(k, _)| !k.ends_with("_FILE"))
            .map(|(_, v)| v.len())
            .sum();
        assert!(exported <= MAX_ENV_TOTAL_BYTES);
        assert!(!prepared.spilled_files.is_empty());
    }

    #[test]
    fn javascript_gets_a_literal_object() {
        let dir = tempdir().unwrap();
        let prepared = prepare(
            &AutomationId("a1".into()),
            ScriptLanguage::JavaScript,
            "console.log(VARS.INPUT_COMMAND);",
            &vars(&[("INPUT_COMMAND", "cargo test")]),
            &dir.path().join("scripts"),
            &dir.path().join("vars"),
        )
        .unwrap();

        let script = std::fs::read_to_string(&prepared.script_path).unwrap();
        assert!(script.starts_with("const VARS = {\"INPUT_COMMAND\":\"cargo test\"};"));
        assert!(prepared.env.is_empty());
    }

    #[test]
    fn empty_values_are_dropped() {
        let mut v = ScriptVariables::new();
        v.set("PRESENT", "yes");
        v.set("ABSENT", "");
        assert_eq!(v.len(), 1);
    }
}
