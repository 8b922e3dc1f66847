use std::sync::OnceLock;

use regex::Regex;

/// Builtins and dunder names that enable dynamic attribute access and can
/// bypass the module/function policy entirely; always rejected, whether
/// called, read as attributes, or reached through string subscripts.
const DANGEROUS_BUILTINS: [&str; 15] = [
    "getattr",
    "setattr",
    "delattr",
    "vars",
    "globals",
    "locals",
    "__getattribute__",
    "__setattr__",
    "__delattr__",
    "__dict__",
    "__class__",
    "__bases__",
    "__subclasses__",
    "__mro__",
    "__builtins__",
];

const KEYWORDS: [&str; 13] = [
    "if", "elif", "while", "for", "return", "and", "or", "not", "in", "with", "assert", "lambda",
    "print",
];

fn import_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*import\s+(.+)$").expect("static regex"))
}

fn from_import_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*from\s+([A-Za-z_][\w.]*)\s+import\b").expect("static regex"))
}

fn call_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"([A-Za-z_][\w.]*)\s*\(").expect("static regex"))
}

fn subscript_call_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\]\s*\(").expect("static regex"))
}

fn attribute_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\.\s*([A-Za-z_]\w*)").expect("static regex"))
}

fn subscript_key_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"\[\s*(?:'([^']*)'|"([^"]*)")\s*\]"#).expect("static regex"))
}

/// Lexical policy check over generated code.
///
/// At most one of the allowed/blocked lists may be set per category; the
/// dangerous-builtin deny list always applies.
#[derive(Debug, Clone, Default)]
pub struct CodeVerifier {
    pub allowed_modules: Option<Vec<String>>,
    pub blocked_modules: Option<Vec<String>>,
    pub allowed_functions: Option<Vec<String>>,
    pub blocked_functions: Option<Vec<String>>,
}

impl CodeVerifier {
    pub fn from_config(config: &skein_config::CodeInterpreterConfig) -> Self {
        Self {
            allowed_modules: config.allowed_modules.clone(),
            blocked_modules: config.blocked_modules.clone(),
            allowed_functions: config.allowed_functions.clone(),
            blocked_functions: config.blocked_functions.clone(),
        }
    }

    pub fn verify(&self, code: &str) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        for (idx, line) in code.lines().enumerate() {
            let lineno = idx + 1;
            self.check_imports(line, lineno, &mut errors);
            self.check_calls(line, lineno, &mut errors);
            self.check_attributes(line, lineno, &mut errors);
            self.check_subscript_keys(line, lineno, &mut errors);
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn module_allowed(&self, module: &str) -> bool {
        if let Some(allowed) = &self.allowed_modules {
            return !allowed.is_empty() && allowed.iter().any(|m| m == module);
        }
        if let Some(blocked) = &self.blocked_modules {
            return blocked.is_empty() || !blocked.iter().any(|m| m == module);
        }
        true
    }

    fn function_allowed(&self, function: &str) -> bool {
        if let Some(allowed) = &self.allowed_functions {
            return !allowed.is_empty() && allowed.iter().any(|f| f == function);
        }
        if let Some(blocked) = &self.blocked_functions {
            return blocked.is_empty() || !blocked.iter().any(|f| f == function);
        }
        true
    }

    fn check_imports(&self, line: &str, lineno: usize, errors: &mut Vec<String>) {
        let mut roots: Vec<String> = Vec::new();
        if let Some(captures) = from_import_re().captures(line) {
            roots.push(root_module(&captures[1]));
        } else if let Some(captures) = import_re().captures(line) {
            for item in captures[1].split(',') {
                let name = item.trim().split_whitespace().next().unwrap_or_default();
                if !name.is_empty() {
                    roots.push(root_module(name));
                }
            }
        }
        for module in roots {
            if !self.module_allowed(&module) {
                errors.push(format!(
                    "Error on line {}: {} => Importing module '{}' is not allowed.",
                    lineno,
                    line.trim_end(),
                    module
                ));
            }
        }
    }

    fn check_calls(&self, line: &str, lineno: usize, errors: &mut Vec<String>) {
        if subscript_call_re().is_match(line) {
            errors.push(format!(
                "Error on line {}: {} => Subscript-based function calls are not allowed for security reasons.",
                lineno,
                line.trim_end()
            ));
        }
        for captures in call_re().captures_iter(line) {
            let full = &captures[1];
            // The called name is the last attribute segment.
            let name = full.rsplit('.').next().unwrap_or(full);
            if KEYWORDS.contains(&name) {
                continue;
            }
            if is_definition(line, captures.get(1).map(|m| m.start()).unwrap_or(0)) {
                continue;
            }
            if DANGEROUS_BUILTINS.contains(&name) {
                errors.push(format!(
                    "Error on line {}: {} => Function '{}' is blocked as it can be used to bypass security checks.",
                    lineno,
                    line.trim_end(),
                    name
                ));
                continue;
            }
            if (self.allowed_functions.is_some() || self.blocked_functions.is_some())
                && !self.function_allowed(name)
            {
                errors.push(format!(
                    "Error on line {}: {} => Function '{}' is not allowed.",
                    lineno,
                    line.trim_end(),
                    name
                ));
            }
        }
    }

    /// Bare attribute access to a dangerous name (`obj.__class__`,
    /// `type(x).__bases__`). Calls through such attributes are already
    /// rejected by the call scan, so names followed by `(` are skipped
    /// here.
    fn check_attributes(&self, line: &str, lineno: usize, errors: &mut Vec<String>) {
        for captures in attribute_re().captures_iter(line) {
            let name_match = captures.get(1).expect("attribute capture");
            let name = name_match.as_str();
            if !DANGEROUS_BUILTINS.contains(&name) {
                continue;
            }
            let rest = line[name_match.end()..].trim_start();
            if rest.starts_with('(') {
                continue;
            }
            errors.push(format!(
                "Error on line {}: {} => Attribute access to '{}' is blocked for security reasons.",
                lineno,
                line.trim_end(),
                name
            ));
        }
    }

    /// Dict-style access with a dangerous or dunder string key
    /// (`d["__class__"]`, `ns['__builtins__']`) bypasses the attribute
    /// scan and is rejected outright.
    fn check_subscript_keys(&self, line: &str, lineno: usize, errors: &mut Vec<String>) {
        for captures in subscript_key_re().captures_iter(line) {
            let key = captures
                .get(1)
                .or_else(|| captures.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default();
            if DANGEROUS_BUILTINS.contains(&key) || key.starts_with("__") {
                errors.push(format!(
                    "Error on line {}: {} => Subscript access to '{}' is blocked for security reasons.",
                    lineno,
                    line.trim_end(),
                    key
                ));
            }
        }
    }
}

fn root_module(name: &str) -> String {
    name.split('.').next().unwrap_or(name).to_string()
}

/// A name directly preceded by `def`/`class` is a definition, not a call.
fn is_definition(line: &str, name_start: usize) -> bool {
    let prefix = line[..name_start].trim_end();
    prefix.ends_with("def") || prefix.ends_with("class")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unrestricted_code_passes() {
        let verifier = CodeVerifier::default();
        assert!(verifier
            .verify("import pandas as pd\nx = pd.DataFrame()\nprint(x)")
            .is_ok());
    }

    #[test]
    fn test_dangerous_builtins_always_rejected() {
        let verifier = CodeVerifier::default();
        let errors = verifier
            .verify("value = getattr(obj, 'method')")
            .unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("getattr"));
    }

    #[test]
    fn test_blocked_module_rejected() {
        let verifier = CodeVerifier {
            blocked_modules: Some(vec!["os".to_string(), "subprocess".to_string()]),
            ..CodeVerifier::default()
        };
        let errors = verifier
            .verify("import os\nimport pandas\nfrom subprocess import run")
            .unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(errors[0].contains("'os'"));
        assert!(errors[1].contains("'subprocess'"));
    }

    #[test]
    fn test_allowed_modules_excludes_everything_else() {
        let verifier = CodeVerifier {
            allowed_modules: Some(vec!["pandas".to_string()]),
            ..CodeVerifier::default()
        };
        assert!(verifier.verify("import pandas.io").is_ok());
        assert!(verifier.verify("import numpy").is_err());
    }

    #[test]
    fn test_blocked_function_rejected() {
        let verifier = CodeVerifier {
            blocked_functions: Some(vec!["eval".to_string()]),
            ..CodeVerifier::default()
        };
        let errors = verifier.verify("result = eval('1+1')").unwrap_err();
        assert!(errors[0].contains("'eval'"));
    }

    #[test]
    fn test_subscript_call_rejected() {
        let verifier = CodeVerifier::default();
        let errors = verifier.verify("handlers['run']()").unwrap_err();
        assert!(errors[0].contains("Subscript-based"));
    }

    #[test]
    fn test_definitions_and_keywords_are_not_calls() {
        let verifier = CodeVerifier {
            allowed_functions: Some(vec!["print".to_string(), "helper".to_string()]),
            ..CodeVerifier::default()
        };
        let code = "def helper(x):\n    if (x > 1):\n        return helper(x - 1)\n    print(x)";
        assert!(verifier.verify(code).is_ok());
    }

    #[test]
    fn test_method_call_checked_by_last_segment() {
        let verifier = CodeVerifier {
            blocked_functions: Some(vec!["to_csv".to_string()]),
            ..CodeVerifier::default()
        };
        assert!(verifier.verify("df.to_csv('out.csv')").is_err());
    }

    #[test]
    fn test_bare_dunder_attribute_access_rejected() {
        let verifier = CodeVerifier::default();
        let errors = verifier.verify("cls = obj.__class__").unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("Attribute access to '__class__'"));

        let errors = verifier.verify("bases = type(obj).__bases__").unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("'__bases__'"));
    }

    #[test]
    fn test_called_dangerous_attribute_reported_once() {
        let verifier = CodeVerifier::default();
        let errors = verifier
            .verify("obj.__getattribute__('secret')")
            .unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("__getattribute__"));
    }

    #[test]
    fn test_dunder_subscript_key_rejected() {
        let verifier = CodeVerifier::default();
        let errors = verifier.verify("d[\"__class__\"]").unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("Subscript access to '__class__'"));

        let errors = verifier.verify("ns['__builtins__']").unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("'__builtins__'"));
    }

    #[test]
    fn test_dict_bypass_through_dunder_dict_rejected() {
        let verifier = CodeVerifier::default();
        // Both the __dict__ read and the subscript-based call are flagged.
        let errors = verifier.verify("obj.__dict__[\"update\"]()").unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().any(|e| e.contains("'__dict__'")));
        assert!(errors.iter().any(|e| e.contains("Subscript-based")));
    }

    #[test]
    fn test_benign_attributes_and_keys_pass() {
        let verifier = CodeVerifier::default();
        let code = "value = row[\"name\"]\ntotal = df.sum()\nx = 1.5";
        assert!(verifier.verify(code).is_ok());
    }
}
