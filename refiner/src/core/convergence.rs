//! Convergence predicates applied on top of a passing validation.
//!
//! The loop never invents its own criteria: a predicate only inspects what the
//! validation delegate printed, and can only turn a pass into a fail.

use regex::Regex;

pub trait ConvergencePredicate {
    /// `Ok(())` accepts the passing output; `Err` explains the rejection.
    fn accept(&self, output: &str) -> Result<(), String>;
}

/// Default predicate: a passing validation has converged.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidationPassed;

impl ConvergencePredicate for ValidationPassed {
    fn accept(&self, _output: &str) -> Result<(), String> {
        Ok(())
    }
}

/// Require the validation output to match a pattern (e.g. a tolerance report line).
#[derive(Debug, Clone)]
pub struct OutputMatches {
    pattern: Regex,
}

impl OutputMatches {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
        })
    }
}

impl ConvergencePredicate for OutputMatches {
    fn accept(&self, output: &str) -> Result<(), String> {
        if self.pattern.is_match(output) {
            Ok(())
        } else {
            Err(format!(
                "validation passed but its output did not match /{}/",
                self.pattern.as_str()
            ))
        }
    }
}

impl<F> ConvergencePredicate for F
where
    F: Fn(&str) -> Result<(), String>,
{
    fn accept(&self, output: &str) -> Result<(), String> {
        self(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_accepts_anything() {
        assert!(ValidationPassed.accept("").is_ok());
    }

    #[test]
    fn output_pattern_rejects_missing_marker() {
        let predicate = OutputMatches::new(r"margin: \d+(\.\d+)? %").expect("pattern");
        assert!(predicate.accept("thermal margin: 12.5 %").is_ok());
        let err = predicate.accept("thermal margin: n/a").unwrap_err();
        assert!(err.contains("did not match"));
    }

    #[test]
    fn closures_are_predicates() {
        let predicate = |output: &str| {
            if output.contains("OK") {
                Ok(())
            } else {
                Err("no OK".to_string())
            }
        };
        assert!(predicate.accept("all OK").is_ok());
        assert!(predicate.accept("nope").is_err());
    }
}
