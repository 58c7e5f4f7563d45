//! `<NAME>` / `<NAME_i>` substitution for job templates.
//!
//! Substitution is a single left-to-right pass over the template: text
//! inserted for one token is never scanned again, so a replacement value can
//! not inject further substitutions. Once the pass is done, any `<...>` span
//! without whitespace is an error, including misspelled tokens such as
//! `<OUTPUT-DIR>` that substitution never matches.

use crate::error::{EvalError, Result};
use regex::{Captures, Regex};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::LazyLock;

static PLACEHOLDER_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<([A-Za-z][A-Za-z0-9_]*)>").expect("placeholder pattern compiles")
});

static RESIDUAL_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[^<>\s]+>").expect("residual pattern compiles"));

pub const LOG_DIR: &str = "LOG_DIR";
pub const OUTPUT_DIR: &str = "OUTPUT_DIR";
pub const BAG_FILENAME: &str = "BAG_FILENAME";
pub const OUTPUT_MAP_KEY: &str = "OUTPUT_MAP_KEY";
pub const OUTPUT_MAP_FOLDER: &str = "OUTPUT_MAP_FOLDER";
pub const NCAM_CALIB_FILENAME: &str = "NCAM_CALIB_FILENAME";
pub const WHEEL_ODO_CALIB_FILENAME: &str = "WHEEL_ODO_CALIB_FILENAME";
pub const RT3K_CALIB_FILENAME: &str = "RT3K_CALIB_FILENAME";
pub const SENSORS_YAML: &str = "SENSORS_YAML";
pub const LOCALIZATION_MAP: &str = "LOCALIZATION_MAP";

/// Token table scoped to a single job, keyed by the bare token name
/// (`BAG_FILENAME_1`, not `<BAG_FILENAME_1>`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlaceholderMap {
    entries: BTreeMap<String, String>,
}

impl PlaceholderMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(name.into(), value.into());
    }

    /// Registers `NAME_i`. Index 0 is also registered under the scalar
    /// `NAME`, which always refers to the job's primary dataset.
    pub fn insert_indexed(&mut self, name: &str, index: usize, value: impl Into<String>) {
        let value = value.into();
        if index == 0 {
            self.entries.insert(name.to_string(), value.clone());
        }
        self.entries.insert(format!("{}_{}", name, index), value);
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn resolve(&self, template: &str) -> Result<String> {
        let resolved = PLACEHOLDER_PATTERN
            .replace_all(template, |caps: &Captures| match self.get(&caps[1]) {
                Some(value) => value.to_string(),
                None => caps[0].to_string(),
            })
            .into_owned();
        if let Some(token) = find_unresolved(&resolved) {
            return Err(EvalError::UnresolvedPlaceholder {
                token: token.to_string(),
                partial: resolved.clone(),
            });
        }
        Ok(resolved)
    }

    /// Resolves every string inside `value`, descending into arrays and
    /// objects. Non-string scalars pass through untouched.
    pub fn resolve_value(&self, value: &Value) -> Result<Value> {
        match value {
            Value::String(s) => Ok(Value::String(self.resolve(s)?)),
            Value::Array(items) => items
                .iter()
                .map(|item| self.resolve_value(item))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (key, item) in map {
                    out.insert(key.clone(), self.resolve_value(item)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }
}

/// First `<...>` span of `text` with no whitespace inside.
pub fn find_unresolved(text: &str) -> Option<&str> {
    RESIDUAL_PATTERN.find(text).map(|m| m.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job_map() -> PlaceholderMap {
        let mut map = PlaceholderMap::new();
        map.insert(LOG_DIR, "/results/exp/bagA__p1");
        map.insert(OUTPUT_DIR, "/results/exp/bagA__p1");
        map.insert_indexed(BAG_FILENAME, 0, "/data/bagA.bag");
        map.insert_indexed(BAG_FILENAME, 1, "/data/bagB.bag");
        map
    }

    #[test]
    fn resolves_scalar_and_indexed_tokens() {
        let map = job_map();
        let out = map
            .resolve("--bags=<BAG_FILENAME_0>,<BAG_FILENAME_1> --log=<LOG_DIR>")
            .expect("fully resolvable");
        assert_eq!(
            out,
            "--bags=/data/bagA.bag,/data/bagB.bag --log=/results/exp/bagA__p1"
        );
        assert!(find_unresolved(&out).is_none());
    }

    #[test]
    fn scalar_form_is_index_zero() {
        let map = job_map();
        assert_eq!(
            map.resolve("<BAG_FILENAME>").expect("resolves"),
            map.resolve("<BAG_FILENAME_0>").expect("resolves")
        );
    }

    #[test]
    fn unresolved_token_is_reported_with_partial_string() {
        let map = job_map();
        let err = map
            .resolve("<LOG_DIR>/<LOCALIZATION_MAP>")
            .expect_err("map token is not declared");
        match err {
            EvalError::UnresolvedPlaceholder { token, partial } => {
                assert_eq!(token, "<LOCALIZATION_MAP>");
                assert_eq!(partial, "/results/exp/bagA__p1/<LOCALIZATION_MAP>");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn replacement_text_is_not_substituted_again() {
        let mut map = PlaceholderMap::new();
        map.insert("A", "<B>");
        map.insert("B", "boom");
        let err = map.resolve("x<A>y").expect_err("inserted token survives");
        match err {
            EvalError::UnresolvedPlaceholder { token, partial } => {
                assert_eq!(token, "<B>");
                assert_eq!(partial, "x<B>y");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn comparison_operators_are_not_flagged() {
        let map = job_map();
        let out = map.resolve("a < b && c > d").expect("nothing to flag");
        assert_eq!(out, "a < b && c > d");
    }

    #[test]
    fn malformed_tokens_are_reported_unresolved() {
        let map = PlaceholderMap::new();
        for (template, token) in [
            ("--out=<OUTPUT-DIR>/x", "<OUTPUT-DIR>"),
            ("--bag=<1ST_BAG>", "<1ST_BAG>"),
            ("--calib=<calib.yaml>", "<calib.yaml>"),
            ("a < b, <1x>", "<1x>"),
        ] {
            match map.resolve(template) {
                Err(EvalError::UnresolvedPlaceholder { token: found, partial }) => {
                    assert_eq!(found, token);
                    assert_eq!(partial, template);
                }
                other => panic!("{} should fail, got {:?}", template, other),
            }
        }
    }

    #[test]
    fn misspelled_token_next_to_resolved_one_is_reported() {
        let map = job_map();
        let err = map
            .resolve("<LOG_DIR>/<OUTPUT-DIR>")
            .expect_err("hyphenated token never matches");
        match err {
            EvalError::UnresolvedPlaceholder { token, partial } => {
                assert_eq!(token, "<OUTPUT-DIR>");
                assert_eq!(partial, "/results/exp/bagA__p1/<OUTPUT-DIR>");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn resolve_value_descends_into_containers() {
        let map = job_map();
        let value = json!({
            "log": "<LOG_DIR>/log.txt",
            "bags": ["<BAG_FILENAME_0>", "<BAG_FILENAME_1>"],
            "rate": 10,
            "enabled": true
        });
        let out = map.resolve_value(&value).expect("resolves");
        assert_eq!(out["log"], "/results/exp/bagA__p1/log.txt");
        assert_eq!(out["bags"][1], "/data/bagB.bag");
        assert_eq!(out["rate"], 10);
        assert_eq!(out["enabled"], true);
    }
}
