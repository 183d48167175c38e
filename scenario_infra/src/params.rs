// Copyright © 2026 The virt-scenario Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ParamsError {
    #[error("invalid syntax: {0}")]
    InvalidSyntax(String),
    #[error("unable to convert {1} for {0}")]
    Conversion(String /* key */, String /* value */),
    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),
    #[error("reading parameter file {0:?} failed")]
    ReadFile(PathBuf, #[source] std::io::Error),
    #[error("parsing parameter file failed")]
    ParseJson(#[source] serde_json::Error),
}
type ParamsResult<T> = std::result::Result<T, ParamsError>;

/// String key/value bag handed to every scenario.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Params {
    values: BTreeMap<String, String>,
}

// Splits on top-level commas, keeping quoted and bracketed sections intact.
fn split_commas(s: &str) -> ParamsResult<Vec<String>> {
    let mut list: Vec<String> = Vec::new();
    let mut opened_brackets = 0u64;
    let mut in_quotes = false;
    let mut current = String::new();

    for c in s.trim().chars() {
        match c {
            // In quotes, only '"' is special
            '"' => in_quotes = !in_quotes,
            _ if in_quotes => {}
            '[' => opened_brackets += 1,
            ']' => {
                if opened_brackets < 1 {
                    return Err(ParamsError::InvalidSyntax(s.to_owned()));
                }
                opened_brackets -= 1;
            }
            ',' if opened_brackets == 0 => {
                list.push(current);
                current = String::new();
                continue;
            }
            _ => {}
        };
        current.push(c);
    }
    list.push(current);

    if in_quotes || opened_brackets != 0 {
        return Err(ParamsError::InvalidSyntax(s.to_owned()));
    }

    Ok(list)
}

// `""` inside an unquoted run stands for a literal quote.
fn dequote(s: &str) -> String {
    let mut prev = '\0';
    let mut in_quotes = false;
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if c == '"' {
            if prev == '"' && !in_quotes {
                out.push('"');
            }
            in_quotes = !in_quotes;
        } else {
            out.push(c);
        }
        prev = c;
    }
    out
}

fn json_scalar(key: &str, value: &Value) -> ParamsResult<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Bool(b) => Ok(if *b { "yes" } else { "no" }.to_string()),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(ParamsError::InvalidValue(key.to_owned(), value.to_string())),
    }
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<K: AsRef<str>, V: AsRef<str>>(pairs: &[(K, V)]) -> Self {
        let mut params = Self::new();
        for (k, v) in pairs {
            params.set(k.as_ref(), v.as_ref());
        }
        params
    }

    /// Parses `key=value,key2="a,b",key3=[1,2]` and overrides existing keys.
    pub fn parse_overrides(&mut self, input: &str) -> ParamsResult<()> {
        if input.trim().is_empty() {
            return Ok(());
        }

        for option in split_commas(input)?.iter() {
            match option.split_once('=') {
                Some((key, value)) if !key.trim().is_empty() => {
                    self.set(key.trim(), &dequote(value.trim()));
                }
                _ => return Err(ParamsError::InvalidSyntax(option.to_owned())),
            }
        }

        Ok(())
    }

    /// Loads a flat JSON object. Arrays become space separated lists.
    pub fn from_json_str(input: &str) -> ParamsResult<Self> {
        let value: Value = serde_json::from_str(input).map_err(ParamsError::ParseJson)?;
        let Value::Object(map) = value else {
            return Err(ParamsError::InvalidValue(
                "<root>".to_owned(),
                "expected a JSON object".to_owned(),
            ));
        };

        let mut params = Self::new();
        for (key, value) in map.iter() {
            let value = match value {
                Value::Array(items) => items
                    .iter()
                    .map(|v| json_scalar(key, v))
                    .collect::<ParamsResult<Vec<String>>>()?
                    .join(" "),
                v => json_scalar(key, v)?,
            };
            params.set(key, &value);
        }

        Ok(params)
    }

    pub fn from_json_file(path: &Path) -> ParamsResult<Self> {
        let content =
            fs::read_to_string(path).map_err(|e| ParamsError::ReadFile(path.to_owned(), e))?;
        Self::from_json_str(&content)
    }

    /// Values from `other` win over the ones already present.
    pub fn merge(&mut self, other: &Params) {
        for (k, v) in other.values.iter() {
            self.values.insert(k.clone(), v.clone());
        }
    }

    pub fn set(&mut self, key: &str, value: &str) -> &mut Self {
        self.values.insert(key.to_owned(), value.to_owned());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|s| s.as_str())
    }

    pub fn get_or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or(default).to_owned()
    }

    pub fn is_set(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn convert<T: FromStr>(&self, key: &str) -> ParamsResult<Option<T>> {
        match self.get(key).map(str::trim) {
            None | Some("") => Ok(None),
            Some(v) => v
                .parse::<T>()
                .map(Some)
                .map_err(|_| ParamsError::Conversion(key.to_owned(), v.to_owned())),
        }
    }

    pub fn convert_or<T: FromStr>(&self, key: &str, default: T) -> ParamsResult<T> {
        Ok(self.convert(key)?.unwrap_or(default))
    }

    /// Accepts yes/no, on/off and true/false.
    pub fn get_bool(&self, key: &str, default: bool) -> ParamsResult<bool> {
        match self.get(key).map(|s| s.trim().to_lowercase()) {
            None => Ok(default),
            Some(v) => match v.as_str() {
                "" => Ok(default),
                "yes" | "on" | "true" => Ok(true),
                "no" | "off" | "false" => Ok(false),
                _ => Err(ParamsError::Conversion(key.to_owned(), v)),
            },
        }
    }

    pub fn get_list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|s| s.split_whitespace().map(|s| s.to_owned()).collect())
            .unwrap_or_default()
    }

    pub fn duration_secs(&self, key: &str, default_secs: u64) -> ParamsResult<Duration> {
        Ok(Duration::from_secs(self.convert_or(key, default_secs)?))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_overrides() {
        let mut params = Params::new();
        params.parse_overrides("").unwrap();
        assert_eq!(params, Params::new());

        params.parse_overrides("main_vm=vm1,memory_kib=2097152").unwrap();
        assert_eq!(params.get("main_vm"), Some("vm1"));
        assert_eq!(params.get("memory_kib"), Some("2097152"));

        params.parse_overrides("vms=\"vm1 vm2\",cpus=[1,2]").unwrap();
        assert_eq!(params.get_list("vms"), vec!["vm1", "vm2"]);
        assert_eq!(params.get("cpus"), Some("[1,2]"));

        params
            .parse_overrides("cmdline=\"console=ttyS0,9600n8\"")
            .unwrap();
        assert_eq!(params.get("cmdline"), Some("console=ttyS0,9600n8"));

        // Later values override earlier ones
        params.parse_overrides("main_vm=vm2").unwrap();
        assert_eq!(params.get("main_vm"), Some("vm2"));

        params.parse_overrides("hanging_param").unwrap_err();
        params.parse_overrides("=value").unwrap_err();
        params.parse_overrides("cpus=[").unwrap_err();
        params.parse_overrides("cpus=[[1]]]").unwrap_err();
        params.parse_overrides("cmdline=\"").unwrap_err();
    }

    #[test]
    fn test_convert() {
        let params = Params::from_pairs(&[
            ("memory_kib", "2097152"),
            ("empty", ""),
            ("bad", "12x"),
            ("status_error", "yes"),
            ("check_login", "off"),
            ("weird", "maybe"),
        ]);

        assert_eq!(params.convert::<u64>("memory_kib").unwrap(), Some(2097152));
        assert_eq!(params.convert::<u64>("empty").unwrap(), None);
        assert_eq!(params.convert::<u64>("missing").unwrap(), None);
        assert_eq!(params.convert_or::<u32>("missing", 4).unwrap(), 4);
        assert!(matches!(
            params.convert::<u64>("bad"),
            Err(ParamsError::Conversion(k, v)) if k == "bad" && v == "12x"
        ));

        assert!(params.get_bool("status_error", false).unwrap());
        assert!(!params.get_bool("check_login", true).unwrap());
        assert!(params.get_bool("missing", true).unwrap());
        params.get_bool("weird", false).unwrap_err();

        assert_eq!(
            params.duration_secs("login_timeout", 240).unwrap(),
            Duration::from_secs(240)
        );
        assert_eq!(params.get_or("main_vm", "vm1"), "vm1");
    }

    #[test]
    fn test_from_json() {
        let params = Params::from_json_str(
            r#"{"vms": ["vm1", "vm2"], "memory_kib": 2097152, "status_error": false, "connect_uri": "qemu:///system"}"#,
        )
        .unwrap();
        assert_eq!(params.get("vms"), Some("vm1 vm2"));
        assert_eq!(params.get("memory_kib"), Some("2097152"));
        assert_eq!(params.get("status_error"), Some("no"));
        assert_eq!(params.get("connect_uri"), Some("qemu:///system"));

        Params::from_json_str("[1, 2]").unwrap_err();
        Params::from_json_str(r#"{"nested": {"a": 1}}"#).unwrap_err();
        Params::from_json_str("not json").unwrap_err();
    }

    #[test]
    fn test_merge() {
        let mut base = Params::from_pairs(&[("main_vm", "vm1"), ("login_timeout", "240")]);
        let overrides = Params::from_pairs(&[("main_vm", "vm2")]);
        base.merge(&overrides);
        assert_eq!(base.get("main_vm"), Some("vm2"));
        assert_eq!(base.get("login_timeout"), Some("240"));
        assert_eq!(base.iter().count(), 2);
    }

    #[test]
    fn check_dequote() {
        assert_eq!(dequote("a\u{3b2}\"a\"\"\""), "a\u{3b2}a\"");
        assert_eq!(dequote("\"a,b\""), "a,b");
    }
}
