// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Field validation producing `validation.<tag>|k=v` tokens per field.
//!
//! Shape rules come from the request types' `Validate` derives and are
//! translated here; the address, CIDR and DNS checks below need `ipnetwork`
//! and stay server side. Each field keeps at most one token (the first
//! failure wins, with `required` ahead of everything else).

use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnetwork::{IpNetwork, Ipv4Network};
use serde_json::Value;
use validator::{Validate, ValidationError, ValidationErrors};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldErrors(BTreeMap<String, String>);

impl fmt::Display for FieldErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (field, token) in &self.0 {
            if !first {
                f.write_str(", ")?;
            }
            write!(f, "{field}: {token}")?;
            first = false;
        }
        Ok(())
    }
}

impl From<&ValidationErrors> for FieldErrors {
    fn from(errors: &ValidationErrors) -> Self {
        let mut out = FieldErrors::new();
        for (field, list) in errors.field_errors() {
            let chosen = list
                .iter()
                .find(|e| e.code == "required")
                .or_else(|| list.first());
            if let Some(err) = chosen {
                let (tag, params) = describe(err);
                out.add_with(&field.to_string(), &tag, &params);
            }
        }
        out
    }
}

impl FieldErrors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs the derived shape rules of `value`.
    pub fn validate<T: Validate>(value: &T) -> Self {
        match value.validate() {
            Ok(()) => Self::new(),
            Err(errors) => Self::from(&errors),
        }
    }

    pub fn single(field: &str, tag: &str) -> Self {
        let mut errs = Self::new();
        errs.add(field, tag);
        errs
    }

    pub fn add(&mut self, field: &str, tag: &str) {
        self.add_with(field, tag, &[]);
    }

    pub fn add_with(&mut self, field: &str, tag: &str, params: &[(&str, String)]) {
        let mut token = format!("validation.{tag}");
        for (k, v) in params {
            token.push_str(&format!("|{k}={v}"));
        }
        self.0.entry(field.to_string()).or_insert(token);
    }

    /// Reports `from` under the name clients send it as.
    pub fn rename(&mut self, from: &str, to: &str) {
        if let Some(token) = self.0.remove(from) {
            self.0.entry(to.to_string()).or_insert(token);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.0.get(field).map(String::as_str)
    }

    pub fn into_map(self) -> BTreeMap<String, String> {
        self.0
    }

    pub fn finish(self) -> Result<(), FieldErrors> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }

    // -- Network checks ------------------------------------------------------

    pub fn ipv4_cidr(&mut self, field: &str, value: &str) -> Option<Ipv4Network> {
        match value.trim().parse::<Ipv4Network>() {
            Ok(net) => Some(net),
            Err(_) => {
                self.add(field, "cidrv4");
                None
            }
        }
    }

    /// Comma-separated CIDRs (IPv4 or IPv6); empty is allowed.
    pub fn cidr_list(&mut self, field: &str, value: &str) -> bool {
        if !self.printable(field, value) {
            return false;
        }
        let valid = entries(value).all(|e| e.parse::<IpNetwork>().is_ok());
        if !valid {
            self.add(field, "cidr");
        }
        valid
    }

    /// Comma-separated DNS servers or search domains; empty is allowed.
    pub fn dns_list(&mut self, field: &str, value: &str) -> bool {
        if !self.printable(field, value) {
            return false;
        }
        let valid = entries(value).all(|e| e.parse::<IpAddr>().is_ok() || is_hostname(e));
        if !valid {
            self.add(field, "dns");
        }
        valid
    }

    /// `host:port` or `[v6]:port`; empty is allowed.
    pub fn endpoint(&mut self, field: &str, value: &str) -> bool {
        let value = value.trim();
        if value.is_empty() {
            return true;
        }
        let valid = value.rsplit_once(':').is_some_and(|(host, port)| {
            let host_ok = match host.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
                Some(v6) => v6.parse::<Ipv6Addr>().is_ok(),
                None => is_hostname(host) || host.parse::<Ipv4Addr>().is_ok(),
            };
            host_ok && port.parse::<u16>().is_ok_and(|p| p != 0)
        });
        if !valid {
            self.add(field, "endpoint");
        }
        valid
    }

    pub fn host(&mut self, field: &str, value: &str) -> bool {
        let value = value.trim();
        let valid = value.is_empty() || value.parse::<IpAddr>().is_ok() || is_hostname(value);
        if !valid {
            self.add(field, "hostname");
        }
        valid
    }

    fn printable(&mut self, field: &str, value: &str) -> bool {
        if value.chars().any(char::is_control) {
            self.add(field, "printable");
            return false;
        }
        true
    }
}

/// Maps a derived rule failure to a token tag and its parameters. Length and
/// range failures name the bound that was crossed.
fn describe(err: &ValidationError) -> (String, Vec<(&'static str, String)>) {
    let bound = |key: &'static str| err.params.get(key).map(param_text);
    let crossed = match &*err.code {
        "length" => err
            .params
            .get("value")
            .and_then(Value::as_str)
            .map(|v| v.chars().count() as f64),
        "range" => err.params.get("value").and_then(Value::as_f64),
        _ => None,
    };

    if let Some(actual) = crossed {
        let below = err
            .params
            .get("min")
            .and_then(Value::as_f64)
            .is_some_and(|min| actual < min);
        let key = if below { "min" } else { "max" };
        if let Some(limit) = bound(key) {
            return (key.into(), vec![(key, limit)]);
        }
    }

    let mut params: Vec<(&'static str, String)> = ["min", "max", "equal"]
        .into_iter()
        .filter_map(|key| bound(key).map(|v| (key, v)))
        .collect();
    params.sort_by_key(|(key, _)| *key != "min");
    (err.code.to_string(), params)
}

fn param_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => match n.as_f64() {
            Some(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", f as i64),
            _ => n.to_string(),
        },
        other => other.to_string(),
    }
}

fn entries(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|e| !e.is_empty())
}

fn is_hostname(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= 253
        && value.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}
