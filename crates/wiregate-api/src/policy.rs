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

//! Role-based access control over a static rule table.
//!
//! Rules are casbin-style lines embedded from `policy.csv`:
//!
//! ```text
//! p, user, wg_config:self, rotate
//! p, admin, wg_peer:any, *
//! g, admin, user
//! ```
//!
//! A query asks `allowed(role, "<resource>:<scope>", "<action>")`. Roles inherit
//! the grants of their `g` parents, `*` matches every action, and a grant on
//! scope `any` implies the same grant on `self`.

use std::collections::{HashMap, HashSet};
use std::fmt;

use uuid::Uuid;
use wiregate_types::Role;

const EMBEDDED: &str = include_str!("policy.csv");

#[derive(Debug, thiserror::Error)]
#[error("policy line {line}: {reason}")]
pub struct PolicyError {
    pub line: usize,
    pub reason: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    User,
    WgPeer,
    WgConfig,
    IpPool,
    WgServer,
}

impl Resource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::WgPeer => "wg_peer",
            Self::WgConfig => "wg_config",
            Self::IpPool => "ip_pool",
            Self::WgServer => "wg_server",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Own,
    Any,
}

impl Scope {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Own => "self",
            Self::Any => "any",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Read,
    List,
    Create,
    Update,
    UpdateSensitive,
    Delete,
    ChangePassword,
    Download,
    Rotate,
    Revoke,
    Apply,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::List => "list",
            Self::Create => "create",
            Self::Update => "update",
            Self::UpdateSensitive => "update_sensitive",
            Self::Delete => "delete",
            Self::ChangePassword => "change_password",
            Self::Download => "download",
            Self::Rotate => "rotate",
            Self::Revoke => "revoke",
            Self::Apply => "apply",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The authenticated caller as the policy sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub user_id: Uuid,
    pub role: Role,
}

impl Actor {
    /// `self` iff the caller owns the resource.
    pub fn scope_for(&self, owner: Uuid) -> Scope {
        if owner == self.user_id {
            Scope::Own
        } else {
            Scope::Any
        }
    }
}

#[derive(Debug, Default)]
pub struct Policy {
    grants: HashSet<(String, String, String)>,
    parents: HashMap<String, Vec<String>>,
}

impl Policy {
    pub fn load_embedded() -> Result<Self, PolicyError> {
        Self::parse(EMBEDDED)
    }

    pub fn parse(text: &str) -> Result<Self, PolicyError> {
        let mut policy = Self::default();
        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            let err = |reason| PolicyError { line: idx + 1, reason };
            match fields.as_slice() {
                ["p", role, object, action] => {
                    if !object.contains(':') {
                        return Err(err("object must be <resource>:<scope>"));
                    }
                    policy
                        .grants
                        .insert((role.to_string(), object.to_string(), action.to_string()));
                }
                ["g", role, parent] => {
                    policy
                        .parents
                        .entry(role.to_string())
                        .or_default()
                        .push(parent.to_string());
                }
                _ => return Err(err("expected `p, role, object, action` or `g, role, parent`")),
            }
        }
        Ok(policy)
    }

    fn roles_of<'a>(&'a self, role: &'a str) -> Vec<&'a str> {
        let mut seen = vec![role];
        let mut idx = 0;
        while idx < seen.len() {
            if let Some(parents) = self.parents.get(seen[idx]) {
                for parent in parents {
                    if !seen.contains(&parent.as_str()) {
                        seen.push(parent);
                    }
                }
            }
            idx += 1;
        }
        seen
    }

    fn granted(&self, role: &str, object: &str, action: &str) -> bool {
        let key = |a: &str| (role.to_string(), object.to_string(), a.to_string());
        self.grants.contains(&key(action)) || self.grants.contains(&key("*"))
    }

    pub fn allowed(&self, role: &str, object: &str, action: &str) -> bool {
        let widened = object
            .strip_suffix(":self")
            .map(|resource| format!("{resource}:any"));

        self.roles_of(role).into_iter().any(|r| {
            self.granted(r, object, action)
                || widened.as_deref().is_some_and(|any| self.granted(r, any, action))
        })
    }

    #[tracing::instrument(level = "debug", skip(self), ret)]
    pub fn check(&self, actor: &Actor, resource: Resource, scope: Scope, action: Action) -> bool {
        let object = format!("{}:{}", resource.as_str(), scope.as_str());
        self.allowed(actor.role.as_str(), &object, action.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn policy() -> Policy {
        Policy::load_embedded().unwrap()
    }

    #[test_case("user", "wg_config:self", "rotate", true ; "user rotates own config")]
    #[test_case("user", "wg_config:any", "rotate", false ; "user cannot rotate others")]
    #[test_case("user", "user:any", "change_password", false ; "user cannot change others password")]
    #[test_case("user", "wg_peer:self", "create", false ; "user cannot create peers")]
    #[test_case("user", "wg_peer:self", "update_sensitive", false ; "user cannot touch sensitive fields")]
    #[test_case("user", "ip_pool:any", "read", false ; "user cannot see pools")]
    #[test_case("admin", "wg_peer:any", "update_sensitive", true ; "admin wildcard")]
    #[test_case("admin", "wg_peer:self", "delete", true ; "any implies self")]
    #[test_case("admin", "user:self", "read", true ; "admin inherits user")]
    #[test_case("admin", "wg_server:any", "apply", true ; "admin applies")]
    #[test_case("ghost", "user:self", "read", false ; "unknown role")]
    fn embedded_rules(role: &str, object: &str, action: &str, expected: bool) {
        assert_eq!(policy().allowed(role, object, action), expected);
    }

    #[test]
    fn scope_follows_ownership() {
        let me = Uuid::new_v4();
        let actor = Actor {
            user_id: me,
            role: Role::User,
        };
        assert_eq!(actor.scope_for(me), Scope::Own);
        assert_eq!(actor.scope_for(Uuid::new_v4()), Scope::Any);
    }

    #[test]
    fn inheritance_cycles_terminate() {
        let p = Policy::parse("g, a, b\ng, b, a\np, b, x:any, read").unwrap();
        assert!(p.allowed("a", "x:self", "read"));
    }

    #[test_case("p, user, nocolon, read" ; "object without scope")]
    #[test_case("p, user, x:self" ; "missing action")]
    #[test_case("q, user, x:self, read" ; "unknown kind")]
    fn malformed_lines_rejected(text: &str) {
        assert_eq!(Policy::parse(text).unwrap_err().line, 1);
    }
}
