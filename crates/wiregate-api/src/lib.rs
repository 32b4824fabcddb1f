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

pub mod allocator;
pub mod apply;
pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod extract;
pub mod keys;
pub mod middleware;
pub mod password;
pub mod policy;
pub mod provision;
pub mod public_ip;
pub mod render;
pub mod routes;
pub mod validate;
