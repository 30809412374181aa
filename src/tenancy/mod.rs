//! Per-tenant database lifecycle and request routing.
//!
//! The central database owns identity and the tenant registry; every
//! organization gets its own physical database holding its ACL and
//! business data. This module provides the name resolution,
//! pool-per-database routing, provisioning, access control and
//! lifecycle orchestration around that split.

pub mod acl;
pub mod catalog;
pub mod context;
pub mod deprovision;
pub mod lifecycle;
pub mod naming;
pub mod provision;
pub mod quota;
pub mod reconcile;
pub mod registry;
