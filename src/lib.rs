//! sitegate - role-aware access-control gateway for static sites
//!
//! Identity comes either from an OIDC login run by the gateway itself or from
//! a signed token attached by a trusted edge proxy. Every page request is
//! checked against the site's access-control document.

pub mod authz;
pub mod content;
pub mod edge;
pub mod errors;
pub mod identity;
pub mod oidc;
pub mod rewrite;
pub mod session;
pub mod settings;
pub mod web;
