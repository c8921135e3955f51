//! certwarden configuration
//!
//! Reads the nginx configuration that certwarden supervises and derives the
//! certificate coverage it implies:
//!
//! - [`ConfigSet`] - the main file plus everything reachable via `include`
//! - [`collect_server_names`] - `server_name` directive extraction
//! - [`group_server_names`] - grouping by registrable domain in canonical order
//! - [`Fingerprint`] - content hash used to detect configuration edits
//!
//! # Example
//!
//! ```no_run
//! use certwarden_config::ConfigSet;
//! use std::path::Path;
//!
//! let set = ConfigSet::load(Path::new("/etc/nginx/nginx.conf"))?;
//! for (domain, names) in set.domain_groups() {
//!     println!("{domain}: {}", names.join(" "));
//! }
//! # Ok::<(), certwarden_config::ConfigError>(())
//! ```

pub mod domains;
pub mod error;
pub mod fingerprint;
pub mod server_names;
pub mod sources;

pub use domains::{domain_sort, group_server_names, registrable_domain, reversed_fqdn, DomainGroups};
pub use error::ConfigError;
pub use fingerprint::Fingerprint;
pub use server_names::{collect_server_names, normalize_server_name};
pub use sources::{ConfigSet, ConfigSource};
