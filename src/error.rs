//! Crate-wide error taxonomy.
//!
//! Each module defines its own `thiserror` error type carrying the context
//! that matters there (container id, domain, network name, exit status).
//! This module wraps them into one [`Error`] with a [`Kind`] accessor, so
//! callers that only care about the failure class (the reconcile loop, the
//! binaries) can branch and log uniformly.

use std::fmt::{Display, Formatter, Result as FmtResult};

use crate::{
	acme::AcmeError, certs::CertError, config::ConfigError, gateway::GatewayError,
	runtime::RuntimeError, spec::ParseError,
};

/// The broad class of a failure, used for logging and propagation policy.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Kind {
	/// Container runtime requests (list, inspect, event stream)
	Runtime,
	/// Gateway interaction (config write, validate, reload)
	Gateway,
	/// Controller configuration (environment parsing)
	Config,
	/// Network inspection and reachability
	Network,
	/// Per-container spec parsing and backend derivation
	Container,
	/// Certificate storage and ACME issuance
	Ssl,
	/// Everything else (shutdown plumbing, logging setup)
	System,
}

impl Display for Kind {
	fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
		fmt.write_str(match self {
			Self::Runtime => "runtime",
			Self::Gateway => "gateway",
			Self::Config => "config",
			Self::Network => "network",
			Self::Container => "container",
			Self::Ssl => "ssl",
			Self::System => "system",
		})
	}
}

/// Any error produced by this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
	/// A `VIRTUAL_HOST`-family value could not be parsed
	#[error(transparent)]
	Parse(#[from] ParseError),
	/// The container runtime could not be queried
	#[error(transparent)]
	Runtime(#[from] RuntimeError),
	/// The gateway rejected or failed a config write / validate / reload
	#[error(transparent)]
	Gateway(#[from] GatewayError),
	/// The controller configuration is invalid
	#[error(transparent)]
	Config(#[from] ConfigError),
	/// Certificate storage or fallback generation failed
	#[error(transparent)]
	Cert(#[from] CertError),
	/// ACME issuance failed
	#[error(transparent)]
	Acme(#[from] AcmeError),
	/// Anything that doesn't fit the other classes
	#[error("{0}")]
	System(String),
}

impl Error {
	/// The broad failure class of this error.
	#[must_use]
	pub fn kind(&self) -> Kind {
		match self {
			Self::Parse(_) => Kind::Container,
			Self::Runtime(err) => err.kind(),
			Self::Gateway(_) => Kind::Gateway,
			Self::Config(_) => Kind::Config,
			Self::Cert(_) | Self::Acme(_) => Kind::Ssl,
			Self::System(_) => Kind::System,
		}
	}
}

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
