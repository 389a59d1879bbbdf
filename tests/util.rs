//! Shared harness for the end-to-end reconciliation tests: an in-memory
//! runtime and gateway, a certificate manager whose issuer always fails
//! (so TLS hosts exercise the self-signed fallback), and a started
//! reconciler.

use std::{collections::HashMap, path::Path, sync::Arc};

use async_trait::async_trait;
use gangway::{
	acme::AcmeError,
	certs::{CertificateManager, Issuer},
	config::Config,
	gateway,
	reconciler::Reconciler,
	runtime::{
		self, AttachedNetwork, ContainerDetails, EventAction, EventScope, NetworkDetails,
		Runtime, RuntimeEvent,
	},
};
use tempfile::TempDir;

/// An issuer that refuses every order, driving the blacklist and
/// self-signed fallback paths.
#[derive(Debug, Default)]
pub struct RefusingIssuer;

#[async_trait]
impl Issuer for RefusingIssuer {
	async fn issue(
		&self,
		_domain: &str,
		_account_key: &Path,
		_domain_key: &Path,
		_cert_out: &Path,
	) -> Result<(), AcmeError> {
		Err(AcmeError::Protocol {
			what: "order",
			message: "refused by test issuer".to_string(),
		})
	}
}

pub struct Harness {
	pub runtime: runtime::Memory,
	pub gateway: gateway::Memory,
	pub certs: Arc<CertificateManager>,
	pub reconciler: Arc<Reconciler>,
	/// Holds the scratch directories open for the lifetime of the test.
	pub dirs: (TempDir, TempDir),
}

/// Build and start a reconciler against in-memory collaborators. The
/// "controller's own container" is registered under this process's
/// hostname, attached to the `frontend` network, so self-learning works
/// the same way it does in production.
pub async fn start() -> Harness {
	let ssl = TempDir::new().unwrap();
	let work = TempDir::new().unwrap();

	let vars: HashMap<String, String> = [
		("NGINX_CONF_DIR", work.path().join("conf").display().to_string()),
		("CHALLENGE_DIR", work.path().join("challenge").display().to_string()),
		("HTPASSWD_DIR", work.path().join("htpasswd").display().to_string()),
		("SSL_DIR", ssl.path().display().to_string()),
	]
	.into_iter()
	.map(|(k, v)| (k.to_string(), v))
	.collect();
	let config = Config::from_vars(&vars).unwrap();

	let mem_runtime = runtime::Memory::new();
	mem_runtime.upsert_network(NetworkDetails {
		id: "net-1".to_string(),
		name: "frontend".to_string(),
	});

	let own_hostname = hostname();
	mem_runtime.upsert_container(ContainerDetails {
		id: own_hostname.clone(),
		name: "gangway".to_string(),
		running: true,
		networks: vec![AttachedNetwork {
			id: "net-1".to_string(),
			name: "frontend".to_string(),
			address: Some("172.20.0.1".parse().unwrap()),
		}],
		..ContainerDetails::default()
	});

	let mem_gateway = gateway::Memory::new();
	let certs = Arc::new(
		CertificateManager::new(ssl.path().to_path_buf(), Arc::new(RefusingIssuer)).unwrap(),
	);

	let reconciler = Arc::new(Reconciler::new(
		Runtime::new(mem_runtime.clone()),
		gateway::Gateway::new(mem_gateway.clone()),
		Arc::clone(&certs),
		config,
	));

	reconciler.start().await.unwrap();

	Harness {
		runtime: mem_runtime,
		gateway: mem_gateway,
		certs,
		reconciler,
		dirs: (ssl, work),
	}
}

/// The hostname the reconciler will identify itself by.
pub fn hostname() -> String {
	::hostname::get().unwrap().to_string_lossy().into_owned()
}

/// A running container on the shared `frontend` network.
pub fn container(
	id: &str,
	ip: &str,
	env: &[(&str, &str)],
	exposed: &[u16],
) -> ContainerDetails {
	ContainerDetails {
		id: id.to_string(),
		name: format!("svc-{id}"),
		running: true,
		env: env
			.iter()
			.map(|(k, v)| ((*k).to_string(), (*v).to_string()))
			.collect(),
		networks: vec![AttachedNetwork {
			id: "net-1".to_string(),
			name: "frontend".to_string(),
			address: Some(ip.parse().unwrap()),
		}],
		exposed_ports: exposed.to_vec(),
	}
}

pub fn container_event(id: &str, action: EventAction) -> RuntimeEvent {
	RuntimeEvent {
		scope: EventScope::Container,
		action,
		actor: id.to_string(),
		container: None,
		time: 0,
	}
}

pub fn network_event(network: &str, container: &str, action: EventAction) -> RuntimeEvent {
	RuntimeEvent {
		scope: EventScope::Network,
		action,
		actor: network.to_string(),
		container: Some(container.to_string()),
		time: 0,
	}
}
