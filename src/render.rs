//! Projection of the routing model into gateway configuration text.
//!
//! [`render`] is a pure function: same hosts and settings produce
//! byte-identical output, with no I/O, clock reads, or randomness. The
//! input is the consolidated host list from
//! [`RoutingModel::consolidate_for_render`](crate::model::RoutingModel::consolidate_for_render);
//! certificate names must already be resolved onto `ssl_file` by then,
//! since resolving them takes filesystem (and possibly ACME) work that
//! must not happen here.

use std::path::PathBuf;

use crate::{
	config::Config,
	model::{ExtraValue, Host, Location, INJECTED},
	spec::Scheme,
};

/// Everything the renderer needs besides the hosts themselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderSettings {
	/// Directory ACME HTTP-01 challenge tokens are served from
	pub challenge_dir: PathBuf,
	/// Root of the certificate store
	pub ssl_dir: PathBuf,
	/// Optional `client_max_body_size` value
	pub client_max_body_size: Option<String>,
	/// Diffie-Hellman parameter file referenced by TLS servers, if any
	pub dhparam_path: Option<PathBuf>,
}

impl RenderSettings {
	/// Derive render settings from the controller configuration.
	#[must_use]
	pub fn from_config(config: &Config) -> Self {
		Self {
			challenge_dir: config.challenge_dir.clone(),
			ssl_dir: config.ssl_dir.clone(),
			client_max_body_size: config.client_max_body_size.clone(),
			dhparam_path: Some(config.dhparam_path()),
		}
	}

	fn cert_path(&self, name: &str) -> PathBuf {
		self.ssl_dir.join("certs").join(format!("{name}.crt"))
	}

	fn key_path(&self, name: &str) -> PathBuf {
		self.ssl_dir.join("private").join(format!("{name}.key"))
	}
}

/// Render the consolidated host list into gateway configuration text.
#[must_use]
pub fn render(hosts: &[Host], settings: &RenderSettings) -> String {
	let mut out = String::with_capacity(4096);

	out.push_str("# Generated by gangway - do not edit, changes are overwritten on reconcile.\n\n");

	// Upgrade map for websocket pass-through: proxied connections carrying
	// an Upgrade header get "Connection: upgrade", everything else falls
	// back to plain HTTP.
	out.push_str("map $http_upgrade $connection_upgrade {\n");
	out.push_str("    default upgrade;\n");
	out.push_str("    '' close;\n");
	out.push_str("}\n");

	if !hosts.iter().any(|host| host.is_default_server) {
		catch_all_servers(&mut out, settings);
	}

	for host in hosts {
		render_host(&mut out, host, settings);
	}

	out
}

/// The catch-all servers answering 503 for unknown hostnames, emitted when
/// no host claimed the default-server role. The TLS variant uses the
/// synthetic default certificate so unknown HTTPS hostnames still complete
/// a handshake.
fn catch_all_servers(out: &mut String, settings: &RenderSettings) {
	out.push('\n');
	out.push_str("server {\n");
	out.push_str("    listen 80 default_server;\n");
	out.push_str("    server_name _;\n");
	challenge_location(out, settings);
	out.push_str("    location / {\n");
	out.push_str("        return 503;\n");
	out.push_str("    }\n");
	out.push_str("}\n");

	out.push('\n');
	out.push_str("server {\n");
	out.push_str("    listen 443 ssl http2 default_server;\n");
	out.push_str("    server_name _;\n");
	ssl_certificate_lines(out, "default", settings);
	out.push_str("    location / {\n");
	out.push_str("        return 503;\n");
	out.push_str("    }\n");
	out.push_str("}\n");
}

fn challenge_location(out: &mut String, settings: &RenderSettings) {
	out.push_str("    location ^~ /.well-known/acme-challenge/ {\n");
	out.push_str(&format!(
		"        alias {}/;\n",
		settings.challenge_dir.display()
	));
	out.push_str("        default_type text/plain;\n");
	out.push_str("    }\n");
}

fn ssl_certificate_lines(out: &mut String, name: &str, settings: &RenderSettings) {
	out.push_str(&format!(
		"    ssl_certificate {};\n",
		settings.cert_path(name).display()
	));
	out.push_str(&format!(
		"    ssl_certificate_key {};\n",
		settings.key_path(name).display()
	));
	if let Some(dhparam) = &settings.dhparam_path {
		out.push_str(&format!("    ssl_dhparam {};\n", dhparam.display()));
	}
}

fn render_host(out: &mut String, host: &Host, settings: &RenderSettings) {
	for upstream in &host.upstreams {
		out.push('\n');
		out.push_str(&format!("upstream {} {{\n", upstream.id));
		for backend in &upstream.backends {
			out.push_str(&format!("    server {}:{};\n", backend.address, backend.port));
		}
		out.push_str("}\n");
	}

	if host.ssl_enabled && host.ssl_redirect {
		http_companion_server(out, host, settings);
	}

	out.push('\n');
	out.push_str("server {\n");

	let default_server = if host.is_default_server {
		" default_server"
	} else {
		""
	};
	if host.ssl_enabled {
		out.push_str(&format!("    listen {} ssl http2{default_server};\n", host.port));
	} else {
		out.push_str(&format!("    listen {}{default_server};\n", host.port));
	}
	out.push_str(&format!("    server_name {};\n", host.hostname));

	if host.ssl_enabled {
		ssl_certificate_lines(out, effective_cert_name(host), settings);
	}

	if let Some(size) = &settings.client_max_body_size {
		out.push_str(&format!("    client_max_body_size {size};\n"));
	}

	if let Some(ExtraValue::List(directives)) = host.extras.get(INJECTED) {
		for directive in directives {
			out.push_str(&format!("    {};\n", directive.trim_end_matches(';')));
		}
	}

	if host.auth.enabled {
		out.push_str("    auth_basic \"Restricted\";\n");
		out.push_str(&format!("    auth_basic_user_file {};\n", host.auth.file));
	}

	if host.ip_filter.enabled {
		if let Some(header) = &host.ip_filter.real_ip_header {
			out.push_str(&format!("    real_ip_header {header};\n"));
			if host.ip_filter.recursive {
				out.push_str("    real_ip_recursive on;\n");
			}
			for net in &host.ip_filter.allow {
				out.push_str(&format!("    set_real_ip_from {net};\n"));
			}
		}
		for net in &host.ip_filter.allow {
			out.push_str(&format!("    allow {net};\n"));
		}
		if host.ip_filter.deny_all {
			out.push_str("    deny all;\n");
		}
	}

	if !host.ssl_enabled {
		challenge_location(out, settings);
	}

	if host.is_redirect {
		let scheme = if host.redirect_ssl { "https" } else { "http" };
		out.push_str("    location / {\n");
		out.push_str(&format!(
			"        return 301 {scheme}://{}$request_uri;\n",
			host.redirect_target
		));
		out.push_str("    }\n");
	} else if host.is_down || !host.has_routes() {
		out.push_str("    location / {\n");
		out.push_str("        return 503;\n");
		out.push_str("    }\n");
	} else {
		for location in host.locations.values() {
			render_location(out, location);
		}
	}

	out.push_str("}\n");
}

/// The plain-HTTP companion of a TLS host: answers ACME challenges and
/// sends everything else to HTTPS.
fn http_companion_server(out: &mut String, host: &Host, settings: &RenderSettings) {
	out.push('\n');
	out.push_str("server {\n");
	out.push_str("    listen 80;\n");
	out.push_str(&format!("    server_name {};\n", host.hostname));
	challenge_location(out, settings);
	out.push_str("    location / {\n");
	out.push_str("        return 301 https://$host$request_uri;\n");
	out.push_str("    }\n");
	out.push_str("}\n");
}

/// The certificate name a TLS server references: the resolved `ssl_file`,
/// or the synthetic default when resolution did not produce one.
fn effective_cert_name(host: &Host) -> &str {
	if host.ssl_file.is_empty() {
		"default"
	} else {
		&host.ssl_file
	}
}

fn render_location(out: &mut String, location: &Location) {
	out.push_str(&format!("    location {} {{\n", location.path));

	for directive in &location.injected {
		out.push_str(&format!("        {};\n", directive.trim_end_matches(';')));
	}

	if let Some(ExtraValue::List(directives)) = location.extras.get(INJECTED) {
		for directive in directives {
			out.push_str(&format!("        {};\n", directive.trim_end_matches(';')));
		}
	}

	if location.auth.enabled {
		out.push_str("        auth_basic \"Restricted\";\n");
		out.push_str(&format!(
			"        auth_basic_user_file {};\n",
			location.auth.file
		));
	}

	if location.is_static {
		out.push_str("    }\n");
		return;
	}

	let scheme = location.backend_scheme();
	let target = proxy_target(location);

	if scheme.is_grpc() {
		let pass_scheme = if scheme == Scheme::Grpcs { "grpcs" } else { "grpc" };
		out.push_str("        grpc_set_header Host $host;\n");
		out.push_str(&format!("        grpc_pass {pass_scheme}://{target};\n"));
	} else {
		let pass_scheme = match scheme {
			Scheme::Https | Scheme::Wss => "https",
			_ => "http",
		};

		out.push_str("        proxy_set_header Host $host;\n");
		out.push_str("        proxy_set_header X-Real-IP $remote_addr;\n");
		out.push_str("        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;\n");
		out.push_str("        proxy_set_header X-Forwarded-Proto $scheme;\n");

		if location.websocket || scheme.is_websocket() {
			out.push_str("        proxy_http_version 1.1;\n");
			out.push_str("        proxy_set_header Upgrade $http_upgrade;\n");
			out.push_str("        proxy_set_header Connection $connection_upgrade;\n");
			out.push_str("        proxy_read_timeout 1h;\n");
		}

		out.push_str(&format!("        proxy_pass {pass_scheme}://{target};\n"));
	}

	out.push_str("    }\n");
}

/// Where the location's traffic goes: the upstream name when load
/// balancing, the single backend address otherwise. The backend path is
/// appended when it differs from the external location path, so the
/// gateway rewrites the prefix.
fn proxy_target(location: &Location) -> String {
	let path = location
		.backends
		.values()
		.next()
		.map_or_else(|| "/".to_string(), |backend| backend.path.clone());
	let suffix = if path == location.path || path == "/" {
		String::new()
	} else {
		path
	};

	if location.upstream_enabled {
		format!("{}{suffix}", location.upstream_id)
	} else if let Some(backend) = location.backends.values().next() {
		format!("{}:{}{suffix}", backend.address, backend.port)
	} else {
		// Unreachable for non-static locations kept by the model, but the
		// renderer must stay total.
		"127.0.0.1:65535".to_string()
	}
}

#[cfg(test)]
mod tests {
	use std::net::IpAddr;

	use super::*;
	use crate::model::{Backend, Location, RoutingModel};

	fn settings() -> RenderSettings {
		RenderSettings {
			challenge_dir: PathBuf::from("/usr/share/nginx/challenge"),
			ssl_dir: PathBuf::from("/etc/nginx/ssl"),
			client_max_body_size: None,
			dhparam_path: Some(PathBuf::from("/etc/nginx/ssl/dhparam.pem")),
		}
	}

	fn backend(id: &str, last_octet: u8, port: u16) -> Backend {
		Backend {
			id: id.to_string(),
			address: IpAddr::from([172, 20, 0, last_octet]),
			port,
			scheme: Scheme::Http,
			path: "/".to_string(),
		}
	}

	fn host_with_backend(hostname: &str, port: u16, path: &str, b: Backend) -> Host {
		let mut location = Location::new(path);
		location.backends.insert(b.id.clone(), b);
		let mut host = Host::new(hostname, port);
		host.locations.insert(path.to_string(), location);
		host
	}

	#[test]
	fn output_is_deterministic() {
		let mut model = RoutingModel::new();
		model.add(host_with_backend("b.example.com", 80, "/", backend("c2", 3, 8080)));
		model.add(host_with_backend("a.example.com", 80, "/", backend("c1", 2, 8080)));
		let hosts = model.consolidate_for_render(None);

		assert_eq!(render(&hosts, &settings()), render(&hosts, &settings()));
	}

	#[test]
	fn plain_host_proxies_directly() {
		let mut model = RoutingModel::new();
		model.add(host_with_backend("example.com", 80, "/", backend("c1", 10, 8080)));
		let hosts = model.consolidate_for_render(None);

		let out = render(&hosts, &settings());

		assert!(out.contains("server_name example.com;"));
		assert!(out.contains("listen 80;"));
		assert!(out.contains("proxy_pass http://172.20.0.10:8080;"));
		assert!(!out.contains("upstream "));
	}

	#[test]
	fn two_backends_render_an_upstream() {
		let mut model = RoutingModel::new();
		model.add(host_with_backend("api.example.com", 80, "/", backend("c1", 2, 8080)));
		model.add(host_with_backend("api.example.com", 80, "/", backend("c2", 3, 8080)));
		let hosts = model.consolidate_for_render(None);

		let out = render(&hosts, &settings());

		assert!(out.contains("upstream api.example.com-80-root {"));
		assert!(out.contains("    server 172.20.0.2:8080;"));
		assert!(out.contains("    server 172.20.0.3:8080;"));
		assert!(out.contains("proxy_pass http://api.example.com-80-root;"));
	}

	#[test]
	fn tls_host_gets_cert_lines_and_http_companion() {
		let mut model = RoutingModel::new();
		let mut host = host_with_backend("app.example.com", 443, "/api", backend("c1", 2, 8080));
		host.ssl_enabled = true;
		host.ssl_file = "app.example.com".to_string();
		model.add(host);
		let hosts = model.consolidate_for_render(None);

		let out = render(&hosts, &settings());

		assert!(out.contains("listen 443 ssl http2;"));
		assert!(out.contains("ssl_certificate /etc/nginx/ssl/certs/app.example.com.crt;"));
		assert!(out.contains("ssl_certificate_key /etc/nginx/ssl/private/app.example.com.key;"));
		assert!(out.contains("ssl_dhparam /etc/nginx/ssl/dhparam.pem;"));
		assert!(out.contains("return 301 https://$host$request_uri;"));
		assert!(out.contains("location /api {"));
		assert!(out.contains("alias /usr/share/nginx/challenge/;"));
	}

	#[test]
	fn websocket_location_upgrades() {
		let mut model = RoutingModel::new();
		let mut b = backend("c1", 2, 3000);
		b.scheme = Scheme::Ws;
		model.add(host_with_backend("push.example.com", 80, "/socket", b));
		let hosts = model.consolidate_for_render(None);

		let out = render(&hosts, &settings());

		assert!(out.contains("map $http_upgrade $connection_upgrade {"));
		assert!(out.contains("proxy_set_header Upgrade $http_upgrade;"));
		assert!(out.contains("proxy_set_header Connection $connection_upgrade;"));
		assert!(out.contains("proxy_pass http://172.20.0.2:3000;"));
	}

	#[test]
	fn grpc_location_uses_grpc_pass() {
		let mut model = RoutingModel::new();
		let mut b = backend("c1", 2, 50051);
		b.scheme = Scheme::Grpc;
		model.add(host_with_backend("rpc.example.com", 80, "/", b));
		let hosts = model.consolidate_for_render(None);

		let out = render(&hosts, &settings());

		assert!(out.contains("grpc_pass grpc://172.20.0.2:50051;"));
		assert!(!out.contains("proxy_pass"));
	}

	#[test]
	fn redirect_host_returns_301() {
		let mut model = RoutingModel::new();
		let mut tls = host_with_backend("example.com", 443, "/", backend("c1", 2, 8080));
		tls.ssl_enabled = true;
		model.add(tls);
		model.add(Host::redirect_stub("old.example.com", "example.com", "c1"));
		let hosts = model.consolidate_for_render(None);

		let out = render(&hosts, &settings());

		assert!(out.contains("server_name old.example.com;"));
		assert!(out.contains("return 301 https://example.com$request_uri;"));
	}

	#[test]
	fn catch_all_appears_only_without_default_server() {
		let mut model = RoutingModel::new();
		model.add(host_with_backend("example.com", 80, "/", backend("c1", 2, 8080)));

		let without = render(&model.consolidate_for_render(None), &settings());
		assert!(without.contains("listen 80 default_server;"));
		assert!(without.contains("ssl_certificate /etc/nginx/ssl/certs/default.crt;"));

		let with = render(&model.consolidate_for_render(Some("example.com")), &settings());
		assert!(with.contains("listen 80 default_server;"));
		assert!(!with.contains("server_name _;"));
	}

	#[test]
	fn injected_directives_render_in_order() {
		let mut model = RoutingModel::new();
		let mut host = host_with_backend("example.com", 80, "/", backend("c1", 2, 8080));
		host.locations
			.get_mut("/")
			.unwrap()
			.inject("proxy_buffering off");
		host.locations
			.get_mut("/")
			.unwrap()
			.inject("client_max_body_size 50m");
		model.add(host);

		let out = render(&model.consolidate_for_render(None), &settings());
		let buffering = out.find("proxy_buffering off;").unwrap();
		let body_size = out.find("client_max_body_size 50m;").unwrap();

		assert!(buffering < body_size);
	}

	#[test]
	fn basic_auth_and_ip_filter_render() {
		let mut model = RoutingModel::new();
		let mut host = host_with_backend("example.com", 80, "/", backend("c1", 2, 8080));
		host.auth.enabled = true;
		host.auth.file = "/etc/nginx/htpasswd/example.com.htpasswd".to_string();
		host.ip_filter.enabled = true;
		host.ip_filter.deny_all = true;
		host.ip_filter.allow = vec!["10.0.0.0/8".parse().unwrap()];
		host.ip_filter.real_ip_header = Some("X-Forwarded-For".to_string());
		host.ip_filter.recursive = true;
		model.add(host);

		let out = render(&model.consolidate_for_render(None), &settings());

		assert!(out.contains("auth_basic_user_file /etc/nginx/htpasswd/example.com.htpasswd;"));
		assert!(out.contains("allow 10.0.0.0/8;"));
		assert!(out.contains("deny all;"));
		assert!(out.contains("real_ip_header X-Forwarded-For;"));
		assert!(out.contains("real_ip_recursive on;"));
		assert!(out.contains("set_real_ip_from 10.0.0.0/8;"));
	}

	#[test]
	fn unresolved_tls_host_falls_back_to_default_cert() {
		let mut model = RoutingModel::new();
		let mut host = host_with_backend("app.example.com", 443, "/", backend("c1", 2, 8080));
		host.ssl_enabled = true;
		model.add(host);

		let out = render(&model.consolidate_for_render(None), &settings());

		assert!(out.contains("ssl_certificate /etc/nginx/ssl/certs/default.crt;"));
	}

	#[test]
	fn static_location_renders_without_proxy() {
		let mut model = RoutingModel::new();
		let mut host = Host::new("docs.example.com", 80);
		let mut location = Location::new("/");
		location.is_static = true;
		location.inject("root /srv/docs");
		host.locations.insert("/".to_string(), location);
		model.add(host);

		let out = render(&model.consolidate_for_render(None), &settings());

		assert!(out.contains("root /srv/docs;"));
		assert!(!out.contains("proxy_pass"));
	}

	#[test]
	fn down_host_returns_503() {
		let mut model = RoutingModel::new();
		model.add(host_with_backend("real.example.com", 80, "/", backend("c1", 2, 8080)));
		model.add(Host::redirect_stub("old.example.com", "gone.example.com", "c1"));

		let out = render(&model.consolidate_for_render(None), &settings());

		assert!(out.contains("server_name gone.example.com;"));
		assert!(out.contains("return 503;"));
	}

	#[test]
	fn container_path_is_appended_when_it_differs() {
		let mut model = RoutingModel::new();
		let mut b = backend("c1", 2, 8080);
		b.path = "/internal".to_string();
		model.add(host_with_backend("example.com", 80, "/api", b));

		let out = render(&model.consolidate_for_render(None), &settings());

		assert!(out.contains("proxy_pass http://172.20.0.2:8080/internal;"));
	}

	#[test]
	fn renders_env_example_from_scratch() {
		// VIRTUAL_HOST=https://app.example.com -> :8080/api end to end at
		// the model level.
		let spec = crate::spec::parse("https://app.example.com -> :8080/api", false).unwrap();
		let mut location = Location::new(spec.external_path.clone());
		location.backends.insert(
			"c1".to_string(),
			Backend {
				id: "c1".to_string(),
				address: IpAddr::from([172, 20, 0, 10]),
				port: spec.container_port,
				scheme: spec.container_scheme,
				path: spec.container_path.clone(),
			},
		);
		let mut host = Host::new(spec.hostname.clone(), spec.server_port);
		host.scheme = spec.scheme;
		host.ssl_enabled = spec.ssl_enabled();
		host.locations.insert(spec.external_path.clone(), location);

		let mut model = RoutingModel::new();
		model.add(host);
		let out = render(&model.consolidate_for_render(None), &settings());

		assert!(out.contains("server_name app.example.com;"));
		assert!(out.contains("listen 443 ssl http2;"));
		assert!(out.contains("location /api {"));
		assert!(out.contains("proxy_pass http://172.20.0.10:8080;"));
	}
}
