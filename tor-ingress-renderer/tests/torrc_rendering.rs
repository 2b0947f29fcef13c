//! Rendering the torrc from a populated registry.

use std::path::Path;

use tempfile::TempDir;
use tor_ingress_core::types::{HiddenServiceSpec, ServiceKey};
use tor_ingress_core::ServiceRegistry;
use tor_ingress_renderer::{RenderError, TorrcRenderer};

fn spec(key: &str, backend: &str, address: &str, port: u16, public_port: u16) -> HiddenServiceSpec {
    HiddenServiceSpec {
        key: ServiceKey::from(key),
        backend_name: backend.to_string(),
        backend_address: address.to_string(),
        backend_port: port,
        public_port,
        private_key: None,
    }
}

fn registry_with(root: &Path, specs: Vec<HiddenServiceSpec>) -> ServiceRegistry {
    let mut registry = ServiceRegistry::new(root);
    for spec in specs {
        registry.upsert(spec).expect("upsert");
    }
    registry
}

#[test]
fn single_service_renders_expected_torrc() {
    let root = TempDir::new().unwrap();
    let registry = registry_with(
        root.path(),
        vec![spec("ns/app", "web", "10.0.0.5", 8080, 80)],
    );

    let out = TorrcRenderer::new().unwrap().render(&registry, None).unwrap();
    let dir = root.path().join("ns_app_web_8080");
    let expected = format!(
        "SocksPort 0\n\n# ns/app\nHiddenServiceDir {}/\nHiddenServicePort 80 10.0.0.5:8080\n",
        dir.display()
    );
    assert!(out.ends_with(&expected), "got:\n{out}");
}

#[test]
fn insertion_order_does_not_change_output() {
    let root = TempDir::new().unwrap();
    let a = spec("alpha/app", "web", "10.0.0.1", 80, 80);
    let b = spec("beta/app", "api", "10.0.0.2", 9000, 443);
    let c = spec("gamma/app", "web", "10.0.0.3", 8080, 80);

    let forward = registry_with(root.path(), vec![a.clone(), b.clone(), c.clone()]);
    let reverse = registry_with(root.path(), vec![c, b, a]);

    let renderer = TorrcRenderer::new().unwrap();
    let first = renderer.render(&forward, None).unwrap();
    let second = renderer.render(&reverse, None).unwrap();
    assert_eq!(first, second);

    let alpha = first.find("# alpha/app").unwrap();
    let beta = first.find("# beta/app").unwrap();
    let gamma = first.find("# gamma/app").unwrap();
    assert!(alpha < beta && beta < gamma, "{first}");
}

#[test]
fn removed_service_is_no_longer_rendered() {
    let root = TempDir::new().unwrap();
    let mut registry = registry_with(
        root.path(),
        vec![
            spec("ns/keep", "web", "10.0.0.1", 80, 80),
            spec("ns/drop", "web", "10.0.0.2", 80, 80),
        ],
    );
    registry.remove(&ServiceKey::from("ns/drop"));

    let out = TorrcRenderer::new().unwrap().render(&registry, None).unwrap();
    assert!(out.contains("# ns/keep"), "{out}");
    assert!(!out.contains("ns_drop"), "{out}");
    assert_eq!(out.matches("HiddenServiceDir").count(), 1);
}

#[test]
fn data_directory_is_rendered_when_configured() {
    let root = TempDir::new().unwrap();
    let registry = registry_with(root.path(), vec![]);
    let out = TorrcRenderer::new()
        .unwrap()
        .render(&registry, Some(Path::new("/var/lib/tor")))
        .unwrap();
    assert!(out.contains("SocksPort 0\nDataDirectory /var/lib/tor\n"), "{out}");
}

// ---------------------------------------------------------------------------
// Override template
// ---------------------------------------------------------------------------

#[test]
fn override_template_replaces_embedded() {
    let tmp = TempDir::new().unwrap();
    let template = tmp.path().join("torrc.tera");
    std::fs::write(
        &template,
        "Log notice stdout\r\n{% for s in services %}HiddenServiceDir {{ s.service_dir }}\r\n{% endfor %}",
    )
    .unwrap();

    let registry = registry_with(
        tmp.path(),
        vec![spec("ns/app", "web", "10.0.0.5", 8080, 80)],
    );
    let out = TorrcRenderer::with_template(Some(&template))
        .unwrap()
        .render(&registry, None)
        .unwrap();

    assert!(out.starts_with("Log notice stdout\n"), "{out}");
    assert!(!out.contains('\r'));
    assert!(!out.contains("SocksPort"));
}

#[test]
fn missing_override_template_is_io_error() {
    let tmp = TempDir::new().unwrap();
    let missing = tmp.path().join("nope.tera");
    let err = TorrcRenderer::with_template(Some(&missing))
        .err()
        .expect("missing template must fail");
    assert!(matches!(err, RenderError::Io { .. }), "got: {err}");
}

#[test]
fn malformed_override_template_is_tera_error() {
    let tmp = TempDir::new().unwrap();
    let template = tmp.path().join("bad.tera");
    std::fs::write(&template, "{% for s in services %}unterminated").unwrap();
    let err = TorrcRenderer::with_template(Some(&template))
        .err()
        .expect("bad template must fail");
    assert!(matches!(err, RenderError::Tera(_)), "got: {err}");
}
