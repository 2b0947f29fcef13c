//! `tor-ingress render`: build the torrc from the manifests without a
//! running controller.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;

use tor_ingress_core::{
    ControllerConfig, HiddenServiceSpec, IngressStore, SecretStore, ServiceRegistry,
};
use tor_ingress_daemon::ManifestStore;
use tor_ingress_sync::TorrcWriter;

#[derive(Args, Debug)]
pub struct RenderArgs {
    /// Print a unified diff against the on-disk torrc instead of the file.
    #[arg(long)]
    pub diff: bool,
}

impl RenderArgs {
    pub fn run(self, config: ControllerConfig) -> Result<()> {
        let store = ManifestStore::new(&config.source);
        store.full_scan().with_context(|| {
            format!(
                "failed to scan manifests in {}",
                config.source.manifests_dir.display()
            )
        })?;

        let registry = build_registry(&config, &store)?;
        let writer = TorrcWriter::from_config(&config).context("failed to set up torrc writer")?;

        if !self.diff {
            print!("{}", writer.render(&registry).context("render failed")?);
            return Ok(());
        }

        match writer.diff(&registry).context("diff failed")? {
            None => println!("No differences for {}.", writer.torrc_path().display()),
            Some(diff) => {
                print!("{}", diff.unified_diff);
                if !diff.unified_diff.ends_with('\n') {
                    println!();
                }
            }
        }
        Ok(())
    }
}

/// Register every servable ingress the store knows. Skipped and unresolvable
/// ingresses are reported on stderr and left out.
fn build_registry(config: &ControllerConfig, store: &ManifestStore) -> Result<ServiceRegistry> {
    let mut registry = ServiceRegistry::new(&config.tor.services_root);

    for key in store.ingress_keys() {
        let Some(ingress) = store.get_by_key(&key)? else {
            continue;
        };
        let exposure = match ingress.exposure() {
            Ok(exposure) => exposure,
            Err(reason) => {
                eprintln!("{} {key}: {reason}", "skip".yellow());
                continue;
            }
        };

        let namespace = ingress.namespace();
        let backend = exposure.backend;
        let backend_address = match store.backend_address(namespace, &backend.service_name) {
            Ok(address) => address,
            Err(err) => {
                eprintln!("{} {key}: {err}", "skip".yellow());
                continue;
            }
        };
        let private_key = match exposure.private_key_secret {
            Some(secret) => store.get_secret(namespace, secret)?,
            None => None,
        };

        registry
            .upsert(HiddenServiceSpec {
                key: key.clone(),
                backend_name: backend.service_name.clone(),
                backend_address,
                backend_port: backend.service_port,
                public_port: exposure.public_port,
                private_key,
            })
            .with_context(|| format!("cannot register '{key}'"))?;
    }

    Ok(registry)
}
