// src/installer/runtime.rs

//! Runtime prerequisites for packages that run workloads
//!
//! Providers and functions get a service account, a service and a TLS
//! credentials secret, named after the package. They are created once and
//! never updated; scheduling the workload itself happens elsewhere.

use super::{InstallContext, InstallStep};
use crate::db::models::PackageType;
use crate::db::{ObjectStore, Record};
use crate::error::{Error, Result};
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

pub const SERVICE_ACCOUNT_KIND: &str = "ServiceAccount";
pub const SERVICE_KIND: &str = "Service";
pub const SECRET_KIND: &str = "Secret";

/// Name of the TLS credentials secret for a package
pub fn tls_secret_name(package: &str) -> String {
    format!("{package}-tls")
}

pub struct RuntimeBootstrapper {
    store: Arc<dyn ObjectStore>,
}

impl RuntimeBootstrapper {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    fn create_if_absent(&self, record: Record) -> Result<()> {
        if self.store.get(&record.kind, record.name())?.is_some() {
            return Ok(());
        }
        debug!("Creating {} {:?}", record.kind, record.name());
        match self.store.create(record) {
            Ok(_) => Ok(()),
            Err(Error::AlreadyExists { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl InstallStep for RuntimeBootstrapper {
    fn name(&self) -> &str {
        "runtime-bootstrapper"
    }

    fn run(&self, ctx: &mut InstallContext<'_>) -> Result<()> {
        if !ctx.revision()?.is_active() {
            return Ok(());
        }
        let package = ctx.package()?;
        let name = package.name();
        let owner = package.owner_reference(true);

        let port = match package.spec.package_type {
            PackageType::Provider | PackageType::Function => 9443,
            PackageType::Configuration => return Ok(()),
        };

        let mut records = vec![
            Record::new(SERVICE_ACCOUNT_KIND, name, json!({})),
            Record::new(
                SERVICE_KIND,
                name,
                json!({ "selector": { "package": name }, "port": port }),
            ),
            Record::new(
                SECRET_KIND,
                tls_secret_name(name),
                json!({ "type": "tls", "service": name }),
            ),
        ];
        for record in &mut records {
            record.metadata.set_owner(owner.clone());
        }

        for record in records {
            ctx.deadline.check("bootstrapping runtime")?;
            self.create_if_absent(record)?;
        }
        Ok(())
    }
}
