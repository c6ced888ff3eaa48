//! Generate CRD YAML from Rust types.
//!
//! Usage:
//!   cargo run --bin crdgen                        # CRD to stdout
//!   cargo run --bin crdgen -- --out-dir ./crds    # written to a file

use std::path::PathBuf;

use anyhow::Context;
use kube::CustomResourceExt;
use nginx_ingress_operator::crd::nginx_ingress_controller::NginxIngressController;

fn main() -> anyhow::Result<()> {
    let out_dir: Option<PathBuf> = std::env::args()
        .skip_while(|a| a != "--out-dir")
        .nth(1)
        .map(PathBuf::from);

    let yaml = serde_yaml::to_string(&NginxIngressController::crd())?;

    match out_dir {
        Some(dir) => {
            std::fs::create_dir_all(&dir).context("failed to create output directory")?;
            let path = dir.join("nginxingresscontroller-crd.yaml");
            std::fs::write(&path, format!("---\n{yaml}"))
                .with_context(|| format!("failed to write {}", path.display()))?;
            eprintln!("wrote {}", path.display());
        }
        None => println!("---\n{yaml}"),
    }
    Ok(())
}
