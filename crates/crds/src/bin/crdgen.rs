//! Prints all Metalstack CRD manifests as multi-document YAML.
//!
//! Usage: `cargo run --bin crdgen > config/crds.yaml`

use crds::{MetalCluster, MetalMachine, MetalMachineTemplate, ServerBinding};
use kube::CustomResourceExt;

fn main() -> Result<(), serde_yaml::Error> {
    let crds = [
        serde_yaml::to_string(&MetalCluster::crd())?,
        serde_yaml::to_string(&MetalMachine::crd())?,
        serde_yaml::to_string(&MetalMachineTemplate::crd())?,
        serde_yaml::to_string(&ServerBinding::crd())?,
    ];

    for doc in crds {
        println!("---");
        print!("{doc}");
    }

    Ok(())
}
