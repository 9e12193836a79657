//! Prints the CRD manifests to stdout for `kubectl apply -f -`.

use kube::CustomResourceExt;

fn main() -> Result<(), serde_yaml::Error> {
    print!("{}", serde_yaml::to_string(&crds::VirtualMachine::crd())?);
    println!("---");
    print!("{}", serde_yaml::to_string(&crds::Credential::crd())?);
    Ok(())
}
