use kube::CustomResourceExt;
use retain_controller_apis::Retainer;
use serde_yaml;

pub fn main() {
    println!("{}", serde_yaml::to_string(&Retainer::crd()).unwrap());
}
