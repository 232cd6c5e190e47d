use kube::CustomResourceExt;
use serde_yaml;
use tenant_controller_apis::Tenant;

pub fn main() {
    println!("{}", serde_yaml::to_string(&Tenant::crd()).unwrap());
}
