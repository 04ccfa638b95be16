//! Deterministic names for the objects elasti creates next to a user's service.
use sha2::{Digest, Sha256};

pub const PREFIX: &str = "elasti-";
pub const FINALIZER: &str = "elasti.truefoundry.com/finalizer";

pub const RESOLVER_DEPLOYMENT_NAME: &str = "elasti-resolver";
pub const RESOLVER_SERVICE_NAME: &str = "elasti-resolver-service";
pub const RESOLVER_PORT: u16 = 8012;

pub const SERVICE_NAME_LABEL: &str = "kubernetes.io/service-name";
pub const OWNER_LABEL: &str = "elasti.io/owner";
pub const OWNER_LABEL_VALUE: &str = "elastiservice";

fn short_hash(name: &str) -> String {
    let digest = Sha256::digest(name.as_bytes());
    let mut hashed = hex::encode(digest);
    hashed.truncate(10);
    hashed
}

/// Name of the private mirror of a public service.
pub fn private_service_name(public_service: &str) -> String {
    format!("{PREFIX}{public_service}-pvt-{}", short_hash(public_service))
}

/// Base name of the endpoint slices that point a service at the resolver.
pub fn endpoint_slice_to_resolver_name(service: &str) -> String {
    format!(
        "{PREFIX}{service}-endpointslice-to-resolver-{}",
        short_hash(service)
    )
}

/// Name of the `index`-th slice copied from the resolver's slices.
pub fn indexed_endpoint_slice_name(service: &str, index: usize) -> String {
    format!("{}-{index}", endpoint_slice_to_resolver_name(service))
}

/// Key shared by the CRD directory, the lock families and the scale handler.
pub fn namespaced_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

/// Keep the first and last few characters of a value for log output.
pub fn mask_middle(value: &str, keep_start: usize, keep_end: usize) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= keep_start + keep_end {
        return value.to_string();
    }
    let head: String = chars[..keep_start].iter().collect();
    let tail: String = chars[chars.len() - keep_end..].iter().collect();
    format!("{head}{}{tail}", "*".repeat(chars.len() - keep_start - keep_end))
}
