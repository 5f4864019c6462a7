//! Node bootstrap user data.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

const BOOTSTRAP_SCRIPT: &str = "/etc/eks/bootstrap.sh";

/// Base64-encoded user data that joins an instance to `cluster_name`.
///
/// `pre_bootstrap` runs before the bootstrap script.
pub(crate) fn bootstrap_user_data(
    cluster_name: &str,
    pre_bootstrap: Option<&str>,
    bootstrap_arguments: Option<&str>,
) -> String {
    let mut script = String::from("#!/bin/bash\nset -o xtrace\n");

    if let Some(pre) = pre_bootstrap.map(str::trim).filter(|s| !s.is_empty()) {
        script.push_str(pre);
        script.push('\n');
    }

    script.push_str(BOOTSTRAP_SCRIPT);
    script.push(' ');
    script.push_str(cluster_name);
    if let Some(args) = bootstrap_arguments.map(str::trim).filter(|s| !s.is_empty()) {
        script.push(' ');
        script.push_str(args);
    }
    script.push('\n');

    STANDARD.encode(script)
}
