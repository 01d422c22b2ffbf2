use std::env;
use std::process::Command;

const SHA_VAR: &str = "RECOXVAL_GIT_SHA";

/// Short revision of the checkout, if git is available.
fn checkout_revision() -> Option<String> {
    let output = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let sha = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!sha.is_empty()).then_some(sha)
}

fn main() {
    println!("cargo:rerun-if-env-changed={}", SHA_VAR);
    println!("cargo:rerun-if-changed=.git/HEAD");

    // Packaged builds have no .git directory and pass the revision explicitly
    let sha = env::var(SHA_VAR)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(checkout_revision);

    if let Some(sha) = sha {
        println!("cargo:rustc-env={}={}", SHA_VAR, sha);
    }
}
