use std::{env, fs, path::PathBuf, process::Command};

fn main() {
    let pkg_version = env::var("CARGO_PKG_VERSION").unwrap_or_else(|_| "0.0.0".to_string());
    let git_sha = env::var("GIT_SHA")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .or_else(git_short_sha)
        .unwrap_or_else(|| "unknown".to_string());
    let dirty = env::var("GIT_DIRTY")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or_else(|| git_is_dirty().unwrap_or(false));
    let built_at = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
    let git_label = if git_sha == "unknown" {
        git_sha.clone()
    } else if dirty {
        format!("{git_sha}-dirty")
    } else {
        git_sha.clone()
    };
    let full_version = format!("{pkg_version} (git {git_label}, built {built_at})");

    let dest = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR not set")).join("version.rs");
    let contents = format!(
        "pub const VERSION: &str = \"{pkg_version}\";\n\
         pub const GIT_SHA: &str = \"{git_sha}\";\n\
         pub const GIT_DIRTY: bool = {dirty};\n\
         pub const BUILD_TIMESTAMP: &str = \"{built_at}\";\n\
         pub const GIT_LABEL: &str = \"{git_label}\";\n\
         pub const FULL_VERSION: &str = \"{full_version}\";\n"
    );
    fs::write(&dest, contents).expect("write version.rs");

    println!("cargo:rerun-if-env-changed=GIT_SHA");
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=../../.git/HEAD");
    println!("cargo:rerun-if-changed=../../.git/refs");
}

fn git_short_sha() -> Option<String> {
    let output = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()?;
    if output.status.success() {
        Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        None
    }
}

fn git_is_dirty() -> Option<bool> {
    Command::new("git")
        .args(["status", "--porcelain"])
        .output()
        .ok()
        .map(|output| !output.stdout.is_empty())
}
