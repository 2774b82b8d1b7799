//! Build script for remote-gpio
//!
//! Embeds build-time information into the binary:
//! - Git commit hash, branch and dirty flag
//! - Build timestamp
//! - Target / host triples and profile
//! - Rust version

use std::env;
use std::process::Command;

fn main() {
    // Rerun if git HEAD changes
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/index");

    let git_hash = command_output("git", &["rev-parse", "--short=8", "HEAD"]);
    let git_branch = command_output("git", &["rev-parse", "--abbrev-ref", "HEAD"]);
    let git_dirty = is_git_dirty();
    let rustc_version = command_output("rustc", &["--version"]);

    let build_timestamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string();
    let target = env::var("TARGET").unwrap_or_else(|_| "unknown".to_string());
    let profile = env::var("PROFILE").unwrap_or_else(|_| "unknown".to_string());
    let host = env::var("HOST").unwrap_or_else(|_| "unknown".to_string());

    let embedded = [
        ("REMOTE_GPIO_GIT_HASH", git_hash.as_str()),
        ("REMOTE_GPIO_GIT_BRANCH", git_branch.as_str()),
        ("REMOTE_GPIO_GIT_DIRTY", git_dirty),
        ("REMOTE_GPIO_BUILD_TIMESTAMP", build_timestamp.as_str()),
        ("REMOTE_GPIO_TARGET", target.as_str()),
        ("REMOTE_GPIO_PROFILE", profile.as_str()),
        ("REMOTE_GPIO_RUSTC_VERSION", rustc_version.as_str()),
        ("REMOTE_GPIO_HOST", host.as_str()),
    ];
    for (key, value) in embedded {
        println!("cargo:rustc-env={}={}", key, value);
    }

    eprintln!("Building remote-gpio:");
    eprintln!("  Git:     {}{}", git_hash, if git_dirty == "true" { " (dirty)" } else { "" });
    eprintln!("  Branch:  {}", git_branch);
    eprintln!("  Target:  {}", target);
    eprintln!("  Profile: {}", profile);
}

/// Run a command and return its trimmed stdout, or "unknown" on any failure
fn command_output(program: &str, args: &[&str]) -> String {
    Command::new(program)
        .args(args)
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Check if the git working directory is dirty
fn is_git_dirty() -> &'static str {
    Command::new("git")
        .args(["status", "--porcelain"])
        .output()
        .ok()
        .map(|output| {
            if output.status.success() && !output.stdout.is_empty() {
                "true"
            } else {
                "false"
            }
        })
        .unwrap_or("unknown")
}
