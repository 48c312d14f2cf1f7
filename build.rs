//! Records the git revision and build profile for `meridian version`.

use std::process::Command;

fn git(args: &[&str]) -> Option<String> {
    Command::new("git")
        .args(args)
        .output()
        .ok()
        .filter(|o| o.status.success())
        .and_then(|o| String::from_utf8(o.stdout).ok())
        .map(|s| s.trim().to_string())
}

fn main() {
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/index");
    println!("cargo:rerun-if-env-changed=MERIDIAN_GIT_SHA");

    // Packaged sources have no repository; a packager may pass the revision in.
    let sha = std::env::var("MERIDIAN_GIT_SHA")
        .ok()
        .filter(|s| !s.is_empty())
        .or_else(|| git(&["rev-parse", "--short=9", "HEAD"]));
    if let Some(sha) = sha {
        println!("cargo:rustc-env=MERIDIAN_GIT_SHA={sha}");
        let dirty = git(&["status", "--porcelain", "--untracked-files=no"])
            .is_some_and(|out| !out.is_empty());
        println!("cargo:rustc-env=MERIDIAN_GIT_DIRTY={}", u8::from(dirty));
    }

    let profile = std::env::var("PROFILE").unwrap_or_else(|_| "unknown".to_string());
    println!("cargo:rustc-env=MERIDIAN_BUILD_PROFILE={profile}");
}
