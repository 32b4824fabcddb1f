use std::process::Command;

fn main() {
    let version = Command::new("git")
        .args(["describe", "--tags", "--always", "--dirty"])
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    println!("cargo:rustc-env=GIT_VERSION={version}");
    println!("cargo::rustc-check-cfg=cfg(distribute)");

    if std::env::var("PROFILE").as_deref() == Ok("distribute") {
        println!("cargo:rustc-cfg=distribute");
    }

    println!("cargo:rerun-if-changed=migrations");
    println!("cargo:rerun-if-changed=src/policy.csv");
    println!("cargo:rerun-if-changed=.git/HEAD");
}
