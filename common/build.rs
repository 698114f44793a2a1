use std::process::Command;

/// `git describe` of the workspace checkout, if there is one and git is installed.
fn git_describe() -> Option<String> {
    let output = Command::new("git")
        .current_dir("..")
        .args(["describe", "--tags", "--long", "--always", "--dirty"])
        .output()
        .ok()
        .filter(|output| output.status.success())?;
    let describe = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!describe.is_empty()).then_some(describe)
}

fn main() {
    if let Some(describe) = git_describe() {
        println!("cargo:rustc-env=SFTP_PUBLISH_GIT_DESCRIBE={describe}");
    }
    if std::path::Path::new("../.git").exists() {
        println!("cargo:rerun-if-changed=../.git/HEAD");
        println!("cargo:rerun-if-changed=../.git/refs");
    }
}
