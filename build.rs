use std::{
    env,
    fs::{self, File},
    io::{self, Write},
    path::Path,
    process::Command,
};

fn main() {
    match write_version_file() {
        Ok(_) => {}
        Err(e) => panic!("Failed to create a version file: {:?}", e),
    }
}

fn write_version_file() -> io::Result<()> {
    let version = env::var("CARGO_PKG_VERSION").unwrap();
    let target = env::var("TARGET").unwrap();
    let version_fname = Path::new(&env::var("OUT_DIR").unwrap()).join("version_string");
    let mut version_file = File::create(&version_fname)?;
    write!(
        &mut version_file,
        "r#\"jobsh {} ({})\nrev {}\"#",
        version,
        target,
        get_git_rev().trim()
    )?;
    Ok(())
}

fn get_git_rev() -> String {
    Command::new("git")
        .args(&["rev-parse", "HEAD"])
        .output()
        .ok()
        .filter(|out| out.status.success())
        .and_then(|out| String::from_utf8(out.stdout).ok())
        .or_else(git_rev_from_file)
        .unwrap_or_else(|| "unknown".to_owned())
}

fn git_rev_from_file() -> Option<String> {
    let git_file = Path::new(&env::var("CARGO_MANIFEST_DIR").ok()?)
        .join(".git")
        .join("refs")
        .join("heads")
        .join("master");
    fs::read_to_string(git_file).ok()
}
