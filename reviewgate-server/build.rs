fn main() {
    built::write_built_file().expect("Failed to acquire build-time information");

    // Pass through REVIEWGATE_GIT_HASH from packaging environments without a .git directory
    println!("cargo:rerun-if-env-changed=REVIEWGATE_GIT_HASH");
    if let Ok(hash) = std::env::var("REVIEWGATE_GIT_HASH") {
        println!("cargo:rustc-env=REVIEWGATE_GIT_HASH={}", hash);
    }
}
