use std::path::PathBuf;

fn main() {
    // Embed the per-architecture vmnet tarball when the release pipeline
    // provides one. Without it an empty placeholder is embedded and the
    // vmnet dependency reports that the assets are missing at install time.
    println!("cargo:rerun-if-env-changed=HOSTLINK_VMNET_ASSETS");

    let arch = std::env::var("CARGO_CFG_TARGET_ARCH").unwrap_or_default();
    let out_dir = PathBuf::from(std::env::var("OUT_DIR").expect("OUT_DIR is set by cargo"));
    let target = out_dir.join("vmnet.tar.gz");

    let source = std::env::var("HOSTLINK_VMNET_ASSETS")
        .ok()
        .map(|dir| PathBuf::from(dir).join(format!("vmnet-{arch}.tar.gz")))
        .filter(|path| path.exists());

    match source {
        Some(path) => {
            println!("cargo:rerun-if-changed={}", path.display());
            std::fs::copy(&path, &target).expect("copy vmnet tarball into OUT_DIR");
        }
        None => {
            std::fs::write(&target, []).expect("write empty vmnet placeholder");
        }
    }
}
