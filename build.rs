fn main() {
    println!("cargo:rerun-if-env-changed=TPM_COUNTERSIGN_BUILD_STATIC");
    if let Some(build_static) = option_env!("TPM_COUNTERSIGN_BUILD_STATIC") {
        if matches!(
            build_static.to_lowercase().as_ref(),
            "1" | "y" | "yes" | "true"
        ) {
            // initramfs images ship without a dynamic loader
            println!("cargo:rustc-link-arg-bins=-static");
            println!("cargo:rustc-link-arg-bins=-l:libc.a");
            println!("cargo:rustc-link-search=/usr/lib");
        }
    }
}
