use std::path::Path;

fn main() {
    println!("cargo::rustc-check-cfg=cfg(has_libnuma)");

    // Link libnuma only when it is actually installed, so single-node
    // hosts without the library still build. numa.rs falls back to
    // plain allocation when the cfg is absent.
    //
    // Hosts with only the runtime package (libnuma.so.1) and no -dev
    // package lack the unversioned libnuma.so symlink that `-lnuma`
    // requires, so those candidates are linked by exact file name via
    // `-l:` instead.
    let dev_candidates = [
        "/usr/lib/x86_64-linux-gnu/libnuma.so",
        "/usr/lib64/libnuma.so",
        "/usr/lib/libnuma.so",
    ];
    let runtime_candidates = [
        "/usr/lib/x86_64-linux-gnu/libnuma.so.1",
        "/usr/lib64/libnuma.so.1",
        "/usr/lib/libnuma.so.1",
    ];
    if !cfg!(target_os = "linux") {
        return;
    }
    if dev_candidates.iter().any(|p| Path::new(p).exists()) {
        println!("cargo:rustc-link-lib=numa");
        println!("cargo:rustc-cfg=has_libnuma");
    } else if runtime_candidates.iter().any(|p| Path::new(p).exists()) {
        println!("cargo:rustc-link-lib=dylib:+verbatim=libnuma.so.1");
        println!("cargo:rustc-cfg=has_libnuma");
    }
}
