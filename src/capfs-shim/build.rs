fn main() {
    // execl/execle/execlp are unboundedly variadic; a C stub repacks their
    // argument lists before handing over to the Rust shims
    cc::Build::new().file("csrc/execl.c").compile("capfs_execl");
    println!("cargo:rerun-if-changed=csrc/execl.c");

    // the cdylib's export list only covers Rust-side #[no_mangle] symbols;
    // the C-defined entry points must be forced into the dynamic table or
    // the dynamic linker will never route calls to them
    for sym in ["execl", "execle", "execlp"] {
        println!("cargo:rustc-cdylib-link-arg=-Wl,--export-dynamic-symbol={sym}");
    }
}
