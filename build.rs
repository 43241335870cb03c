//! # Build Script
//!
//! Embeds `app.manifest` (through `app.rc`) into the Windows executables.
//!
//! Windows treats any unmanifested binary whose name contains "update" or "setup"
//! as an installer and forces a UAC prompt on launch. The manifest declares
//! `asInvoker`, so `update.exe` starts with the caller's privileges and only
//! elevates when it asks to (see `elevation.rs`).

fn main() {
    println!("cargo:rerun-if-changed=app.rc");
    println!("cargo:rerun-if-changed=app.manifest");

    // The manifest is a Windows resource; other targets have nothing to embed.
    if std::env::var("CARGO_CFG_WINDOWS").is_ok() {
        // A failed embed still yields a working binary, just one Windows may prompt for.
        let _ = embed_resource::compile("app.rc", embed_resource::NONE);
    }
}
