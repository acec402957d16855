//! Build script: bakes the OAuth client id into the binary.

use std::env;

fn main() {
    // Load .env values (useful during development) before build-time macros read them
    let _ = dotenvy::dotenv();

    if let Ok(val) = env::var("GITLAB_TRAY_CLIENT_ID") {
        println!("cargo:rustc-env=GITLAB_TRAY_CLIENT_ID={}", val);
    }

    println!("cargo:rerun-if-env-changed=GITLAB_TRAY_CLIENT_ID");
    tauri_build::build()
}
