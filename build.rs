fn main() {
    // ── macOS: embed Info.plist so CoreBluetooth grants Bluetooth access ──────
    //
    // CBCentralManager stays "unauthorised" and silently refuses to scan
    // unless the running binary carries an Info.plist with
    // NSBluetoothAlwaysUsageDescription.  For a CLI tool the plist goes into
    // the __TEXT,__info_plist section of the Mach-O binary via the linker
    // `-sectcreate` flag, which macOS reads like an app bundle's Info.plist.
    //
    // `CARGO_CFG_TARGET_OS` is the target OS, so cross-compiling works too.
    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("macos") {
        let Ok(dir) = std::env::var("CARGO_MANIFEST_DIR") else {
            println!("cargo:warning=CARGO_MANIFEST_DIR unset, not embedding Info.plist");
            return;
        };
        let plist = format!("{dir}/Info.plist");

        // ld … -sectcreate __TEXT __info_plist /path/to/Info.plist …
        for arg in ["-sectcreate", "__TEXT", "__info_plist", plist.as_str()] {
            println!("cargo:rustc-link-arg={arg}");
        }
        println!("cargo:rerun-if-changed=Info.plist");
    }
}
