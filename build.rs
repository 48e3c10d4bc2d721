#[cfg(feature = "sidekiq")]
extern crate bindgen;

#[cfg(feature = "sidekiq")]
use std::env;
#[cfg(feature = "sidekiq")]
use std::path::PathBuf;

#[cfg(not(feature = "sidekiq"))]
fn main() {}

#[cfg(feature = "sidekiq")]
fn main() {
    let sdk = env::var("SIDEKIQ_SDK").unwrap_or_else(|_| String::from("/opt/sidekiq_sdk"));

    let bindings = bindgen::Builder::default()
        // Only the receive/transmit surface is bound, configuration stays in the vendor apps
        .header("wrapper.h")
        .whitelist_function("skiq_init")
        .whitelist_function("skiq_exit")
        .whitelist_function("skiq_receive")
        .whitelist_function("skiq_start_rx_streaming_multi_immediate")
        .whitelist_function("skiq_stop_rx_streaming_multi_immediate")
        .whitelist_function("skiq_write_iq_pack_mode")
        .whitelist_function("skiq_write_tx_transfer_mode")
        .whitelist_function("skiq_transmit")
        .whitelist_function("skiq_start_tx_streaming")
        .whitelist_function("skiq_stop_tx_streaming")
        .whitelist_function("skiq_register_tx_complete_callback")
        .whitelist_function("skiq_tx_block_allocate")
        .whitelist_function("skiq_tx_block_free")
        .whitelist_function("skiq_tx_set_block_timestamp")
        .whitelist_function("skiq_read_tx_num_late_timestamps")
        .whitelist_function("skiq_read_tx_num_underruns")
        .whitelist_var("SKIQ_TX_ASYNC_SEND_QUEUE_FULL")
        .whitelist_type("skiq_rx_status_t")
        .whitelist_type("skiq_xport_type_t")
        .whitelist_type("skiq_xport_init_level_t")
        .opaque_type("skiq_rx_block_t")
        .opaque_type("skiq_tx_block_t")
        .prepend_enum_name(false)
        .clang_arg(format!("-I{}/sidekiq_core/inc", sdk))
        .generate()
        .expect("Unable to generate libsidekiq bindings");

    let out_path = PathBuf::from(env::var("OUT_DIR").unwrap());
    bindings
        .write_to_file(out_path.join("bindings.rs"))
        .expect("Couldn't write bindings!");

    println!("cargo:rerun-if-changed=wrapper.h");
    println!("cargo:rerun-if-env-changed=SIDEKIQ_SDK");

    println!("cargo:rustc-link-lib=sidekiq");
    println!("cargo:rustc-link-search=native={}/lib", sdk);
    println!("cargo:rustc-link-lib=pthread");
    println!("cargo:rustc-link-lib=rt");
    println!("cargo:rustc-link-lib=usb-1.0");
}
