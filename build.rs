use std::env;
use std::path::{Path, PathBuf};

/// Link flags and include directories of one native library.
struct NativeLink {
    include_dirs: Vec<PathBuf>,
}

/// Probe an installed rdma-core library through `pkg-config`.
///
/// Distributions that do not register the library to `pkg-config` fall back
/// to a plain `-l` flag, optionally pointed at `RDMA_CORE_LIB_DIR`.
fn link_rdma_core(name: &str, link_name: &str) -> NativeLink {
    if let Ok(lib) = pkg_config::Config::new()
        .statik(false)
        .cargo_metadata(true)
        .probe(name)
    {
        return NativeLink {
            include_dirs: lib.include_paths,
        };
    }

    if let Ok(lib_dir) = env::var("RDMA_CORE_LIB_DIR") {
        println!("cargo:rustc-link-search=native={}", lib_dir);
    }
    println!("cargo:rustc-link-lib={}", link_name);

    let include_dirs = env::var("RDMA_CORE_INCLUDE_DIR")
        .map(|dir| vec![PathBuf::from(dir)])
        .unwrap_or_default();
    NativeLink { include_dirs }
}

/// Build flow:
///
/// 1. Link `libibverbs` and `librdmacm`, preferring `pkg-config`.
/// 2. Generate bindings for the verbs and connection manager headers.
fn main() {
    // Refuse to compile on non-64-bit platforms.
    if cfg!(not(target_pointer_width = "64")) {
        panic!("`rdma-test` currently only supports 64-bit platforms");
    }

    println!("cargo:rerun-if-changed=src/bindings/verbs.h");
    println!("cargo:rerun-if-env-changed=RDMA_CORE_LIB_DIR");
    println!("cargo:rerun-if-env-changed=RDMA_CORE_INCLUDE_DIR");

    let verbs = link_rdma_core("libibverbs", "ibverbs");
    let cma = link_rdma_core("librdmacm", "rdmacm");

    let mut include_dirs = verbs.include_dirs;
    include_dirs.extend(cma.include_dirs);
    include_dirs.sort_unstable();
    include_dirs.dedup();
    gen_verb_bindings(include_dirs);
}

fn gen_verb_bindings(include_dirs: Vec<PathBuf>) {
    let include_args = include_dirs.iter().map(|p| format!("-I{}", p.display()));
    let builder = bindgen::builder()
        .clang_args(include_args)
        .header("src/bindings/verbs.h")
        .allowlist_function("ibv_.*")
        .allowlist_type("ibv_.*")
        .allowlist_type("verbs_.*")
        .allowlist_type("ib_uverbs_access_flags")
        .allowlist_function("rdma_.*")
        .allowlist_type("rdma_.*")
        .allowlist_var("RAI_.*")
        .opaque_type("pthread_.*")
        .blocklist_type("in6_addr")
        .blocklist_type("sockaddr")
        .blocklist_type("sockaddr_in")
        .blocklist_type("sockaddr_in6")
        .blocklist_type("sockaddr_storage")
        .blocklist_type("timespec")
        .blocklist_type("ibv_ah_attr")
        .blocklist_type("ibv_gid")
        .blocklist_type("ibv_global_route")
        .blocklist_type("ibv_send_wr")
        .blocklist_type("ibv_wc")
        .blocklist_function("ibv_poll_cq")
        .blocklist_function("ibv_post_send")
        .blocklist_function("ibv_post_recv")
        .blocklist_function("rdma_reg_msgs")
        .blocklist_function("rdma_post_send")
        .blocklist_function("rdma_post_recv")
        .blocklist_function("rdma_get_send_comp")
        .blocklist_function("rdma_get_recv_comp")
        .bitfield_enum("ibv_device_cap_flags")
        .bitfield_enum("ibv_port_cap_flags")
        .bitfield_enum("ibv_port_cap_flags2")
        .bitfield_enum("ibv_create_cq_wc_flags")
        .bitfield_enum("ibv_wc_flags")
        .bitfield_enum("ibv_access_flags")
        .bitfield_enum("ibv_qp_init_attr_mask")
        .bitfield_enum("ibv_qp_create_flags")
        .bitfield_enum("ibv_qp_attr_mask")
        .bitfield_enum("ibv_send_flags")
        .bitfield_enum("ibv_cq_init_attr_mask")
        .bitfield_enum("ib_uverbs_access_flags")
        .constified_enum_module("ibv_node_type")
        .constified_enum_module("ibv_transport_type")
        .constified_enum_module("ibv_atomic_cap")
        .constified_enum_module("ibv_mtu")
        .constified_enum_module("ibv_port_state")
        .constified_enum_module("ibv_wc_status")
        .constified_enum_module("ibv_wc_opcode")
        .constified_enum_module("ibv_mw_type")
        .constified_enum_module("ibv_rate")
        .constified_enum_module("ibv_srq_type")
        .constified_enum_module("ibv_wq_type")
        .constified_enum_module("ibv_wq_state")
        .constified_enum_module("ibv_qp_type")
        .constified_enum_module("ibv_qp_state")
        .constified_enum_module("ibv_mig_state")
        .constified_enum_module("ibv_wr_opcode")
        .constified_enum_module("ibv_ops_wr_opcode")
        .constified_enum_module("ibv_flow_attr_type")
        .constified_enum_module("ibv_flow_spec_type")
        .constified_enum_module("ibv_counter_description")
        .constified_enum_module("ibv_rereg_mr_err_code")
        .constified_enum_module("ib_uverbs_advise_mr_advice")
        .constified_enum_module("rdma_cm_event_type")
        .constified_enum_module("rdma_port_space");

    let bindings = builder
        .derive_copy(true)
        .derive_debug(false)
        .derive_default(true)
        .generate_comments(true)
        .layout_tests(false)
        .prepend_enum_name(false)
        .size_t_is_usize(true)
        .disable_untagged_union()
        .rustified_enum("ibv_event_type")
        .generate()
        .expect("failed to generate bindings");

    let out_dir = env::var_os("OUT_DIR").expect("OUT_DIR is set by cargo");
    let dest = Path::new(&out_dir).join("verbs_bindings.rs");
    bindings
        .write_to_file(dest)
        .expect("failed to write bindings");
}
