//! Tests for the glibc hook's decision logic.
//!
//! Actual injection needs a container and root; the version and ABI
//! decisions that gate it are pure parsers over tool output.

use std::path::PathBuf;

use sarus::hooks::glibc::{
    find_libc, parse_elf_header, parse_glibc_version, parse_ldconfig_output,
};

// =============================================================================
// ldconfig Output
// =============================================================================

#[test]
fn test_ldconfig_cache_listing_is_parsed() {
    let output = "\t1512 libs found in cache `/etc/ld.so.cache'\n\
                  \tlibz.so.1 (libc6,x86-64) => /lib/x86_64-linux-gnu/libz.so.1\n\
                  \tlibc.so.6 (libc6,x86-64, OS ABI: Linux 3.2.0) => /lib/x86_64-linux-gnu/libc.so.6\n\
                  \tlibc.so.6 (libc6) => /lib32/libc.so.6\n";
    let libs = parse_ldconfig_output(output);
    assert_eq!(libs.len(), 3);
    assert_eq!(libs[0], PathBuf::from("/lib/x86_64-linux-gnu/libz.so.1"));
    assert_eq!(libs[2], PathBuf::from("/lib32/libc.so.6"));
}

#[test]
fn test_ldconfig_header_lines_are_skipped() {
    assert!(parse_ldconfig_output("\t0 libs found in cache\n").is_empty());
}

// =============================================================================
// ELF Headers
// =============================================================================

#[test]
fn test_elf64_header_is_recognized() {
    let output = "ELF Header:\n\
                  \x20 Magic:   7f 45 4c 46 02 01 01 00\n\
                  \x20 Class:                             ELF64\n\
                  \x20 Machine:                           Advanced Micro Devices X86-64\n";
    let header = parse_elf_header(output);
    assert!(header.is_64bit);
    assert_eq!(header.machine, "Advanced Micro Devices X86-64");
}

#[test]
fn test_elf32_header_is_not_64bit() {
    let output = "  Class:                             ELF32\n  Machine:                           Intel 80386\n";
    let header = parse_elf_header(output);
    assert!(!header.is_64bit);
}

#[test]
fn test_machine_mismatch_is_visible() {
    let amd = parse_elf_header("  Class: ELF64\n  Machine: Advanced Micro Devices X86-64\n");
    let arm = parse_elf_header("  Class: ELF64\n  Machine: AArch64\n");
    assert_ne!(amd.machine, arm.machine);
}

// =============================================================================
// Version Comparison (the no-op gate)
// =============================================================================

#[test]
fn test_highest_glibc_tag_wins() {
    let output = "  Version definition section '.gnu.version_d':\n\
                  \x20 Name: GLIBC_2.2.5\n\
                  \x20 Name: GLIBC_2.17\n\
                  \x20 Name: GLIBC_2.31\n\
                  \x20 Name: GLIBC_PRIVATE\n";
    assert_eq!(parse_glibc_version(output), Some((2, 31)));
}

#[test]
fn test_newer_container_glibc_means_no_injection() {
    // Scenario from the field: container ships 2.36, host has 2.31. The
    // container wins and the rootfs must stay untouched.
    let container = parse_glibc_version("Name: GLIBC_2.36").unwrap();
    let host = parse_glibc_version("Name: GLIBC_2.31").unwrap();
    assert!(container >= host);
}

#[test]
fn test_older_container_glibc_triggers_injection() {
    let container = parse_glibc_version("Name: GLIBC_2.17").unwrap();
    let host = parse_glibc_version("Name: GLIBC_2.31").unwrap();
    assert!(container < host);
}

#[test]
fn test_minor_versions_compare_numerically() {
    // 2.9 < 2.17 numerically although "2.9" > "2.17" lexically.
    let old = parse_glibc_version("Name: GLIBC_2.9").unwrap();
    let new = parse_glibc_version("Name: GLIBC_2.17").unwrap();
    assert!(old < new);
}

#[test]
fn test_no_tags_yields_none() {
    assert_eq!(parse_glibc_version("no versions here"), None);
}

// =============================================================================
// libc Discovery
// =============================================================================

#[test]
fn test_libc_is_found_by_soname_file_name() {
    let libs = vec![
        PathBuf::from("/rootfs/lib/libpthread.so.0"),
        PathBuf::from("/rootfs/lib/libc.so.6"),
        PathBuf::from("/rootfs/lib/libm.so.6"),
    ];
    assert_eq!(
        find_libc(&libs),
        Some(PathBuf::from("/rootfs/lib/libc.so.6"))
    );
}

#[test]
fn test_musl_only_container_has_no_libc() {
    // A musl container: the hook must treat this as "no glibc" and no-op.
    let libs = vec![PathBuf::from("/rootfs/lib/ld-musl-x86_64.so.1")];
    assert_eq!(find_libc(&libs), None);
}
