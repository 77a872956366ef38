use std::process::Command;

fn bin() -> Command {
    Command::new(env!("CARGO_BIN_EXE_rustml-qnbit-probe"))
}

fn run_ok(args: &[&str]) -> String {
    let output = bin().args(args).output().expect("failed to run probe");
    assert!(
        output.status.success(),
        "probe {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8(output.stdout).unwrap()
}

#[test]
fn test_info_lists_slots_and_variants() {
    let stdout = run_ok(&["info"]);
    assert!(stdout.contains("Kernel table:"));
    assert!(stdout.contains("q4bit_gemm_pack_quant_b_data_size"));
    assert!(stdout.contains("4-bit  int8  yes"));
    assert!(stdout.contains("8-bit  fp32  no"));
}

#[test]
fn test_sizes_float_compute_has_no_workspace() {
    let stdout = run_ok(&["sizes", "--compute", "fp32", "--n", "32", "--k", "64"]);
    // 32 columns x 2 blocks x 16 bytes
    assert!(stdout.contains("Packed B:            1024 bytes"), "{}", stdout);
    assert!(stdout.contains("Workspace per GEMM:  0 bytes"), "{}", stdout);
}

#[test]
fn test_sizes_int8_batch() {
    let stdout = run_ok(&["sizes", "--m", "2", "--n", "16", "--k", "64", "--batch", "3"]);
    // 2 rows x 2 blocks x (36 + 4) bytes
    assert!(stdout.contains("Workspace per GEMM:  160 bytes"), "{}", stdout);
    // 3 x 160 + 3 bytes of alignment slack
    assert!(stdout.contains("Workspace (batch 3): 483 bytes"), "{}", stdout);
}

#[test]
fn test_verify_scalar_all_compute_types() {
    let stdout = run_ok(&["verify", "--capability", "scalar", "--m", "3", "--n", "20", "--k", "96"]);
    for label in ["fp32", "fp16", "int8"] {
        assert!(stdout.contains(label), "missing {}: {}", label, stdout);
    }
    assert!(!stdout.contains("FAIL"));
}

#[test]
fn test_verify_eight_bit_skips_float_paths() {
    let stdout = run_ok(&["verify", "--bits", "8", "--zero-point", "--profile", "baseline"]);
    assert!(stdout.contains("fp32  unavailable"), "{}", stdout);
    assert!(stdout.contains("int8  max_abs="), "{}", stdout);
}

#[test]
fn test_invalid_blk_len_fails() {
    let output = bin().args(["sizes", "--blk-len", "48"]).output().unwrap();
    assert!(!output.status.success());
}
